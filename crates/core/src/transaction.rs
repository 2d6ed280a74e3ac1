//! Transactions, inputs, and outputs.

use crate::address::Address;
use crate::hash::{hash, Hash};
use serde::{Deserialize, Serialize};

/// Reference to a specific output of an earlier transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub n: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, n: u32) -> Self {
        Self { hash, n }
    }

    /// The outpoint carried by a coinbase input.
    pub fn null() -> Self {
        Self {
            hash: Hash::ZERO,
            n: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.n == u32::MAX
    }
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    /// Unlocking data; opaque to the storage layer.
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    /// Recipient, or `None` when the output does not pay a standard address.
    pub recipient: Option<Address>,
}

impl TxOut {
    pub fn new(value: u64, recipient: Option<Address>) -> Self {
        Self { value, recipient }
    }

    pub fn to(value: u64, recipient: Address) -> Self {
        Self::new(value, Some(recipient))
    }
}

/// A transaction on the blockchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub time: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(time: u32, inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Self {
            version: 1,
            time,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Create a coinbase transaction. `tag` keeps coinbases of different
    /// blocks distinct.
    pub fn coinbase(time: u32, tag: u32, outputs: Vec<TxOut>) -> Self {
        let mut input = TxIn::new(OutPoint::null());
        input.script_sig = tag.to_be_bytes().to_vec();
        Self::new(time, vec![input], outputs)
    }

    /// Transaction hash (Blake3 over the bincode encoding).
    pub fn hash(&self) -> Hash {
        let encoded = bincode::serialize(self).expect("serialization should not fail");
        hash(&encoded)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Sum of all output values.
    pub fn value_out(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |acc, out| acc.saturating_add(out.value))
    }
}
