//! Block and block header structures.

use crate::hash::{hash, Hash};
use crate::merkle::merkle_root;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// Channel of blocks produced by proof of stake.
pub const CHANNEL_STAKE: u32 = 0;
/// Channel of blocks mined on the prime proof-of-work channel.
pub const CHANNEL_PRIME: u32 = 1;
/// Channel of blocks mined on the hash proof-of-work channel.
pub const CHANNEL_HASH: u32 = 2;

/// The header of a block. The block hash covers exactly these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block (zero for genesis).
    pub prev_hash: Hash,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash,
    /// Production channel (stake, prime, hash).
    pub channel: u32,
    pub height: u32,
    /// Compact difficulty target.
    pub bits: u32,
    pub nonce: u64,
    /// Unix timestamp in seconds.
    pub time: u32,
}

impl BlockHeader {
    /// Calculate the hash of this block header.
    pub fn hash(&self) -> Hash {
        let encoded = bincode::serialize(self).expect("serialization should not fail");
        hash(&encoded)
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.channel == CHANNEL_STAKE
    }

    pub fn is_proof_of_work(&self) -> bool {
        self.channel == CHANNEL_PRIME || self.channel == CHANNEL_HASH
    }
}

/// A complete block: header plus transactions. The first transaction is the
/// coinbase (or coinstake on the stake channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a block, computing its merkle root from `transactions`.
    pub fn new(
        prev_hash: Hash,
        height: u32,
        channel: u32,
        time: u32,
        bits: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let mut block = Self {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: Hash::ZERO,
                channel,
                height,
                bits,
                nonce: 0,
                time,
            },
            transactions,
        };
        block.header.merkle_root = block.build_merkle_root();
        block
    }

    /// Get the block hash (hash of the header).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.header.is_proof_of_stake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        self.header.is_proof_of_work()
    }

    /// Merkle root computed from the transactions currently in the block.
    pub fn build_merkle_root(&self) -> Hash {
        let tx_hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&tx_hashes)
    }

    /// Verify the merkle root matches the transactions.
    pub fn verify_merkle_root(&self) -> bool {
        self.build_merkle_root() == self.header.merkle_root
    }

    /// The coinbase transaction, if the block has one.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::transaction::TxOut;

    fn coinbase_block(height: u32, channel: u32) -> Block {
        let cb = Transaction::coinbase(1_000, height, vec![TxOut::to(50, Address([1; 20]))]);
        Block::new(Hash::ZERO, height, channel, 1_000 + height, 0x1d00ffff, vec![cb])
    }

    #[test]
    fn test_block_hash_deterministic() {
        let block = coinbase_block(1, CHANNEL_HASH);
        assert_eq!(block.hash(), block.hash());
        assert_ne!(block.hash(), coinbase_block(2, CHANNEL_HASH).hash());
    }

    #[test]
    fn test_channels() {
        assert!(coinbase_block(1, CHANNEL_STAKE).is_proof_of_stake());
        assert!(coinbase_block(1, CHANNEL_PRIME).is_proof_of_work());
        assert!(coinbase_block(1, CHANNEL_HASH).is_proof_of_work());
        assert!(!coinbase_block(1, CHANNEL_HASH).is_proof_of_stake());
    }

    #[test]
    fn test_merkle_root_verification() {
        let mut block = coinbase_block(3, CHANNEL_PRIME);
        assert!(block.verify_merkle_root());
        assert!(block.coinbase().is_some());

        block.transactions.push(Transaction::coinbase(5, 5, vec![]));
        assert!(!block.verify_merkle_root());
    }
}
