//! Consensus collaborators used while rebuilding the block index.

use crate::error::Result;
use crate::index::{BlockIndex, BlockIndexMap};
use std::collections::{HashMap, HashSet};
use trustchain_core::{Address, Block, ChainTrust, Hash, Transaction, CHANNEL_HASH, CHANNEL_PRIME};
use trustchain_storage::{BlockReader, TxDb};

/// Structural checks and per-block economics.
pub trait ChainRules {
    /// Context-free block check.
    fn check_block(&self, block: &Block) -> bool;

    /// Context-free transaction check.
    fn check_transaction(&self, tx: &Transaction) -> bool;

    /// Trust contributed by this block alone.
    fn block_trust(&self, node: &BlockIndex) -> ChainTrust;

    /// Reserve released on the node's channel by this block, per reward kind.
    fn released_reserve(&self, node: &BlockIndex, kind: usize) -> i64;

    /// Whether `node` hardens a new checkpoint. The node's parent and its
    /// pending checkpoint are already loaded in `index`.
    fn harden_checkpoint(&self, node: &BlockIndex, index: &BlockIndexMap) -> bool;
}

/// Tracks proof-of-stake trust keys.
pub trait TrustPool {
    fn accept(&mut self, block: &Block) -> bool;
}

/// Moves the best chain pointer back to `block`, undoing everything above it.
pub trait BestChainWriter {
    fn set_best_chain(
        &mut self,
        txdb: &TxDb,
        reader: &dyn BlockReader,
        index: &mut BlockIndexMap,
        block: &Block,
    ) -> Result<()>;
}

// =============================================================================
// Standard Rules
// =============================================================================

/// Minimum time between two hardened checkpoints, in seconds.
pub const CHECKPOINT_TIMESPAN: u32 = 30 * 60;

/// Reserve released per block, indexed by channel then reward kind.
pub const RESERVE_SCHEDULE: [[i64; 3]; 3] = [[0, 0, 0], [40, 2, 1], [40, 2, 1]];

/// Default rules: merkle and coinbase structure, trust inversely
/// proportional to the compact target, and a fixed reserve schedule.
#[derive(Debug, Clone, Default)]
pub struct StandardRules;

impl StandardRules {
    pub fn new() -> Self {
        Self
    }
}

impl ChainRules for StandardRules {
    fn check_block(&self, block: &Block) -> bool {
        let Some((first, rest)) = block.transactions.split_first() else {
            return false;
        };
        if !first.is_coinbase() || rest.iter().any(Transaction::is_coinbase) {
            return false;
        }
        let mut seen = HashSet::new();
        if !block.transactions.iter().all(|tx| seen.insert(tx.hash())) {
            return false;
        }
        block.verify_merkle_root() && block.transactions.iter().all(|tx| self.check_transaction(tx))
    }

    fn check_transaction(&self, tx: &Transaction) -> bool {
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return false;
        }
        if tx.is_coinbase() {
            return true;
        }
        let mut seen = HashSet::new();
        tx.inputs
            .iter()
            .all(|input| !input.prevout.is_null() && seen.insert(input.prevout))
    }

    fn block_trust(&self, node: &BlockIndex) -> ChainTrust {
        (1u128 << 64) / (ChainTrust::from(node.bits) + 1)
    }

    fn released_reserve(&self, node: &BlockIndex, kind: usize) -> i64 {
        match node.channel {
            CHANNEL_PRIME | CHANNEL_HASH => RESERVE_SCHEDULE[node.channel as usize]
                .get(kind)
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn harden_checkpoint(&self, node: &BlockIndex, index: &BlockIndexMap) -> bool {
        let Some(parent) = node.prev.and_then(|prev| index.get(&prev)) else {
            return false;
        };
        let Some(checkpoint) = index.get(&parent.pending_checkpoint.1) else {
            return false;
        };
        node.time.saturating_sub(checkpoint.time) >= CHECKPOINT_TIMESPAN
    }
}

// =============================================================================
// Trust Keys
// =============================================================================

/// A proof-of-stake key and the blocks it has produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustKey {
    pub address: Address,
    pub first_block: Hash,
    pub last_time: u32,
    pub blocks: u32,
}

/// Trust pool keyed by the staking address of each coinstake.
#[derive(Debug, Default)]
pub struct TrustKeyPool {
    keys: HashMap<Address, TrustKey>,
}

impl TrustKeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<&TrustKey> {
        self.keys.get(address)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl TrustPool for TrustKeyPool {
    /// Accept a stake block whose coinstake pays a staking address and whose
    /// time does not precede that key's previous block.
    fn accept(&mut self, block: &Block) -> bool {
        if !block.is_proof_of_stake() {
            return false;
        }
        let Some(address) = block
            .transactions
            .first()
            .and_then(|coinstake| coinstake.outputs.first())
            .and_then(|out| out.recipient)
        else {
            return false;
        };

        let time = block.header.time;
        match self.keys.get_mut(&address) {
            Some(key) => {
                if time < key.last_time {
                    return false;
                }
                key.last_time = time;
                key.blocks += 1;
            }
            None => {
                self.keys.insert(
                    address,
                    TrustKey {
                        address,
                        first_block: block.hash(),
                        last_time: time,
                        blocks: 1,
                    },
                );
            }
        }
        true
    }
}
