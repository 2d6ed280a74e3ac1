//! Core blockchain primitives for trustchain.
//!
//! This crate provides the fundamental types shared by the storage layer and
//! the block index loader:
//! - Hashes and addresses
//! - Transactions and blocks
//! - Disk locators and index records
//! - Peer address snapshots

pub mod address;
pub mod block;
pub mod hash;
pub mod index;
pub mod merkle;
pub mod peer;
pub mod transaction;

// Re-export commonly used types at the crate root
pub use address::Address;
pub use block::{Block, BlockHeader, CHANNEL_HASH, CHANNEL_PRIME, CHANNEL_STAKE};
pub use hash::{hash, hash_concat, Hash};
pub use index::{BlockPos, ChainTrust, DiskBlockIndex, DiskTxPos, TxIndex};
pub use merkle::merkle_root;
pub use peer::{AddrEntry, AddrMan, PeerAddress};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
