//! Persistent storage layer for trustchain.
//!
//! One shared [`Environment`] (a sled database) backs several logical files,
//! each an ordered key/value store:
//! - `blkindex.dat`: transaction index, block index, chain pointers
//! - `addr.dat`: peer address snapshot
//! - `blk0001.dat`: block bodies
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │      TxDb          AddrDb          BlockStore        │
//! │  (typed facades over tagged records)                 │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────┐
//! │  Database (record access)          Compactor         │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────┐
//! │  Environment: engine lifecycle, file registry,       │
//! │  checkpoints, shutdown signal                        │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//!                    sled database
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use trustchain_storage::{EnvConfig, Environment, TxDb};
//!
//! let env = Environment::open(EnvConfig::new("./data")).unwrap();
//! let txdb = TxDb::open(&env, "r+").unwrap();
//! let best = txdb.read_hash_best_chain().unwrap();
//! println!("best chain: {best:?}");
//! ```

pub mod addrdb;
pub mod blocks;
pub mod compact;
pub mod db;
pub mod env;
pub mod keys;
pub mod registry;
pub mod txdb;

// Re-export commonly used types
pub use addrdb::AddrDb;
pub use blocks::{BlockReader, BlockStore, BLOCK_FILE, BLOCK_FILE_NUMBER};
pub use compact::Compactor;
pub use db::{decode_value, Cursor, Database, Result, StorageError, DATABASE_VERSION};
pub use env::{Checkpoint, EnvConfig, Environment, ShutdownSignal};
pub use keys::{tag, RecordKey, StorageKey};
pub use registry::{OpenMode, ADDR_FILE, BLOCK_INDEX_FILE};
pub use txdb::TxDb;
