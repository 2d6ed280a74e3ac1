//! Block index loading for trustchain.
//!
//! This crate rebuilds the in-memory block index from the storage layer:
//! - **Index**: arena of block index nodes keyed by hash
//! - **Loader**: scan, anchor, walk-forward, and verification of recent blocks
//! - **Rules**: consensus collaborators (structural checks, trust, reserves,
//!   checkpoints, trust keys)
//! - **Rewind**: moving the best chain back when verification fails
//!
//! # Example
//!
//! ```rust,no_run
//! use trustchain_chain::{ChainIndexLoader, VerifyConfig};
//! use trustchain_storage::{BlockStore, EnvConfig, Environment, TxDb};
//!
//! let env = Environment::open(EnvConfig::new("./data")).unwrap();
//! let txdb = TxDb::open(&env, "r+").unwrap();
//! let blocks = BlockStore::open(&env).unwrap();
//!
//! let mut loader = ChainIndexLoader::new(&txdb, &blocks, VerifyConfig::default());
//! let report = loader.load().unwrap();
//! println!("best height {}", report.best_height);
//! ```

pub mod connect;
pub mod error;
pub mod index;
pub mod loader;
pub mod rewind;
pub mod rules;

// Re-export commonly used types
pub use connect::connect_block;
pub use error::{ChainError, Result};
pub use index::{BlockIndex, BlockIndexMap};
pub use loader::{coinbase_rewards, ChainIndexLoader, ForkSelection, LoadReport, VerifyConfig};
pub use rewind::IndexRewinder;
pub use rules::{
    BestChainWriter, ChainRules, StandardRules, TrustKey, TrustKeyPool, TrustPool,
    CHECKPOINT_TIMESPAN, RESERVE_SCHEDULE,
};
