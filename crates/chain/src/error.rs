//! Chain loading errors.

use thiserror::Error;
use trustchain_core::Hash;
use trustchain_storage::StorageError;

/// Errors that end a block index load.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("hashBestChain not loaded")]
    MissingBestChain,

    #[error("hashBestChain {0} not found in the block index")]
    BestChainNotIndexed(Hash),

    #[error("genesis block not found in the block index")]
    MissingGenesis,

    #[error("chain broken at height {height} ({hash}): next block link missing")]
    BrokenChain { height: u32, hash: Hash },

    #[error("failed to accept trust key block {0}")]
    TrustKeyRejected(Hash),

    #[error("block {hash} could not be read: {source}")]
    BlockUnreadable {
        hash: Hash,
        #[source]
        source: StorageError,
    },
}

pub type Result<T> = std::result::Result<T, ChainError>;
