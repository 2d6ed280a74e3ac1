//! Record access over one logical file.

use crate::env::Environment;
use crate::keys::{RecordKey, StorageKey};
use crate::registry::OpenMode;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, IVec, Tree};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use trustchain_core::{BlockPos, DiskTxPos};

/// Format version written into every file at creation and on rewrite.
pub const DATABASE_VERSION: u32 = 2;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error opening database environment at {path:?}: {reason}")]
    EnvironmentOpen { path: PathBuf, reason: String },

    #[error("can't open database file {name}: {reason}")]
    FileOpen { name: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("deserialize error: {0}")]
    Deserialize(String),

    #[error("database file {0} is read-only")]
    ReadOnly(String),

    #[error("database file {0} is closed")]
    Closed(String),

    #[error("rewriting {name} failed: {reason}")]
    Compaction { name: String, reason: String },

    #[error("block not found at {0:?}")]
    BlockNotFound(BlockPos),

    #[error("transaction not found at {0:?}")]
    TxNotFound(DiskTxPos),

    #[error("operation cancelled by shutdown")]
    Cancelled,
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

pub(crate) fn encode_value<V: Serialize + ?Sized>(value: &V) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a stored value; failures are reported as corruption.
pub fn decode_value<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Deserialize(e.to_string()))
}

/// An open logical file.
///
/// Holds one reference on the file for its lifetime; [`Database::close`] (or
/// drop) releases it. Several `Database` values may share a file and be used
/// from different threads; record access needs no extra locking.
pub struct Database {
    env: Arc<Environment>,
    name: String,
    tree: Option<Tree>,
    read_only: bool,
    txn: Mutex<Option<PendingWrites>>,
}

/// Writes staged by a held transaction, keyed by encoded key. `None` marks
/// an erase.
#[derive(Default)]
struct PendingWrites {
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl PendingWrites {
    /// Whether `key` holds a value once the staged writes are applied.
    fn contains(&self, tree: &Tree, key: &[u8]) -> Result<bool> {
        match self.staged.get(key) {
            Some(entry) => Ok(entry.is_some()),
            None => Ok(tree.contains_key(key)?),
        }
    }

    fn into_batch(self) -> Batch {
        let mut batch = Batch::default();
        for (key, value) in self.staged {
            match value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        batch
    }
}

impl Database {
    /// Open `name` in the given mode (see [`OpenMode::parse`]).
    pub fn open(env: &Arc<Environment>, name: &str, mode: impl Into<OpenMode>) -> Result<Self> {
        let mode = mode.into();
        let tree = env.open_file(name, mode)?;
        Ok(Self {
            env: Arc::clone(env),
            name: name.to_string(),
            tree: Some(tree),
            read_only: mode.read_only,
            txn: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    fn tree(&self) -> Result<&Tree> {
        self.tree
            .as_ref()
            .ok_or_else(|| StorageError::Closed(self.name.clone()))
    }

    fn writable(&self) -> Result<&Tree> {
        if self.read_only {
            return Err(StorageError::ReadOnly(self.name.clone()));
        }
        self.tree()
    }

    /// Retrieve and deserialize a value.
    pub fn get<K, V>(&self, key: &K) -> Result<Option<V>>
    where
        K: StorageKey + ?Sized,
        V: DeserializeOwned,
    {
        match self.tree()?.get(key.encode_key())? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a value. Returns `false` without writing if the key exists and
    /// `overwrite` is not set.
    ///
    /// Inside a write transaction the write is staged until
    /// [`Database::txn_commit`].
    pub fn put<K, V>(&self, key: &K, value: &V, overwrite: bool) -> Result<bool>
    where
        K: StorageKey + ?Sized,
        V: Serialize + ?Sized,
    {
        let tree = self.writable()?;
        let key = key.encode_key();
        let value = encode_value(value)?;
        self.env.record_write(key.len() + value.len());

        let mut txn = self.txn.lock();
        if let Some(pending) = txn.as_mut() {
            if !overwrite && pending.contains(tree, &key)? {
                return Ok(false);
            }
            pending.staged.insert(key, Some(value));
            return Ok(true);
        }

        if overwrite {
            tree.insert(key, value)?;
            Ok(true)
        } else {
            Ok(tree
                .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
                .is_ok())
        }
    }

    /// Delete a key. Returns whether it was present, counting writes staged
    /// by a held transaction.
    pub fn erase<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let tree = self.writable()?;
        let key = key.encode_key();
        self.env.record_write(key.len());

        let mut txn = self.txn.lock();
        if let Some(pending) = txn.as_mut() {
            let existed = pending.contains(tree, &key)?;
            pending.staged.insert(key, None);
            return Ok(existed);
        }
        Ok(tree.remove(key)?.is_some())
    }

    /// Check if a key exists.
    pub fn exists<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        Ok(self.tree()?.contains_key(key.encode_key())?)
    }

    /// Ordered cursor over the whole file.
    pub fn cursor(&self) -> Result<Cursor> {
        let tree = self.tree()?.clone();
        let iter = tree.iter();
        Ok(Cursor { tree, iter })
    }

    /// Key of the last record whose key starts with `prefix`.
    pub fn last_key_with_prefix(&self, prefix: &[u8]) -> Result<Option<IVec>> {
        match self.tree()?.scan_prefix(prefix).next_back() {
            Some(item) => Ok(Some(item?.0)),
            None => Ok(None),
        }
    }

    pub fn read_version(&self) -> Result<Option<u32>> {
        self.get(&RecordKey::Version)
    }

    pub fn write_version(&self, version: u32) -> Result<bool> {
        self.put(&RecordKey::Version, &version, true)
    }

    /// Start a write transaction. Returns `false` if one is already held.
    pub fn txn_begin(&self) -> Result<bool> {
        self.writable()?;
        let mut txn = self.txn.lock();
        if txn.is_some() {
            return Ok(false);
        }
        *txn = Some(PendingWrites::default());
        Ok(true)
    }

    /// Apply the staged writes atomically. Returns `false` if no
    /// transaction was held.
    pub fn txn_commit(&self) -> Result<bool> {
        let tree = self.tree()?;
        let Some(pending) = self.txn.lock().take() else {
            return Ok(false);
        };
        tree.apply_batch(pending.into_batch())?;
        Ok(true)
    }

    /// Discard the staged writes. Returns `false` if no transaction was held.
    pub fn txn_abort(&self) -> bool {
        self.txn.lock().take().is_some()
    }

    /// Release this reference on the file. Any held write transaction is
    /// aborted. Idempotent.
    pub fn close(&mut self) {
        if self.tree.take().is_none() {
            return;
        }
        self.txn_abort();
        self.env.close_file(&self.name, self.read_only);
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forward cursor over a logical file in key order.
pub struct Cursor {
    tree: Tree,
    iter: sled::Iter,
}

impl Cursor {
    /// Position the cursor at the first key `>= key`.
    pub fn seek<K: StorageKey + ?Sized>(&mut self, key: &K) {
        self.iter = self.tree.range(key.encode_key()..);
    }

    /// Read the next record. `Ok(None)` means the cursor is exhausted,
    /// which is distinct from an I/O error.
    pub fn read_next(&mut self) -> Result<Option<(IVec, IVec)>> {
        match self.iter.next() {
            Some(item) => Ok(Some(item?)),
            None => Ok(None),
        }
    }
}
