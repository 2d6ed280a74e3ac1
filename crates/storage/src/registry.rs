//! Open-file bookkeeping: use counts, cached handles, and the
//! checkpoint-on-close policy.

use crate::db::{encode_value, Result, StorageError, DATABASE_VERSION};
use crate::env::{allocate_physical, catalog_key, resolve, Checkpoint, Environment};
use crate::keys::RecordKey;
use sled::{Db, Tree};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Block index file; stays attached across flushes and gets a longer
/// checkpoint tolerance during initial sync.
pub const BLOCK_INDEX_FILE: &str = "blkindex.dat";
/// Peer address file; stays attached across flushes.
pub const ADDR_FILE: &str = "addr.dat";

/// How a logical file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read_only: bool,
    pub create: bool,
}

impl OpenMode {
    pub const READ: Self = Self {
        read_only: true,
        create: false,
    };
    pub const READ_WRITE: Self = Self {
        read_only: false,
        create: false,
    };
    pub const CREATE: Self = Self {
        read_only: false,
        create: true,
    };

    /// Parse a mode string: `+` or `w` make the file writable, `c` creates
    /// it when missing ("r", "r+", "w", "cr+").
    pub fn parse(mode: &str) -> Self {
        Self {
            read_only: !mode.contains('+') && !mode.contains('w'),
            create: mode.contains('c'),
        }
    }
}

impl From<&str> for OpenMode {
    fn from(mode: &str) -> Self {
        Self::parse(mode)
    }
}

/// Use counts per logical file, plus the engine handle of every file that
/// is open or parked (unreferenced but not yet flushed out).
#[derive(Default)]
pub(crate) struct FileRegistry {
    use_counts: BTreeMap<String, usize>,
    handles: BTreeMap<String, Tree>,
}

impl FileRegistry {
    pub(crate) fn acquire(&mut self, name: &str) -> usize {
        let count = self.use_counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one reference. The tracking entry disappears at zero; releasing
    /// an untracked file is a no-op.
    pub(crate) fn release(&mut self, name: &str) -> usize {
        let Some(count) = self.use_counts.get_mut(name) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.use_counts.remove(name);
        }
        remaining
    }

    pub(crate) fn use_count(&self, name: &str) -> usize {
        self.use_counts.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn is_tracked(&self, name: &str) -> bool {
        self.use_counts.contains_key(name)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.use_counts.is_empty()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.use_counts.len()
    }

    pub(crate) fn handle(&self, name: &str) -> Option<Tree> {
        self.handles.get(name).cloned()
    }

    pub(crate) fn insert_handle(&mut self, name: &str, tree: Tree) {
        self.handles.insert(name.to_string(), tree);
    }

    pub(crate) fn take_handle(&mut self, name: &str) -> Option<Tree> {
        self.handles.remove(name)
    }

    /// Files whose handle is cached but which nobody references.
    pub(crate) fn parked(&self) -> Vec<String> {
        self.handles
            .keys()
            .filter(|name| !self.use_counts.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    pub(crate) fn clear_handles(&mut self) {
        self.handles.clear();
    }
}

impl Environment {
    /// Take a reference on `name` and return its engine handle, opening
    /// (and, in create mode, creating and version-stamping) it if needed.
    pub(crate) fn open_file(&self, name: &str, mode: OpenMode) -> Result<Tree> {
        let mut state = self.lock_state();
        let db = self.ensure_open(&mut state)?;

        state.registry.acquire(name);
        if let Some(tree) = state.registry.handle(name) {
            return Ok(tree);
        }

        match open_tree(&db, name, mode) {
            Ok(tree) => {
                state.registry.insert_handle(name, tree.clone());
                debug!(file = name, "opened database file");
                Ok(tree)
            }
            Err(e) => {
                state.registry.release(name);
                Err(StorageError::FileOpen {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Drop a reference on `name`, checkpointing with the file's tolerance
    /// first. The count is decremented last.
    pub(crate) fn close_file(&self, name: &str, read_only: bool) {
        let policy = self.close_checkpoint(name, read_only);
        let mut state = self.lock_state();
        if let Err(e) = self.checkpoint_locked(&mut state, policy) {
            warn!(file = name, error = %e, "checkpoint on close failed");
        }
        if state.registry.release(name) == 0 {
            self.notify_released();
        }
    }

    /// Checkpoint tolerance for closing `name`.
    pub fn close_checkpoint(&self, name: &str, read_only: bool) -> Checkpoint {
        let mut minutes = 0;
        if read_only {
            minutes = 1;
        }
        if name == ADDR_FILE || name == BLOCK_INDEX_FILE {
            minutes = 2;
        }
        if name == BLOCK_INDEX_FILE && self.is_initial_sync() {
            minutes = 5;
        }

        if minutes == 0 {
            Checkpoint::FORCE
        } else {
            Checkpoint {
                min_log_kb: self.config().log_size_mb.saturating_mul(1024),
                min_minutes: minutes,
            }
        }
    }

    /// Number of live references on `name`.
    pub fn use_count(&self, name: &str) -> usize {
        self.lock_state().registry.use_count(name)
    }

    /// Whether `name` has any live reference.
    pub fn is_tracked(&self, name: &str) -> bool {
        self.lock_state().registry.is_tracked(name)
    }

    /// Close every unreferenced file, checkpointing and detaching each. With
    /// `shutdown` set and nothing referenced, the engine is shut down too.
    pub fn flush_all(&self, shutdown: bool) {
        let mut state = self.lock_state();
        if state.db.is_none() {
            debug!(shutdown, "flush skipped, environment not started");
            return;
        }

        for name in state.registry.parked() {
            let Some(tree) = state.registry.take_handle(&name) else {
                continue;
            };
            if let Err(e) = self.checkpoint_locked(&mut state, Checkpoint::FORCE) {
                warn!(file = %name, error = %e, "checkpoint failed");
            }
            if self.detaches(&name) {
                if let Err(e) = tree.flush() {
                    warn!(file = %name, error = %e, "detach failed");
                } else {
                    debug!(file = %name, "detached");
                }
            }
            debug!(file = %name, "closed");
        }

        if shutdown && state.registry.is_idle() {
            info!("flushed all files, shutting down environment");
            Environment::close_engine(&mut state);
        }
    }

    fn detaches(&self, name: &str) -> bool {
        self.config().force_detach || (name != BLOCK_INDEX_FILE && name != ADDR_FILE)
    }

    #[cfg(test)]
    pub(crate) fn has_handle(&self, name: &str) -> bool {
        self.lock_state().registry.handle(name).is_some()
    }
}

fn open_tree(db: &Db, name: &str, mode: OpenMode) -> Result<Tree> {
    let physical = match resolve(db, name)? {
        Some(physical) => physical,
        None if mode.create => {
            let physical = allocate_physical(db, name)?;
            db.insert(catalog_key(name), physical.as_bytes())?;
            physical
        }
        None => {
            return Err(StorageError::FileOpen {
                name: name.to_string(),
                reason: "no such file".to_string(),
            })
        }
    };

    let tree = db.open_tree(&physical)?;
    if mode.create {
        let version_key = RecordKey::Version.encode();
        if !tree.contains_key(&version_key)? {
            tree.insert(version_key, encode_value(&DATABASE_VERSION)?)?;
        }
    }
    Ok(tree)
}
