//! The shared storage environment.
//!
//! One [`Environment`] backs every logical file of a node. It owns the sled
//! database, the registry of open file handles, and the checkpoint clock.
//! Logical files map to sled trees through a small catalog kept in the
//! default tree, which is what lets a compaction swap a file's contents in
//! a single atomic write.

use crate::db::{Result, StorageError};
use crate::registry::FileRegistry;
use parking_lot::{Condvar, Mutex, MutexGuard};
use sled::Db;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Catalog key prefix in the default tree: logical name -> physical tree.
const CATALOG_PREFIX: &[u8] = b"catalog:";

/// Environment configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Node data directory; the engine lives in `<data_dir>/database`.
    pub data_dir: PathBuf,
    /// Page cache size in megabytes.
    pub cache_size_mb: u64,
    /// Log volume (megabytes) after which a close-time checkpoint is due.
    pub log_size_mb: u64,
    /// Detach every idle file on flush, including the keep-attached ones.
    pub force_detach: bool,
    /// Use a throwaway database that is removed on drop.
    pub temporary: bool,
}

impl EnvConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Configuration for an in-memory environment (for testing).
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("database")
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 25,
            log_size_mb: 100,
            force_detach: false,
            temporary: false,
        }
    }
}

/// Process shutdown flag shared by long-running scans and compaction.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Checkpoint thresholds. A checkpoint runs when either threshold has been
/// reached since the previous one; with both at zero it always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub min_log_kb: u64,
    pub min_minutes: u64,
}

impl Checkpoint {
    pub const FORCE: Self = Self {
        min_log_kb: 0,
        min_minutes: 0,
    };

    fn is_forced(&self) -> bool {
        self.min_log_kb == 0 && self.min_minutes == 0
    }
}

pub(crate) struct EnvState {
    pub(crate) db: Option<Db>,
    pub(crate) registry: FileRegistry,
    last_checkpoint: Instant,
}

/// The shared transactional store. Construct once per process with
/// [`Environment::open`] and share it as `Arc<Environment>`.
pub struct Environment {
    config: EnvConfig,
    state: Mutex<EnvState>,
    released: Condvar,
    shutdown: ShutdownSignal,
    initial_sync: AtomicBool,
    pending_log_bytes: AtomicU64,
}

impl Environment {
    /// Open the environment described by `config`.
    ///
    /// Fails with [`StorageError::EnvironmentOpen`] if the engine cannot be
    /// opened; callers should abort startup in that case.
    pub fn open(config: EnvConfig) -> Result<Arc<Self>> {
        let env = Arc::new(Self {
            config,
            state: Mutex::new(EnvState {
                db: None,
                registry: FileRegistry::default(),
                last_checkpoint: Instant::now(),
            }),
            released: Condvar::new(),
            shutdown: ShutdownSignal::new(),
            initial_sync: AtomicBool::new(false),
            pending_log_bytes: AtomicU64::new(0),
        });
        {
            let mut state = env.state.lock();
            env.ensure_open(&mut state)?;
        }
        Ok(env)
    }

    /// Open a throwaway in-memory environment (for testing).
    pub fn open_temporary() -> Result<Arc<Self>> {
        Self::open(EnvConfig::temporary())
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// The process shutdown flag observed by scans and compaction.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Mark whether the node is in its initial bulk sync; this stretches the
    /// checkpoint tolerance of the block index file.
    pub fn set_initial_sync(&self, syncing: bool) {
        self.initial_sync.store(syncing, Ordering::SeqCst);
    }

    pub fn is_initial_sync(&self) -> bool {
        self.initial_sync.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().db.is_some()
    }

    /// Open the engine if it is not running. Idempotent.
    pub(crate) fn ensure_open(&self, state: &mut EnvState) -> Result<Db> {
        if let Some(db) = &state.db {
            return Ok(db.clone());
        }
        if self.shutdown.is_requested() {
            return Err(StorageError::Cancelled);
        }

        let log_dir = self.config.log_dir();
        let mut sled_config = sled::Config::new()
            .cache_capacity(self.config.cache_size_mb.saturating_mul(1024 * 1024))
            .flush_every_ms(Some(500))
            .mode(sled::Mode::HighThroughput);
        if self.config.temporary {
            sled_config = sled_config.temporary(true);
        } else {
            std::fs::create_dir_all(&log_dir).map_err(|e| StorageError::EnvironmentOpen {
                path: log_dir.clone(),
                reason: e.to_string(),
            })?;
            sled_config = sled_config.path(&log_dir);
        }
        info!(
            log_dir = %log_dir.display(),
            cache_mb = self.config.cache_size_mb,
            temporary = self.config.temporary,
            "opening database environment"
        );

        let db = sled_config
            .open()
            .map_err(|e| StorageError::EnvironmentOpen {
                path: log_dir,
                reason: e.to_string(),
            })?;
        if db.was_recovered() {
            debug!("recovered existing database environment");
        }
        state.db = Some(db.clone());
        state.last_checkpoint = Instant::now();
        Ok(db)
    }

    /// Shut the engine down if no logical file is referenced.
    ///
    /// Returns `false` (and does nothing) while files are still open; the
    /// caller should close them and retry.
    pub fn shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if !state.registry.is_idle() {
            debug!(
                open_files = state.registry.open_count(),
                "environment shutdown deferred"
            );
            return false;
        }
        Self::close_engine(&mut state);
        true
    }

    pub(crate) fn close_engine(state: &mut EnvState) {
        state.registry.clear_handles();
        let Some(db) = state.db.take() else {
            return;
        };
        if let Err(e) = db.flush() {
            warn!(error = %e, "environment shutdown flush failed");
        }
        drop(db);
        info!("database environment closed");
    }

    /// Run a checkpoint against `policy`. Returns whether one ran.
    pub fn checkpoint(&self, policy: Checkpoint) -> Result<bool> {
        let mut state = self.state.lock();
        self.checkpoint_locked(&mut state, policy)
    }

    pub(crate) fn checkpoint_locked(&self, state: &mut EnvState, policy: Checkpoint) -> Result<bool> {
        let Some(db) = state.db.as_ref() else {
            return Ok(false);
        };

        let pending = self.pending_log_bytes.load(Ordering::SeqCst);
        let elapsed = state.last_checkpoint.elapsed();
        let due = policy.is_forced()
            || (policy.min_log_kb > 0 && pending >= policy.min_log_kb.saturating_mul(1024))
            || (policy.min_minutes > 0
                && elapsed >= Duration::from_secs(policy.min_minutes.saturating_mul(60)));
        if !due {
            return Ok(false);
        }

        let flushed = db.flush()?;
        self.pending_log_bytes.store(0, Ordering::SeqCst);
        state.last_checkpoint = Instant::now();
        debug!(flushed, pending, "checkpoint");
        Ok(true)
    }

    /// Account for bytes written since the last checkpoint.
    pub(crate) fn record_write(&self, bytes: usize) {
        self.pending_log_bytes
            .fetch_add(bytes as u64, Ordering::SeqCst);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EnvState> {
        self.state.lock()
    }

    /// Wait until a handle is released or `timeout` passes.
    pub(crate) fn wait_released(&self, state: &mut MutexGuard<'_, EnvState>, timeout: Duration) {
        let _ = self.released.wait_for(state, timeout);
    }

    pub(crate) fn notify_released(&self) {
        self.released.notify_all();
    }

    /// Whether a logical file with this name exists.
    pub fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.physical_name(name)?.is_some())
    }

    /// Name of the sled tree currently holding the logical file `name`.
    pub fn physical_name(&self, name: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        let db = self.ensure_open(&mut state)?;
        resolve(&db, name)
    }

    /// Whether a sled tree with this physical name is present.
    pub fn physical_exists(&self, physical: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let db = self.ensure_open(&mut state)?;
        Ok(db
            .tree_names()
            .iter()
            .any(|tree| &tree[..] == physical.as_bytes()))
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.registry.is_idle() {
            warn!(
                open_files = state.registry.open_count(),
                "environment dropped with open files"
            );
        }
        Self::close_engine(state);
    }
}

pub(crate) fn catalog_key(name: &str) -> Vec<u8> {
    let mut key = CATALOG_PREFIX.to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

pub(crate) fn resolve(db: &Db, name: &str) -> Result<Option<String>> {
    match db.get(catalog_key(name))? {
        Some(raw) => String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| StorageError::Deserialize(format!("catalog entry for {name}"))),
        None => Ok(None),
    }
}

/// Allocate a fresh physical tree name for the logical file `name`.
pub(crate) fn allocate_physical(db: &Db, name: &str) -> Result<String> {
    Ok(format!("{name}#{}", db.generate_id()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_temporary() {
        let env = Environment::open_temporary().unwrap();
        assert!(env.is_open());
        assert!(!env.file_exists("blkindex.dat").unwrap());
    }

    #[test]
    fn test_shutdown_and_reopen() {
        let env = Environment::open_temporary().unwrap();
        assert!(env.shutdown());
        assert!(!env.is_open());

        // Any use reopens the engine.
        assert!(!env.file_exists("wallet.dat").unwrap());
        assert!(env.is_open());
    }

    #[test]
    fn test_reopen_refused_after_shutdown_signal() {
        let env = Environment::open_temporary().unwrap();
        assert!(env.shutdown());
        env.shutdown_signal().request();
        assert!(matches!(
            env.file_exists("wallet.dat"),
            Err(StorageError::Cancelled)
        ));
    }

    #[test]
    fn test_checkpoint_thresholds() {
        let env = Environment::open_temporary().unwrap();
        let lazy = Checkpoint {
            min_log_kb: 1,
            min_minutes: 60,
        };
        assert!(!env.checkpoint(lazy).unwrap());

        env.record_write(2048);
        assert!(env.checkpoint(lazy).unwrap());
        assert!(!env.checkpoint(lazy).unwrap());

        assert!(env.checkpoint(Checkpoint::FORCE).unwrap());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(EnvConfig::new(dir.path())).unwrap();
        assert!(env.is_open());
        assert!(dir.path().join("database").exists());
    }
}
