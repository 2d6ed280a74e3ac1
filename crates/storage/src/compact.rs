//! Offline rewrite of a logical file.

use crate::db::{encode_value, Result, StorageError, DATABASE_VERSION};
use crate::env::{allocate_physical, catalog_key, resolve, Checkpoint, Environment};
use crate::keys::RecordKey;
use sled::{Batch, Db, IVec};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on one wait for the target file to be released.
const RELEASE_POLL: Duration = Duration::from_millis(100);

/// Rewrites logical files into fresh storage, optionally dropping every
/// record under a key prefix.
pub struct Compactor {
    env: Arc<Environment>,
}

impl Compactor {
    pub fn new(env: &Arc<Environment>) -> Self {
        Self {
            env: Arc::clone(env),
        }
    }

    /// Rewrite `name`, skipping keys that start with `skip`.
    ///
    /// Blocks until nobody references the file; returns
    /// [`StorageError::Cancelled`] if shutdown is requested meanwhile. On a
    /// copy error the original file is left untouched. The replacement
    /// becomes visible through a single catalog write, so readers see
    /// either the old or the new content in full.
    pub fn rewrite(&self, name: &str, skip: Option<&[u8]>) -> Result<()> {
        let shutdown = self.env.shutdown_signal();
        let mut state = self.env.lock_state();
        loop {
            if shutdown.is_requested() {
                return Err(StorageError::Cancelled);
            }
            if state.registry.use_count(name) == 0 {
                break;
            }
            self.env.wait_released(&mut state, RELEASE_POLL);
        }

        let db = self.env.ensure_open(&mut state)?;
        let original = resolve(&db, name)?.ok_or_else(|| StorageError::Compaction {
            name: name.to_string(),
            reason: "no such file".to_string(),
        })?;

        // Flush everything the parked handle may still hold.
        state.registry.take_handle(name);
        self.env.checkpoint_locked(&mut state, Checkpoint::FORCE)?;

        info!(file = name, "rewriting");
        let temp_name = format!("{name}.rewrite");
        let replacement = allocate_physical(&db, name)?;
        db.insert(catalog_key(&temp_name), replacement.as_bytes())?;

        let copied = match copy_records(&db, &original, &replacement, skip)
            .and_then(|copied| swap(&db, name, &temp_name, &replacement).map(|_| copied))
        {
            Ok(copied) => copied,
            Err(e) => {
                discard(&db, &temp_name, &replacement);
                warn!(file = name, error = %e, "rewrite failed");
                return Err(StorageError::Compaction {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = db.drop_tree(original.as_bytes()) {
            warn!(file = name, error = %e, "failed to remove pre-rewrite data");
        }
        info!(file = name, records = copied, "rewrite complete");
        Ok(())
    }
}

fn copy_records(db: &Db, from: &str, to: &str, skip: Option<&[u8]>) -> Result<usize> {
    let source = db.open_tree(from)?;
    let target = db.open_tree(to)?;
    let version_key = RecordKey::Version.encode();

    let mut copied = 0;
    for item in source.iter() {
        let (key, value) = item?;
        if skip.is_some_and(|prefix| key.starts_with(prefix)) {
            continue;
        }
        let value = if key[..] == version_key[..] {
            IVec::from(encode_value(&DATABASE_VERSION)?)
        } else {
            value
        };
        if target
            .compare_and_swap(&key, None as Option<&[u8]>, Some(value))?
            .is_err()
        {
            return Err(StorageError::Compaction {
                name: to.to_string(),
                reason: "duplicate key while copying".to_string(),
            });
        }
        copied += 1;
    }
    target.flush()?;
    Ok(copied)
}

/// Point `name` at the replacement and drop the temporary name, atomically.
fn swap(db: &Db, name: &str, temp_name: &str, replacement: &str) -> Result<()> {
    let mut batch = Batch::default();
    batch.insert(catalog_key(name), replacement.as_bytes());
    batch.remove(catalog_key(temp_name));
    db.apply_batch(batch)?;
    db.flush()?;
    Ok(())
}

fn discard(db: &Db, temp_name: &str, replacement: &str) {
    if let Err(e) = db.remove(catalog_key(temp_name)) {
        warn!(error = %e, "failed to remove temporary catalog entry");
    }
    if let Err(e) = db.drop_tree(replacement.as_bytes()) {
        warn!(error = %e, "failed to drop partial rewrite");
    }
}
