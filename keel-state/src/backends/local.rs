//! Local file backend for state storage
//!
//! Each key is stored as `<dir>/<key>.state.json`. Snapshots are written to
//! a temporary file and renamed into place, so readers never see a partial
//! write. Locks are `<dir>/<key>.state.lock` files created exclusively.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::lock::LockInfo;
use keel_core::snapshot::StateSnapshot;
use keel_core::store::{StateStore, StoreError, StoreResult, check_write, ttl_to_chrono};
use tokio::sync::Mutex;

use crate::backend::BackendConfig;

/// Local file backend for development and simple use cases
///
/// Across processes, only lock acquisition is atomic (exclusive create).
/// Reclaiming an expired lock and the serial check on write are serialized
/// within one process only; a second process racing the same directory can
/// interleave with them. Use a remote backend for shared state.
pub struct LocalBackend {
    /// Directory holding state and lock files
    dir: PathBuf,
    /// Serializes read-check-write sequences within this process
    guard: Mutex<()>,
}

impl LocalBackend {
    /// Default state directory
    pub const DEFAULT_DIR: &'static str = ".keel";

    /// Create a new LocalBackend storing state under `dir`
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    /// Create a LocalBackend from configuration
    pub fn from_config(config: &BackendConfig) -> StoreResult<Self> {
        if config.attributes.contains_key("path") && config.get_string("path").is_none() {
            return Err(StoreError::configuration("'path' must be a string"));
        }
        let dir = config.get_string("path").unwrap_or(Self::DEFAULT_DIR);
        Ok(Self::with_dir(dir))
    }

    /// Get the state directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file for `key`
    pub fn state_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.state.json", key)))
    }

    fn lock_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.state.lock", key)))
    }

    fn ensure_dir(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StoreError::Io(format!(
                "Failed to create state directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::with_dir(Self::DEFAULT_DIR)
    }
}

/// Keys become file names, so only a conservative character set is allowed
fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::configuration(format!(
            "Invalid state key '{}': use letters, digits, '-', '_' or '.'",
            key
        )))
    }
}

fn read_snapshot(path: &Path) -> StoreResult<Option<StateSnapshot>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(format!("Failed to read state file: {}", e))),
    };

    let snapshot: StateSnapshot = serde_json::from_str(&content)
        .map_err(|e| StoreError::InvalidState(format!("Failed to parse state file: {}", e)))?;
    Ok(Some(snapshot))
}

fn write_snapshot(path: &Path, snapshot: &StateSnapshot) -> StoreResult<()> {
    let content = serde_json::to_string_pretty(snapshot)
        .map_err(|e| StoreError::Serialization(format!("Failed to serialize state: {}", e)))?;

    let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
    let result = fs::write(&tmp, content).and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Io(format!("Failed to write state file: {}", e)));
    }
    Ok(())
}

fn read_lock(path: &Path) -> StoreResult<Option<LockInfo>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(format!("Failed to read lock file: {}", e))),
    };

    let lock = serde_json::from_str(&content)
        .map_err(|e| StoreError::InvalidState(format!("Failed to parse lock file: {}", e)))?;
    Ok(Some(lock))
}

/// Create the lock file, failing with `AlreadyExists` if it is present
fn create_lock(path: &Path, lock: &LockInfo) -> std::io::Result<()> {
    let content = serde_json::to_string_pretty(lock)?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content.as_bytes())
}

fn remove_lock(path: &Path) -> StoreResult<()> {
    fs::remove_file(path)
        .map_err(|e| StoreError::Io(format!("Failed to remove lock file: {}", e)))
}

/// Remove the lock file only if it still carries `lock_id`
fn remove_lock_held_by(path: &Path, lock_id: &str) -> StoreResult<bool> {
    match read_lock(path)? {
        Some(current) if current.id == lock_id => {
            remove_lock(path)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[async_trait]
impl StateStore for LocalBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<StateSnapshot>> {
        read_snapshot(&self.state_path(key)?)
    }

    async fn write(
        &self,
        key: &str,
        snapshot: &StateSnapshot,
        read_serial: Option<u64>,
    ) -> StoreResult<()> {
        let path = self.state_path(key)?;
        let _guard = self.guard.lock().await;
        self.ensure_dir()?;

        let current = read_snapshot(&path)?;
        check_write(current.as_ref(), snapshot, read_serial)?;
        write_snapshot(&path, snapshot)?;
        log::debug!("Wrote {} at serial {}", path.display(), snapshot.serial);
        Ok(())
    }

    async fn try_lock(&self, key: &str, operation: &str, ttl: Duration) -> StoreResult<LockInfo> {
        let path = self.lock_path(key)?;
        let _guard = self.guard.lock().await;
        self.ensure_dir()?;

        let lock = LockInfo::with_ttl(operation, ttl_to_chrono(ttl));
        let io_error = |e: std::io::Error| StoreError::Io(format!("Failed to write lock file: {}", e));

        match create_lock(&path, &lock) {
            Ok(()) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_error(e)),
        }

        match read_lock(&path)? {
            Some(existing) if !existing.is_expired() => return Err(StoreError::locked(&existing)),
            Some(existing) => {
                log::warn!(
                    "Taking over expired lock {} held by {}",
                    existing.id,
                    existing.who
                );
                if !remove_lock_held_by(&path, &existing.id)? {
                    log::debug!("Lock {} changed hands before it could be reclaimed", existing.id);
                }
            }
            // Released in the meantime
            None => {}
        }

        match create_lock(&path, &lock) {
            Ok(()) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_lock(&path)? {
                Some(existing) => Err(StoreError::locked(&existing)),
                None => Err(io_error(e)),
            },
            Err(e) => Err(io_error(e)),
        }
    }

    async fn unlock(&self, key: &str, lock: &LockInfo) -> StoreResult<()> {
        self.force_unlock(key, &lock.id).await
    }

    async fn force_unlock(&self, key: &str, lock_id: &str) -> StoreResult<()> {
        let path = self.lock_path(key)?;
        let _guard = self.guard.lock().await;

        let existing =
            read_lock(&path)?.ok_or_else(|| StoreError::LockNotFound(lock_id.to_string()))?;
        if existing.id != lock_id {
            return Err(StoreError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        remove_lock(&path)
    }
}
