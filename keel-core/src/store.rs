//! State Store contract and the in-memory store
//!
//! A store persists one snapshot per key. Writes are compare-and-swap on the
//! serial the writer read, and locks are advisory with a TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::lock::{LockInfo, LockRequest};
use crate::snapshot::StateSnapshot;

/// Interval between attempts while waiting for a busy lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors that can occur when interacting with a State Store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state is locked by another process
    #[error("State is locked by {who} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
    },

    /// The lock was not found (for release/force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// The stored serial is not the one the writer read
    #[error(
        "State changed since it was read (read serial {}, stored serial {}); re-read and re-plan",
        display_serial(.expected),
        display_serial(.actual)
    )]
    Conflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// State lineage mismatch (prevents accidental state overwrites)
    #[error("State lineage mismatch: expected {expected}, got {actual}")]
    LineageMismatch { expected: String, actual: String },

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// State file is corrupted or invalid
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn display_serial(serial: &Option<u64>) -> String {
    match serial {
        Some(s) => s.to_string(),
        None => "none".to_string(),
    }
}

impl StoreError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the caller may simply try again (after re-reading for conflicts)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::Conflict { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Check a write against the currently stored snapshot
///
/// Shared by every store so compare-and-swap behaves identically.
pub fn check_write(
    current: Option<&StateSnapshot>,
    snapshot: &StateSnapshot,
    read_serial: Option<u64>,
) -> StoreResult<()> {
    let stored_serial = current.map(|s| s.serial);
    if stored_serial != read_serial {
        return Err(StoreError::Conflict {
            expected: read_serial,
            actual: stored_serial,
        });
    }

    if let Some(current) = current {
        if current.lineage != snapshot.lineage {
            return Err(StoreError::LineageMismatch {
                expected: current.lineage.clone(),
                actual: snapshot.lineage.clone(),
            });
        }
        if snapshot.serial <= current.serial {
            return Err(StoreError::InvalidState(format!(
                "serial must increase (stored {}, written {})",
                current.serial, snapshot.serial
            )));
        }
    }

    Ok(())
}

/// Trait for State Stores
///
/// Every snapshot becomes visible atomically: a reader never observes a
/// partially written snapshot.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the snapshot stored under `key`
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn get(&self, key: &str) -> StoreResult<Option<StateSnapshot>>;

    /// Write a snapshot if the stored serial still equals `read_serial`
    ///
    /// `read_serial` is `None` when the writer found no snapshot. A mismatch
    /// yields `StoreError::Conflict`.
    async fn write(
        &self,
        key: &str,
        snapshot: &StateSnapshot,
        read_serial: Option<u64>,
    ) -> StoreResult<()>;

    /// Acquire the lock once, failing with `Locked` if it is held
    ///
    /// An expired lock is taken over.
    async fn try_lock(&self, key: &str, operation: &str, ttl: Duration) -> StoreResult<LockInfo>;

    /// Release a previously acquired lock
    async fn unlock(&self, key: &str, lock: &LockInfo) -> StoreResult<()>;

    /// Force release a lock by its ID
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, key: &str, lock_id: &str) -> StoreResult<()>;

    /// Acquire the lock, waiting up to `request.timeout` while it is busy
    async fn lock(&self, key: &str, request: &LockRequest) -> StoreResult<LockInfo> {
        // A timeout too large to represent waits forever
        let deadline = tokio::time::Instant::now().checked_add(request.timeout);
        loop {
            match self.try_lock(key, &request.operation, request.ttl).await {
                Err(StoreError::Locked { .. })
                    if deadline.is_none_or(|d| tokio::time::Instant::now() < d) =>
                {
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                result => return result,
            }
        }
    }
}

/// Longest TTL handed out; keeps expiry arithmetic from overflowing
const MAX_LOCK_TTL_DAYS: i64 = 36_500;

/// Convert a lock TTL to the chrono duration stored in `LockInfo`
pub fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(MAX_LOCK_TTL_DAYS);
    chrono::Duration::from_std(ttl).map_or(cap, |d| d.min(cap))
}

#[derive(Default)]
struct MemoryEntry {
    snapshot: Option<StateSnapshot>,
    lock: Option<LockInfo>,
}

/// Store keeping snapshots in process memory
///
/// Used for previews and tests; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding `snapshot` under `key`
    pub fn with_snapshot(key: impl Into<String>, snapshot: StateSnapshot) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            key.into(),
            MemoryEntry {
                snapshot: Some(snapshot),
                lock: None,
            },
        );
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Current lock on `key`, if any
    pub async fn current_lock(&self, key: &str) -> Option<LockInfo> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|e| e.lock.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<StateSnapshot>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).and_then(|e| e.snapshot.clone()))
    }

    async fn write(
        &self,
        key: &str,
        snapshot: &StateSnapshot,
        read_serial: Option<u64>,
    ) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_default();
        check_write(entry.snapshot.as_ref(), snapshot, read_serial)?;
        entry.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn try_lock(&self, key: &str, operation: &str, ttl: Duration) -> StoreResult<LockInfo> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_default();

        match &entry.lock {
            Some(existing) if !existing.is_expired() => return Err(StoreError::locked(existing)),
            Some(existing) => log::warn!(
                "Taking over expired lock {} held by {}",
                existing.id,
                existing.who
            ),
            None => {}
        }

        let lock = LockInfo::with_ttl(operation, ttl_to_chrono(ttl));
        entry.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn unlock(&self, key: &str, lock: &LockInfo) -> StoreResult<()> {
        self.force_unlock(key, &lock.id).await
    }

    async fn force_unlock(&self, key: &str, lock_id: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::LockNotFound(lock_id.to_string()))?;

        match entry.lock.as_ref().map(|l| l.id.clone()) {
            None => Err(StoreError::LockNotFound(lock_id.to_string())),
            Some(actual) if actual != lock_id => Err(StoreError::LockMismatch {
                expected: lock_id.to_string(),
                actual,
            }),
            Some(_) => {
                entry.lock = None;
                Ok(())
            }
        }
    }
}
