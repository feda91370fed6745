//! Lock information for State Store locking

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default lock TTL in seconds (15 minutes)
pub const DEFAULT_LOCK_TTL_SECS: i64 = 900;

/// Information about a state lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock expires
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for an operation with the default TTL
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_ttl(operation, Duration::seconds(DEFAULT_LOCK_TTL_SECS))
    }

    /// Create a new lock with a custom TTL
    pub fn with_ttl(operation: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            who: get_lock_owner(),
            created: now,
            expires: now + ttl,
        }
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Get the remaining time until expiration
    pub fn time_remaining(&self) -> Duration {
        self.expires - Utc::now()
    }
}

/// Parameters for acquiring a lock
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub operation: String,
    /// How long the lock stays valid without being released
    pub ttl: StdDuration,
    /// How long to wait for a busy lock before giving up
    pub timeout: StdDuration,
}

impl LockRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ttl: StdDuration::from_secs(DEFAULT_LOCK_TTL_SECS as u64),
            timeout: StdDuration::ZERO,
        }
    }

    pub fn with_ttl(mut self, ttl: StdDuration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
