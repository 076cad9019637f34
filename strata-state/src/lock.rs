//! Lock information for state backend locking

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default lock lifetime in seconds (15 minutes)
pub const DEFAULT_LOCK_TTL_SECS: i64 = 900;

/// Information about a state lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// Workspace the lock protects
    pub workspace: String,
    /// The operation being performed (e.g., "write", "migrate", "prune")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock expires
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for an operation with the default lifetime
    pub fn new(workspace: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::with_ttl(
            workspace,
            operation,
            std::time::Duration::from_secs(DEFAULT_LOCK_TTL_SECS as u64),
        )
    }

    /// Create a new lock with a custom lifetime
    pub fn with_ttl(
        workspace: impl Into<String>,
        operation: impl Into<String>,
        ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(DEFAULT_LOCK_TTL_SECS));

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace: workspace.into(),
            operation: operation.into(),
            who: lock_owner(),
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

/// How long and how patiently to wait for a contended lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Give up with a lock conflict after this long
    #[serde(with = "humantime_serde")]
    pub timeout: std::time::Duration,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: std::time::Duration,
    /// Upper bound for the doubling retry delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: std::time::Duration,
    /// Lifetime written into acquired locks
    #[serde(with = "humantime_serde")]
    pub ttl: std::time::Duration,
}

impl LockPolicy {
    /// Fail immediately when the lock is held
    pub fn no_wait() -> Self {
        Self {
            timeout: std::time::Duration::ZERO,
            ..Self::default()
        }
    }

    /// The delay that follows `current` in the backoff sequence
    pub fn next_backoff(&self, current: std::time::Duration) -> std::time::Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(30),
            initial_backoff: std::time::Duration::from_millis(200),
            max_backoff: std::time::Duration::from_secs(5),
            ttl: std::time::Duration::from_secs(DEFAULT_LOCK_TTL_SECS as u64),
        }
    }
}

/// Get the lock owner string (username@hostname)
pub fn lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
