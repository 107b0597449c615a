//! Distributed lock trait.

use async_trait::async_trait;
use std::time::Duration;

use cloudlink_common::Result;

/// Proof of lock ownership.
///
/// The holder token is random per acquisition, so a release issued after
/// the TTL expired and someone else took over frees nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    holder: String,
    ttl: Duration,
}

impl LockHandle {
    /// Create a handle with a fresh holder token.
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            holder: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Cross-process mutual exclusion keyed by string.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire the lock, waiting at most `wait`.
    ///
    /// # Postconditions
    /// - `Ok(Some(handle))`: the caller holds the lock until release or `ttl` elapses
    /// - `Ok(None)`: the wait elapsed without acquiring the lock
    async fn acquire(&self, key: &str, wait: Duration, ttl: Duration) -> Result<Option<LockHandle>>;

    /// Release a held lock. Returns false if the lock was no longer held by this handle.
    async fn release(&self, handle: &LockHandle) -> Result<bool>;
}

/// Poll interval used by lock implementations that cannot block natively.
pub(crate) const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
