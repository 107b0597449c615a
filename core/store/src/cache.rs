//! Key-value cache trait.

use async_trait::async_trait;
use std::time::Duration;

use cloudlink_common::Result;

/// TTL-bounded string cache shared by all callers.
///
/// Writes are last-writer-wins; values are opaque to the cache.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Get a value that has not expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value that expires after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
