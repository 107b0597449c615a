//! In-memory collaborators for single-process deployments and testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use cloudlink_common::{ConnectionKey, Error, Result};

use crate::cache::KeyValueCache;
use crate::lock::{DistributedLock, LockHandle, LOCK_POLL_INTERVAL};
use crate::repository::TokenStore;
use crate::token::Token;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory token store.
///
/// Can be switched into an unavailable mode to exercise persistence outages.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<ConnectionKey, Token>>,
    unavailable: AtomicBool,
}

impl MemoryTokenStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Error::Persistence` (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Persistence("token store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &ConnectionKey) -> Result<Option<Token>> {
        self.check_available()?;
        Ok(guard(&self.tokens).get(key).cloned())
    }

    async fn insert(&self, mut token: Token) -> Result<Token> {
        self.check_available()?;
        let mut tokens = guard(&self.tokens);
        token.version = tokens
            .get(&token.key)
            .map(|existing| existing.version + 1)
            .unwrap_or(1);
        token.updated_at = Utc::now();
        tokens.insert(token.key.clone(), token.clone());
        Ok(token)
    }

    async fn compare_and_update(
        &self,
        key: &ConnectionKey,
        expected_version: u64,
        mut token: Token,
    ) -> Result<Token> {
        self.check_available()?;
        let mut tokens = guard(&self.tokens);
        let current = tokens
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("No token for {}", key)))?;

        if current.version != expected_version {
            return Err(Error::Conflict(format!(
                "Token {} is at version {}, expected {}",
                key, current.version, expected_version
            )));
        }

        token.key = key.clone();
        token.version = expected_version + 1;
        token.updated_at = Utc::now();
        tokens.insert(key.clone(), token.clone());
        Ok(token)
    }

    async fn delete(&self, key: &ConnectionKey) -> Result<bool> {
        self.check_available()?;
        Ok(guard(&self.tokens).remove(key).is_some())
    }

    async fn tokens_expiring_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Token>> {
        self.check_available()?;
        let mut expiring: Vec<Token> = guard(&self.tokens)
            .values()
            .filter(|t| t.expires_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        expiring.sort_by_key(|t| t.expires_at);
        Ok(expiring)
    }
}

/// In-memory lock for a single process.
///
/// Waiters are woken on release and otherwise poll, so TTL takeovers are
/// noticed without a release.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, (String, Option<Instant>)>>,
    released: Notify,
}

impl MemoryLock {
    /// Create a new lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `key` is currently held (TTL not elapsed).
    pub fn is_held(&self, key: &str) -> bool {
        guard(&self.held)
            .get(key)
            .is_some_and(|(_, expires)| is_live(*expires, Instant::now()))
    }

    fn try_acquire(&self, handle: &LockHandle) -> bool {
        let mut held = guard(&self.held);
        let now = Instant::now();
        match held.get(handle.key()) {
            Some((_, expires)) if is_live(*expires, now) => false,
            _ => {
                held.insert(
                    handle.key().to_string(),
                    (handle.holder().to_string(), now.checked_add(handle.ttl())),
                );
                true
            }
        }
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, wait: Duration, ttl: Duration) -> Result<Option<LockHandle>> {
        let handle = LockHandle::new(key, ttl);
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.released.notified();
            if self.try_acquire(&handle) {
                return Ok(Some(handle));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let pause = LOCK_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let released = {
            let mut held = guard(&self.held);
            match held.get(handle.key()) {
                Some((holder, _)) if holder == handle.holder() => {
                    held.remove(handle.key());
                    true
                }
                _ => false,
            }
        };
        if released {
            self.released.notify_waiters();
        }
        Ok(released)
    }
}

/// In-memory TTL cache.
///
/// Expired entries are dropped on read and on every write. An entry whose
/// TTL overflows the clock never expires.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

fn is_live(expires: Option<Instant>, now: Instant) -> bool {
    expires.map_or(true, |at| at > now)
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        guard(&self.entries)
            .values()
            .filter(|(_, expires)| is_live(*expires, now))
            .count()
    }

    /// Check if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = guard(&self.entries);
        match entries.get(key) {
            Some((value, expires)) if is_live(*expires, Instant::now()) => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = guard(&self.entries);
        entries.retain(|_, (_, expires)| is_live(*expires, now));
        entries.insert(key.to_string(), (value, now.checked_add(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        guard(&self.entries).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cloudlink_common::Secret;
    use std::sync::Arc;

    fn key() -> ConnectionKey {
        ConnectionKey::parse("1", "google-drive").unwrap()
    }

    fn token(expires_in: ChronoDuration) -> Token {
        Token::from_grant(
            key(),
            Secret::new("a"),
            Some(Secret::new("r")),
            Some(Utc::now() + expires_in),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryTokenStore::new();
        let stored = store.insert(token(ChronoDuration::hours(1))).await.unwrap();
        assert_eq!(stored.version, 1);

        let loaded = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose(), "a");
    }

    #[tokio::test]
    async fn test_compare_and_update_detects_conflict() {
        let store = MemoryTokenStore::new();
        let stored = store.insert(token(ChronoDuration::hours(1))).await.unwrap();

        let updated = store
            .compare_and_update(&key(), stored.version, stored.clone())
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        // Stale writer loses
        let result = store.compare_and_update(&key(), stored.version, stored).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_compare_and_update_missing() {
        let store = MemoryTokenStore::new();
        let result = store
            .compare_and_update(&key(), 1, token(ChronoDuration::hours(1)))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryTokenStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get(&key()).await, Err(Error::Persistence(_))));
        store.set_unavailable(false);
        assert!(store.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tokens_expiring_before() {
        let store = MemoryTokenStore::new();
        store.insert(token(ChronoDuration::minutes(5))).await.unwrap();
        let other = Token::from_grant(
            ConnectionKey::parse("2", "google-drive").unwrap(),
            Secret::new("a"),
            None,
            Some(Utc::now() + ChronoDuration::hours(3)),
        );
        store.insert(other).await.unwrap();

        let expiring = store
            .tokens_expiring_before(Utc::now() + ChronoDuration::minutes(15))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].key, key());
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(30);

        let first = lock
            .acquire("refresh:1:gd", Duration::from_millis(10), ttl)
            .await
            .unwrap()
            .unwrap();
        let second = lock
            .acquire("refresh:1:gd", Duration::from_millis(50), ttl)
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(lock.release(&first).await.unwrap());
        assert!(!lock.is_held("refresh:1:gd"));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let lock = Arc::new(MemoryLock::new());
        let ttl = Duration::from_secs(30);
        let first = lock
            .acquire("k", Duration::from_millis(10), ttl)
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("k", Duration::from_secs(2), ttl).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.release(&first).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let lock = MemoryLock::new();
        let stale = lock
            .acquire("k", Duration::from_millis(10), Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();

        let fresh = lock
            .acquire("k", Duration::from_millis(200), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        // The stale holder must not free the new holder's lock
        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.is_held("k"));
        assert!(lock.release(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("a", "1".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_write_drops_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("a", "1".to_string(), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.set("b", "2".to_string(), Duration::from_secs(60)).await.unwrap();
        let entries = guard(&cache.entries);
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("b"));
    }

    #[tokio::test]
    async fn test_cache_huge_ttl_never_expires() {
        let cache = MemoryCache::new();
        cache.set("a", "1".to_string(), Duration::MAX).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_delete() {
        let cache = MemoryCache::new();
        cache.set("a", "1".to_string(), Duration::from_secs(60)).await.unwrap();
        cache.delete("a").await.unwrap();
        cache.delete("missing").await.unwrap();
        assert!(cache.is_empty());
    }
}
