//! SQLite-backed token store and lock.
//!
//! Several processes may open the same database file; row-level atomicity
//! comes from single-statement conditional writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use cloudlink_common::{ConnectionKey, Error, Result};

use crate::lock::{DistributedLock, LockHandle, LOCK_POLL_INTERVAL};
use crate::repository::TokenStore;
use crate::token::Token;

/// How long a connection waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn db_err(err: rusqlite::Error) -> Error {
    Error::Persistence(err.to_string())
}

fn open_connection(db_path: &Path, schema: &str) -> Result<Connection> {
    let conn = Connection::open(db_path).map_err(db_err)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
    conn.execute_batch(schema).map_err(db_err)?;
    Ok(conn)
}

/// Run blocking SQLite work off the async runtime.
async fn with_conn<T, F>(conn: &Arc<Mutex<Connection>>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        work(&conn)
    })
    .await
    .map_err(|e| Error::Persistence(format!("SQLite task failed: {}", e)))?
}

const TOKEN_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS oauth_tokens (
        user_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        expires_at INTEGER,
        version INTEGER NOT NULL,
        record TEXT NOT NULL,
        PRIMARY KEY (user_id, provider)
    );

    CREATE INDEX IF NOT EXISTS idx_oauth_tokens_expires_at ON oauth_tokens(expires_at);
"#;

/// Token store persisted in SQLite.
///
/// The full record is stored as JSON; `expires_at` and `version` are
/// mirrored into columns for the expiry query and compare-and-update.
pub struct SqliteTokenStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTokenStore {
    /// Create or open a token database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_connection(db_path.as_ref(), TOKEN_SCHEMA)?;
        info!("Token store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

fn decode(record: String) -> Result<Token> {
    Ok(serde_json::from_str(&record)?)
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn get(&self, key: &ConnectionKey) -> Result<Option<Token>> {
        let key = key.clone();
        with_conn(&self.conn, move |conn| {
            let record: Option<String> = conn
                .query_row(
                    "SELECT record FROM oauth_tokens WHERE user_id = ?1 AND provider = ?2",
                    params![key.user.as_str(), key.provider.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            record.map(decode).transpose()
        })
        .await
    }

    async fn insert(&self, mut token: Token) -> Result<Token> {
        with_conn(&self.conn, move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM oauth_tokens WHERE user_id = ?1 AND provider = ?2",
                    params![token.key.user.as_str(), token.key.provider.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            token.version = current.map(|v| v as u64 + 1).unwrap_or(1);
            token.updated_at = Utc::now();
            let record = serde_json::to_string(&token)?;

            tx.execute(
                r#"
                INSERT OR REPLACE INTO oauth_tokens (user_id, provider, expires_at, version, record)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    token.key.user.as_str(),
                    token.key.provider.as_str(),
                    token.expires_at.map(|at| at.timestamp_millis()),
                    token.version as i64,
                    record,
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            debug!("Stored new grant for {}", token.key);
            Ok(token)
        })
        .await
    }

    async fn compare_and_update(
        &self,
        key: &ConnectionKey,
        expected_version: u64,
        mut token: Token,
    ) -> Result<Token> {
        let key = key.clone();
        with_conn(&self.conn, move |conn| {
            token.key = key.clone();
            token.version = expected_version + 1;
            token.updated_at = Utc::now();
            let record = serde_json::to_string(&token)?;

            let changed = conn
                .execute(
                    r#"
                    UPDATE oauth_tokens SET expires_at = ?1, version = ?2, record = ?3
                    WHERE user_id = ?4 AND provider = ?5 AND version = ?6
                    "#,
                    params![
                        token.expires_at.map(|at| at.timestamp_millis()),
                        token.version as i64,
                        record,
                        key.user.as_str(),
                        key.provider.as_str(),
                        expected_version as i64,
                    ],
                )
                .map_err(db_err)?;

            if changed == 1 {
                return Ok(token);
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT version FROM oauth_tokens WHERE user_id = ?1 AND provider = ?2",
                    params![key.user.as_str(), key.provider.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match exists {
                None => Err(Error::NotFound(format!("No token for {}", key))),
                Some(version) => Err(Error::Conflict(format!(
                    "Token {} is at version {}, expected {}",
                    key, version, expected_version
                ))),
            }
        })
        .await
    }

    async fn delete(&self, key: &ConnectionKey) -> Result<bool> {
        let key = key.clone();
        with_conn(&self.conn, move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM oauth_tokens WHERE user_id = ?1 AND provider = ?2",
                    params![key.user.as_str(), key.provider.as_str()],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn tokens_expiring_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Token>> {
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT record FROM oauth_tokens
                    WHERE expires_at IS NOT NULL AND expires_at <= ?1
                    ORDER BY expires_at
                    "#,
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map([cutoff.timestamp_millis()], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut tokens = Vec::new();
            for row in rows {
                tokens.push(decode(row.map_err(db_err)?)?);
            }
            Ok(tokens)
        })
        .await
    }
}

const LOCK_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS distributed_locks (
        lock_key TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
"#;

/// Lock table in a SQLite file shared by every process.
///
/// Acquisition is one conditional upsert: insert if absent, take over if
/// the current holder's TTL has elapsed.
pub struct SqliteLock {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLock {
    /// Create or open the lock table in a database file.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_connection(db_path.as_ref(), LOCK_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn try_acquire(&self, handle: &LockHandle) -> Result<bool> {
        let key = handle.key().to_string();
        let holder = handle.holder().to_string();
        let ttl_ms = i64::try_from(handle.ttl().as_millis()).unwrap_or(i64::MAX);

        with_conn(&self.conn, move |conn| {
            let now = Utc::now().timestamp_millis();
            let changed = conn
                .execute(
                    r#"
                    INSERT INTO distributed_locks (lock_key, holder, expires_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(lock_key) DO UPDATE
                        SET holder = excluded.holder, expires_at = excluded.expires_at
                        WHERE distributed_locks.expires_at <= ?4
                    "#,
                    params![key, holder, now.saturating_add(ttl_ms), now],
                )
                .map_err(|e| Error::Lock(e.to_string()))?;
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl DistributedLock for SqliteLock {
    async fn acquire(&self, key: &str, wait: Duration, ttl: Duration) -> Result<Option<LockHandle>> {
        let handle = LockHandle::new(key, ttl);
        let deadline = Instant::now() + wait;

        loop {
            if self.try_acquire(&handle).await? {
                return Ok(Some(handle));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let key = handle.key().to_string();
        let holder = handle.holder().to_string();
        with_conn(&self.conn, move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM distributed_locks WHERE lock_key = ?1 AND holder = ?2",
                    params![key, holder],
                )
                .map_err(|e| Error::Lock(e.to_string()))?;
            Ok(changed == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cloudlink_common::Secret;
    use tempfile::TempDir;

    fn token(user: &str, expires_in: ChronoDuration) -> Token {
        Token::from_grant(
            ConnectionKey::parse(user, "google-drive").unwrap(),
            Secret::new("access"),
            Some(Secret::new("refresh")),
            Some(Utc::now() + expires_in),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_and_versioning() {
        let store = SqliteTokenStore::in_memory().unwrap();
        let stored = store.insert(token("1", ChronoDuration::hours(1))).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut loaded = store.get(&stored.key).await.unwrap().unwrap();
        assert_eq!(loaded.refresh_token.as_ref().unwrap().expose(), "refresh");

        loaded.refresh_failure_count = 2;
        let updated = store
            .compare_and_update(&stored.key, 1, loaded)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let reloaded = store.get(&stored.key).await.unwrap().unwrap();
        assert_eq!(reloaded.refresh_failure_count, 2);
        assert_eq!(reloaded.version, 2);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = SqliteTokenStore::in_memory().unwrap();
        let stored = store.insert(token("1", ChronoDuration::hours(1))).await.unwrap();
        store
            .compare_and_update(&stored.key, 1, stored.clone())
            .await
            .unwrap();

        let result = store.compare_and_update(&stored.key.clone(), 1, stored).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found() {
        let store = SqliteTokenStore::in_memory().unwrap();
        let t = token("9", ChronoDuration::hours(1));
        let key = t.key.clone();
        let result = store.compare_and_update(&key, 1, t).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reinsert_bumps_version() {
        let store = SqliteTokenStore::in_memory().unwrap();
        store.insert(token("1", ChronoDuration::hours(1))).await.unwrap();
        let again = store.insert(token("1", ChronoDuration::hours(2))).await.unwrap();
        assert_eq!(again.version, 2);
    }

    #[tokio::test]
    async fn test_expiring_query_and_delete() {
        let store = SqliteTokenStore::in_memory().unwrap();
        store.insert(token("1", ChronoDuration::minutes(3))).await.unwrap();
        store.insert(token("2", ChronoDuration::hours(5))).await.unwrap();

        let expiring = store
            .tokens_expiring_before(Utc::now() + ChronoDuration::minutes(15))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].key.user.as_str(), "1");

        assert!(store.delete(&expiring[0].key).await.unwrap());
        assert!(!store.delete(&expiring[0].key).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_shared_between_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks.db");
        let a = SqliteLock::open(&path).unwrap();
        let b = SqliteLock::open(&path).unwrap();
        let ttl = Duration::from_secs(30);

        let held = a
            .acquire("refresh:1:gd", Duration::from_millis(10), ttl)
            .await
            .unwrap()
            .unwrap();
        let blocked = b
            .acquire("refresh:1:gd", Duration::from_millis(100), ttl)
            .await
            .unwrap();
        assert!(blocked.is_none());

        assert!(a.release(&held).await.unwrap());
        let acquired = b
            .acquire("refresh:1:gd", Duration::from_millis(100), ttl)
            .await
            .unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_lock_takeover_after_ttl() {
        let dir = TempDir::new().unwrap();
        let lock = SqliteLock::open(dir.path().join("locks.db")).unwrap();

        let stale = lock
            .acquire("k", Duration::from_millis(10), Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        let fresh = lock
            .acquire("k", Duration::from_secs(1), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());
        assert!(!lock.release(&stale).await.unwrap());
    }
}
