//! Persistence, locking and caching collaborators for cloudlink.
//!
//! Every component above this crate talks to storage through three traits:
//! - [`TokenStore`]: the OAuth credential record per (user, provider), with
//!   an atomic compare-and-update so only one writer can win a race
//! - [`DistributedLock`]: cross-process mutual exclusion with acquire-timeout and TTL
//! - [`KeyValueCache`]: TTL-bounded string cache used for derived health state
//!
//! In-memory implementations serve single-process deployments and tests;
//! the SQLite implementations share one database file across processes.

pub mod cache;
pub mod lock;
pub mod memory;
pub mod repository;
pub mod sqlite;
pub mod token;

pub use cache::KeyValueCache;
pub use lock::{DistributedLock, LockHandle};
pub use memory::{MemoryCache, MemoryLock, MemoryTokenStore};
pub use repository::TokenStore;
pub use sqlite::{SqliteLock, SqliteTokenStore};
pub use token::{FailureClass, NotificationCategory, RefreshFailureRecord, Token};
