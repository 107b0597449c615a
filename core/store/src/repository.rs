//! Token repository trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cloudlink_common::{ConnectionKey, Result};

use crate::token::Token;

/// Persistence collaborator for [`Token`] records.
///
/// Implementations must make [`TokenStore::compare_and_update`] atomic:
/// the write only lands if the stored version still equals
/// `expected_version`.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Get the token for a connection.
    async fn get(&self, key: &ConnectionKey) -> Result<Option<Token>>;

    /// Store the token of a new OAuth grant.
    ///
    /// # Postconditions
    /// - Any existing record for the key is replaced
    /// - The stored version is greater than any previous version for the key
    async fn insert(&self, token: Token) -> Result<Token>;

    /// Atomically replace a token if nobody wrote it since `expected_version`.
    ///
    /// # Postconditions
    /// - Returns the stored record with `version == expected_version + 1`
    ///
    /// # Errors
    /// - `Error::NotFound` if no record exists
    /// - `Error::Conflict` if the stored version differs
    async fn compare_and_update(
        &self,
        key: &ConnectionKey,
        expected_version: u64,
        token: Token,
    ) -> Result<Token>;

    /// Delete the token (user disconnect). Returns whether a record existed.
    async fn delete(&self, key: &ConnectionKey) -> Result<bool>;

    /// Tokens whose access token expires at or before `cutoff`.
    async fn tokens_expiring_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Token>>;
}
