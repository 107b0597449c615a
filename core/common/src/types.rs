//! Common types used throughout cloudlink.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Identifier of the user owning a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new UserId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains ':'
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_segment("UserId", &id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a cloud storage provider (e.g. "google-drive", "amazon-s3").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a new ProviderId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains ':'
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_segment("ProviderId", &id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_segment(kind: &str, value: &str) -> crate::Result<()> {
    if value.is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} cannot be empty", kind)));
    }
    // ':' separates key segments in lock and cache keys
    if value.contains(':') {
        return Err(crate::Error::InvalidInput(format!(
            "{} cannot contain ':'",
            kind
        )));
    }
    Ok(())
}

/// The (user, provider) pair every token, lock and health entry is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub user: UserId,
    pub provider: ProviderId,
}

impl ConnectionKey {
    /// Create a key from its parts.
    pub fn new(user: UserId, provider: ProviderId) -> Self {
        Self { user, provider }
    }

    /// Parse both parts from raw strings.
    pub fn parse(user: &str, provider: &str) -> crate::Result<Self> {
        Ok(Self::new(UserId::new(user)?, ProviderId::new(provider)?))
    }

    /// Key of the refresh lock: `refresh:{user}:{provider}`.
    pub fn lock_key(&self) -> String {
        format!("refresh:{}:{}", self.user, self.provider)
    }

    /// Key of the cached health status: `{user}:{provider}`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.user, self.provider)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.provider)
    }
}

/// Token secret that zeroizes on drop and never prints its contents.
#[derive(Clone, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret for use in a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} chars])", self.0.len())
    }
}
