//! Provider operation trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use cloudlink_common::{ProviderId, Secret};

/// Tokens returned by a successful refresh exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: Secret,
    /// `None` when the provider does not rotate refresh tokens.
    pub refresh_token: Option<Secret>,
    /// Lifetime of the access token; `None` if the provider did not say.
    pub expires_in: Option<Duration>,
}

impl TokenGrant {
    /// Absolute expiry relative to `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|lifetime| {
            now + ChronoDuration::from_std(lifetime).unwrap_or_else(|_| ChronoDuration::hours(1))
        })
    }
}

/// Result of a successful connectivity probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Account the token belongs to, when the provider reports it.
    pub account: Option<String>,
}

/// Whether retrying an operation later can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Permanent,
    Transient,
}

/// Errors surfaced by provider operations.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Refresh token revoked, expired or otherwise rejected.
    #[error("Refresh token rejected: {0}")]
    InvalidGrant(String),

    /// OAuth client credentials rejected.
    #[error("Client credentials rejected: {0}")]
    InvalidClient(String),

    /// Access token rejected by the API.
    #[error("Access token rejected: {0}")]
    Unauthorized(String),

    /// Provider is throttling requests.
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Connection could not be established or was interrupted.
    #[error("Network error: {0}")]
    Network(String),

    /// No response within the allotted time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Provider-side failure (5xx or unexpected status).
    #[error("Provider returned {status}: {message}")]
    Server { status: u16, message: String },

    /// Response could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The provider does not implement this operation.
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Classify for refresh bookkeeping.
    pub fn classify(&self) -> ErrorClass {
        match self {
            ProviderError::InvalidGrant(_)
            | ProviderError::InvalidClient(_)
            | ProviderError::Unauthorized(_)
            | ProviderError::Unsupported(_) => ErrorClass::Permanent,
            ProviderError::RateLimited { .. }
            | ProviderError::Network(_)
            | ProviderError::Timeout(_)
            | ProviderError::Server { .. }
            | ProviderError::InvalidResponse(_) => ErrorClass::Transient,
        }
    }

    /// True if the failure says nothing about the credentials.
    pub fn is_connectivity(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    /// Stable machine-readable error type.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::InvalidGrant(_) => "invalid_grant",
            ProviderError::InvalidClient(_) => "invalid_client",
            ProviderError::Unauthorized(_) => "unauthorized",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Network(_) => "network_error",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Server { .. } => "server_error",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::Unsupported(_) => "unsupported",
        }
    }
}

/// Operations the health engine invokes on a storage backend.
///
/// Implementations must be side-effect free apart from the token exchange
/// itself, and must not refresh tokens on their own.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider this client talks to.
    fn provider_id(&self) -> &ProviderId;

    /// Exchange a refresh token for new tokens.
    ///
    /// # Errors
    /// - `InvalidGrant` if the refresh token is revoked or expired
    /// - Transient variants for network, timeout and rate limits
    async fn refresh_token(&self, refresh_token: &Secret) -> Result<TokenGrant, ProviderError>;

    /// Lightweight identity/connectivity check with the current access token.
    ///
    /// # Errors
    /// - `Unauthorized` if the token is rejected
    /// - Transient variants if the provider cannot be reached
    async fn probe(&self, access_token: &Secret) -> Result<ProbeReport, ProviderError>;
}
