//! Refresh outcome types.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use cloudlink_providers::{ErrorClass, ProviderError};
use cloudlink_store::{FailureClass, RefreshFailureRecord};

/// Successful refresh outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshSuccess {
    /// This call exchanged the refresh token.
    Refreshed { expires_at: Option<DateTime<Utc>> },
    /// Another holder refreshed the token while this call waited for the lock.
    AlreadyValid { expires_at: Option<DateTime<Utc>> },
    /// The token is outside the proactive window; nothing was done.
    NotDue { expires_at: Option<DateTime<Utc>> },
}

impl RefreshSuccess {
    /// True if no network call was made because the token was already fresh.
    pub fn was_already_valid(&self) -> bool {
        matches!(self, RefreshSuccess::AlreadyValid { .. })
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RefreshSuccess::Refreshed { expires_at }
            | RefreshSuccess::AlreadyValid { expires_at }
            | RefreshSuccess::NotDue { expires_at } => *expires_at,
        }
    }
}

/// Why a refresh did not produce a usable token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// Another holder kept the refresh lock for the whole wait.
    #[error("Timed out after {waited:?} waiting for the refresh lock")]
    LockTimeout { waited: Duration },

    /// The lock service itself failed.
    #[error("Refresh lock unavailable: {0}")]
    LockUnavailable(String),

    /// Network, rate limit or provider outage; a later retry may succeed.
    #[error("Transient refresh failure ({error_type}): {message}")]
    Transient {
        error_type: String,
        message: String,
        attempt_count: u32,
    },

    /// The refresh token is revoked or expired; the user has to reconnect.
    #[error("Refresh token rejected ({error_type}): {message}")]
    Permanent { error_type: String, message: String },

    /// The token endpoint did not answer in time.
    #[error("Token refresh timed out after {0:?}")]
    Timeout(Duration),

    /// A recent transient failure is still inside its backoff window.
    #[error("Backing off until {retry_at}")]
    BackingOff { retry_at: DateTime<Utc> },

    /// No token is stored for the connection.
    #[error("No token stored for this connection")]
    NotConnected,

    /// No client is configured for the provider.
    #[error("No client configured for provider '{0}'")]
    ProviderUnavailable(String),

    /// The token could not be read or written.
    #[error("Token persistence failed: {0}")]
    Persistence(String),
}

impl RefreshError {
    /// Stable machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            RefreshError::LockTimeout { .. } => "lock_timeout",
            RefreshError::LockUnavailable(_) => "lock_unavailable",
            RefreshError::Transient { .. } => "transient_failure",
            RefreshError::Permanent { .. } => "permanent_failure",
            RefreshError::Timeout(_) => "refresh_timeout",
            RefreshError::BackingOff { .. } => "backing_off",
            RefreshError::NotConnected => "not_connected",
            RefreshError::ProviderUnavailable(_) => "provider_unavailable",
            RefreshError::Persistence(_) => "persistence_failure",
        }
    }

    /// True if the user has to reconnect before any refresh can succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RefreshError::Permanent { .. })
    }

    /// Error type reported in health statuses and notifications.
    pub fn error_type(&self) -> String {
        match self {
            RefreshError::Transient { error_type, .. } | RefreshError::Permanent { error_type, .. } => {
                error_type.clone()
            }
            other => other.reason().to_string(),
        }
    }

    /// Rebuild the outcome of a failed attempt from its stored record.
    pub(crate) fn from_record(record: &RefreshFailureRecord, attempt_count: u32) -> Self {
        match record.class {
            FailureClass::Permanent => RefreshError::Permanent {
                error_type: record.error_type.clone(),
                message: record.message.clone(),
            },
            FailureClass::Transient => RefreshError::Transient {
                error_type: record.error_type.clone(),
                message: record.message.clone(),
                attempt_count,
            },
        }
    }
}

/// Result of a refresh request.
pub type RefreshResult = std::result::Result<RefreshSuccess, RefreshError>;

/// Persistable record of a provider failure.
pub(crate) fn failure_record(err: &ProviderError) -> RefreshFailureRecord {
    RefreshFailureRecord {
        class: match err.classify() {
            ErrorClass::Permanent => FailureClass::Permanent,
            ErrorClass::Transient => FailureClass::Transient,
        },
        error_type: err.error_type().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_are_distinct() {
        let errors = [
            RefreshError::LockTimeout {
                waited: Duration::from_secs(1),
            },
            RefreshError::LockUnavailable("down".into()),
            RefreshError::Transient {
                error_type: "network_error".into(),
                message: "reset".into(),
                attempt_count: 1,
            },
            RefreshError::Permanent {
                error_type: "invalid_grant".into(),
                message: "revoked".into(),
            },
            RefreshError::Timeout(Duration::from_secs(15)),
            RefreshError::BackingOff { retry_at: Utc::now() },
            RefreshError::NotConnected,
            RefreshError::ProviderUnavailable("dropbox".into()),
            RefreshError::Persistence("conflict".into()),
        ];
        let reasons: std::collections::HashSet<_> = errors.iter().map(|e| e.reason()).collect();
        assert_eq!(reasons.len(), errors.len());
        assert_eq!(errors.iter().filter(|e| e.is_permanent()).count(), 1);
    }

    #[test]
    fn test_failure_record_classification() {
        let record = failure_record(&ProviderError::InvalidGrant("revoked".into()));
        assert_eq!(record.class, FailureClass::Permanent);
        assert_eq!(record.error_type, "invalid_grant");

        let record = failure_record(&ProviderError::Timeout(Duration::from_secs(15)));
        assert_eq!(record.class, FailureClass::Transient);
        assert_eq!(record.error_type, "timeout");
    }

    #[test]
    fn test_error_type_prefers_provider_type() {
        let err = RefreshError::from_record(
            &RefreshFailureRecord {
                class: FailureClass::Transient,
                error_type: "rate_limited".into(),
                message: "slow down".into(),
            },
            2,
        );
        assert_eq!(err.error_type(), "rate_limited");
        assert_eq!(RefreshError::NotConnected.error_type(), "not_connected");
    }
}
