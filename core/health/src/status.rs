//! Health status model and consolidated status derivation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use cloudlink_common::{ConnectionKey, ProviderId, UserId};
use cloudlink_store::Token;

use crate::config::ValidationConfig;

/// Raw outcome of a validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorOutcome {
    /// The probe succeeded.
    Success,
    /// The provider rejected the credentials or the refresh token is dead.
    AuthenticationError,
    /// The provider could not be reached or failed on its side.
    ConnectivityError,
    /// No token is stored.
    NotConnected,
}

/// The single user-facing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidatedStatus {
    NotConnected,
    AuthenticationRequired,
    ConnectionIssues,
    Healthy,
}

impl ConsolidatedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidatedStatus::NotConnected => "not_connected",
            ConsolidatedStatus::AuthenticationRequired => "authentication_required",
            ConsolidatedStatus::ConnectionIssues => "connection_issues",
            ConsolidatedStatus::Healthy => "healthy",
        }
    }

    /// Statuses whose return to healthy counts as a recovery.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ConsolidatedStatus::AuthenticationRequired | ConsolidatedStatus::ConnectionIssues
        )
    }
}

impl fmt::Display for ConsolidatedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the consolidated status from token facts and the validator outcome.
///
/// Pure and total. Precedence: missing token, then a token flagged for
/// user intervention, then the validator outcome.
pub fn derive_consolidated_status(
    token: Option<&Token>,
    outcome: ValidatorOutcome,
) -> ConsolidatedStatus {
    match (token, outcome) {
        (None, _) => ConsolidatedStatus::NotConnected,
        (Some(token), _) if token.requires_user_intervention => {
            ConsolidatedStatus::AuthenticationRequired
        }
        (Some(_), ValidatorOutcome::AuthenticationError) => ConsolidatedStatus::AuthenticationRequired,
        (Some(_), ValidatorOutcome::ConnectivityError) => ConsolidatedStatus::ConnectionIssues,
        // Token vanished between the read and the probe
        (Some(_), ValidatorOutcome::NotConnected) => ConsolidatedStatus::NotConnected,
        (Some(_), ValidatorOutcome::Success) => ConsolidatedStatus::Healthy,
    }
}

/// Error details attached to an unhealthy status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthError {
    pub error_type: String,
    pub message: String,
}

impl HealthError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// Health of one connection at `validated_at`.
///
/// `consolidated_status` and `cache_ttl_seconds` are derived on construction
/// and only exposed through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub user: UserId,
    pub provider: ProviderId,
    pub status: ValidatorOutcome,
    consolidated_status: ConsolidatedStatus,
    pub consecutive_failures: u32,
    pub last_error_type: Option<String>,
    pub last_error_message: Option<String>,
    pub last_successful_operation_at: Option<DateTime<Utc>>,
    pub requires_reconnection: bool,
    /// Account reported by the last successful probe.
    #[serde(default)]
    pub account: Option<String>,
    pub validated_at: DateTime<Utc>,
    cache_ttl_seconds: u64,
}

impl HealthStatus {
    /// Evaluate a validation pass.
    pub fn evaluate(
        key: &ConnectionKey,
        token: Option<&Token>,
        outcome: ValidatorOutcome,
        error: Option<HealthError>,
        config: &ValidationConfig,
        validated_at: DateTime<Utc>,
    ) -> Self {
        let consolidated_status = derive_consolidated_status(token, outcome);
        let cache_ttl_seconds = if consolidated_status == ConsolidatedStatus::Healthy {
            config.healthy_ttl_seconds
        } else {
            config.unhealthy_ttl_seconds
        };
        let (last_error_type, last_error_message) = match error {
            Some(error) => (Some(error.error_type), Some(error.message)),
            None => (None, None),
        };
        let healthy = consolidated_status == ConsolidatedStatus::Healthy;

        Self {
            user: key.user.clone(),
            provider: key.provider.clone(),
            status: outcome,
            consolidated_status,
            consecutive_failures: if healthy || token.is_none() { 0 } else { 1 },
            last_error_type,
            last_error_message,
            last_successful_operation_at: if healthy {
                Some(validated_at)
            } else {
                token.and_then(|t| t.last_successful_refresh_at)
            },
            requires_reconnection: consolidated_status
                == ConsolidatedStatus::AuthenticationRequired,
            account: None,
            validated_at,
            cache_ttl_seconds,
        }
    }

    pub fn consolidated_status(&self) -> ConsolidatedStatus {
        self.consolidated_status
    }

    pub fn cache_ttl_seconds(&self) -> u64 {
        self.cache_ttl_seconds
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.user.clone(), self.provider.clone())
    }

    pub fn is_healthy(&self) -> bool {
        self.consolidated_status == ConsolidatedStatus::Healthy
    }

    /// Whether a cached copy may still be served at `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.cache_ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        self.validated_at
            .checked_add_signed(ttl)
            .map_or(true, |expires_at| now < expires_at)
    }

    /// Carry failure streak and last success over from the previous status.
    pub fn merge_history(&mut self, previous: Option<&HealthStatus>) {
        let Some(previous) = previous else {
            return;
        };
        match self.consolidated_status {
            ConsolidatedStatus::Healthy | ConsolidatedStatus::NotConnected => {
                self.consecutive_failures = 0;
            }
            ConsolidatedStatus::AuthenticationRequired | ConsolidatedStatus::ConnectionIssues => {
                self.consecutive_failures = previous.consecutive_failures.saturating_add(1);
                self.last_successful_operation_at = self
                    .last_successful_operation_at
                    .max(previous.last_successful_operation_at);
            }
        }
    }

    /// True if this status is a recovery from `previous`.
    pub fn recovered_from(&self, previous: Option<&HealthStatus>) -> bool {
        self.is_healthy() && previous.is_some_and(|p| p.consolidated_status.is_degraded())
    }
}
