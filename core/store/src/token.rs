//! OAuth credential record per (user, provider).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use cloudlink_common::{ConnectionKey, Secret};

/// Notification categories throttled independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    /// The token can no longer be refreshed; the user must reconnect.
    TokenExpired,
    /// Refresh attempts keep failing.
    RefreshFailure,
    /// The connection is healthy again after an outage.
    ConnectionRestored,
}

impl NotificationCategory {
    /// Stable name, also used as the mail template identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::TokenExpired => "token_expired",
            NotificationCategory::RefreshFailure => "refresh_failure",
            NotificationCategory::ConnectionRestored => "connection_restored",
        }
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a refresh failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Revoked or expired refresh token; retrying cannot help.
    Permanent,
    /// Network, timeout or rate limit; a later retry may succeed.
    Transient,
}

/// The outcome of the most recent failed refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshFailureRecord {
    pub class: FailureClass,
    /// Stable machine-readable error type (e.g. "invalid_grant").
    pub error_type: String,
    pub message: String,
}

/// Persisted OAuth credentials plus failure and notification bookkeeping.
///
/// Credential fields are only written by the refresh coordinator while it
/// holds the refresh lock. `version` increases on every stored write and is
/// what [`crate::TokenStore::compare_and_update`] checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub key: ConnectionKey,
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    /// `None` means the access token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_successful_refresh_at: Option<DateTime<Utc>>,
    /// Reset to 0 on every successful refresh.
    pub refresh_failure_count: u32,
    /// Set on permanent refresh failure; cleared by refresh success or a new grant.
    pub requires_user_intervention: bool,
    pub last_refresh_attempt_at: Option<DateTime<Utc>>,
    pub last_refresh_error: Option<RefreshFailureRecord>,
    /// Earliest time a scheduled renewal may retry after a transient failure.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_notification_sent_at: BTreeMap<NotificationCategory, DateTime<Utc>>,
    pub notification_failure_count: u32,
    pub proactive_refresh_scheduled_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    /// Create the record for a fresh OAuth grant.
    pub fn from_grant(
        key: ConnectionKey,
        access_token: Secret,
        refresh_token: Option<Secret>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            access_token,
            refresh_token,
            expires_at,
            last_successful_refresh_at: None,
            refresh_failure_count: 0,
            requires_user_intervention: false,
            last_refresh_attempt_at: None,
            last_refresh_error: None,
            next_retry_at: None,
            last_notification_sent_at: BTreeMap::new(),
            notification_failure_count: 0,
            proactive_refresh_scheduled_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the access token is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Check if the access token is expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check if the access token expires within `window` of `now` (or already has).
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now + window)
    }

    /// Apply a successful refresh.
    ///
    /// # Postconditions
    /// - `refresh_failure_count == 0`
    /// - `requires_user_intervention == false`
    pub fn apply_refresh(
        &mut self,
        access_token: Secret,
        refresh_token: Option<Secret>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.access_token = access_token;
        // Providers may omit the refresh token when they do not rotate it
        if let Some(refresh_token) = refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        self.expires_at = expires_at;
        self.last_successful_refresh_at = Some(now);
        self.last_refresh_attempt_at = Some(now);
        self.last_refresh_error = None;
        self.next_retry_at = None;
        self.refresh_failure_count = 0;
        self.requires_user_intervention = false;
    }

    /// Record a failed refresh attempt.
    pub fn record_refresh_failure(&mut self, failure: RefreshFailureRecord, now: DateTime<Utc>) {
        self.refresh_failure_count = self.refresh_failure_count.saturating_add(1);
        if failure.class == FailureClass::Permanent {
            self.requires_user_intervention = true;
        }
        self.last_refresh_attempt_at = Some(now);
        self.last_refresh_error = Some(failure);
    }

    /// When a notification of `category` was last delivered.
    pub fn last_notified(&self, category: NotificationCategory) -> Option<DateTime<Utc>> {
        self.last_notification_sent_at.get(&category).copied()
    }
}
