//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use cloudlink_common::{Error, Result};

use crate::retry::BackoffConfig;

/// Longest lock wait accepted; anything longer stalls request paths.
const MAX_LOCK_WAIT: Duration = Duration::from_secs(60);

/// Headroom between the exchange timeout and lock expiry for the token
/// re-read and write around the exchange.
pub const LOCK_TTL_MARGIN: Duration = Duration::from_secs(2);

/// Serialize a `Duration` as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Top-level configuration for the health engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub refresh: RefreshConfig,
    pub renewal: RenewalConfig,
    pub validation: ValidationConfig,
    pub notifications: NotificationConfig,
    pub recovery: RecoveryConfig,
}

impl HealthConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: HealthConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// - `InvalidInput` if any constraint is violated
    pub fn validate(&self) -> Result<()> {
        if self.refresh.lock_wait.is_zero() || self.refresh.lock_wait > MAX_LOCK_WAIT {
            return Err(Error::InvalidInput(format!(
                "refresh.lock_wait must be between 1s and {}s",
                MAX_LOCK_WAIT.as_secs()
            )));
        }
        if self.refresh.lock_ttl.is_zero() {
            return Err(Error::InvalidInput(
                "refresh.lock_ttl must be non-zero".to_string(),
            ));
        }
        if self.refresh.refresh_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "refresh.refresh_timeout must be non-zero".to_string(),
            ));
        }
        // The lock must outlive the exchange or a second holder can start one
        if self.refresh.refresh_timeout.saturating_add(LOCK_TTL_MARGIN) >= self.refresh.lock_ttl {
            return Err(Error::InvalidInput(format!(
                "refresh.lock_ttl ({}s) must exceed refresh.refresh_timeout ({}s) by more than {}s",
                self.refresh.lock_ttl.as_secs(),
                self.refresh.refresh_timeout.as_secs(),
                LOCK_TTL_MARGIN.as_secs()
            )));
        }
        if self.validation.healthy_ttl_seconds <= self.validation.unhealthy_ttl_seconds {
            return Err(Error::InvalidInput(format!(
                "validation.healthy_ttl_seconds ({}) must exceed unhealthy_ttl_seconds ({})",
                self.validation.healthy_ttl_seconds, self.validation.unhealthy_ttl_seconds
            )));
        }
        if self.validation.unhealthy_ttl_seconds == 0 {
            return Err(Error::InvalidInput(
                "validation.unhealthy_ttl_seconds must be non-zero".to_string(),
            ));
        }
        self.refresh.backoff.validate()
    }
}

/// Refresh coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// How long a caller waits for another holder's refresh.
    #[serde(with = "duration_secs")]
    pub lock_wait: Duration,
    /// Lock expiry, so a crashed holder cannot block refreshes forever.
    #[serde(with = "duration_secs")]
    pub lock_ttl: Duration,
    /// Bound on a single token endpoint exchange.
    #[serde(with = "duration_secs")]
    pub refresh_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Consecutive transient failures before the user hears about them.
    pub notify_after_transient_failures: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
            notify_after_transient_failures: 3,
        }
    }
}

/// Proactive renewal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    pub proactive_window_minutes: i64,
    /// Period of the background sweep.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl RenewalConfig {
    pub fn proactive_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.proactive_window_minutes.max(0))
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            proactive_window_minutes: 15,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Validation and status cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    pub healthy_ttl_seconds: u64,
    pub unhealthy_ttl_seconds: u64,
    /// Retention of the previous status used for transition detection.
    pub history_ttl_seconds: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            healthy_ttl_seconds: 300,
            unhealthy_ttl_seconds: 60,
            history_ttl_seconds: 7 * 24 * 3600,
        }
    }
}

/// Notification throttling and escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub throttle_window_hours: i64,
    /// Consecutive delivery failures before the administrator is alerted.
    pub escalation_threshold: u32,
    pub admin_contact: Option<String>,
}

impl NotificationConfig {
    pub fn throttle_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.throttle_window_hours.max(0))
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            throttle_window_hours: 24,
            escalation_threshold: 3,
            admin_contact: None,
        }
    }
}

/// Which failed operations are requeued once a connection recovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub recoverable_error_categories: Vec<String>,
    pub job_type: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recoverable_error_categories: [
                "connection_issues",
                "authentication_required",
                "token_expired",
                "network_error",
                "timeout",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            job_type: "retry_upload".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HealthConfig::default();
        config.validate().unwrap();
        assert_eq!(config.refresh.lock_wait, Duration::from_secs(10));
        assert_eq!(config.renewal.proactive_window(), chrono::Duration::minutes(15));
        assert_eq!(config.notifications.throttle_window(), chrono::Duration::hours(24));
        assert_eq!(config.recovery.job_type, "retry_upload");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = HealthConfig::from_json(
            r#"{ "refresh": { "lock_wait": 5 }, "notifications": { "admin_contact": "ops@example.com" } }"#,
        )
        .unwrap();
        assert_eq!(config.refresh.lock_wait, Duration::from_secs(5));
        assert_eq!(config.refresh.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.notifications.admin_contact.as_deref(), Some("ops@example.com"));
        assert_eq!(config.validation.healthy_ttl_seconds, 300);
    }

    #[test]
    fn test_healthy_ttl_must_exceed_unhealthy() {
        let result = HealthConfig::from_json(
            r#"{ "validation": { "healthy_ttl_seconds": 60, "unhealthy_ttl_seconds": 60 } }"#,
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_lock_wait_bounds() {
        let mut config = HealthConfig::default();
        config.refresh.lock_wait = Duration::from_secs(120);
        assert!(config.validate().is_err());

        config.refresh.lock_wait = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_ttl_must_outlive_refresh_timeout() {
        let result = HealthConfig::from_json(r#"{ "refresh": { "lock_ttl": 1, "refresh_timeout": 15 } }"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        // Equal to timeout plus margin is still too tight
        let result = HealthConfig::from_json(r#"{ "refresh": { "lock_ttl": 17, "refresh_timeout": 15 } }"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let config =
            HealthConfig::from_json(r#"{ "refresh": { "lock_ttl": 18, "refresh_timeout": 15 } }"#).unwrap();
        assert_eq!(config.refresh.lock_ttl, Duration::from_secs(18));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.json");
        std::fs::write(&path, r#"{ "renewal": { "sweep_interval": 60 } }"#).unwrap();

        let config = HealthConfig::load(&path).unwrap();
        assert_eq!(config.renewal.sweep_interval, Duration::from_secs(60));

        assert!(HealthConfig::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let json = serde_json::to_value(RefreshConfig::default()).unwrap();
        assert_eq!(json["lock_wait"], 10);
        assert_eq!(json["refresh_timeout"], 15);
    }
}
