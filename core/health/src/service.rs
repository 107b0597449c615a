//! Cached, consolidated connection health.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use cloudlink_common::ConnectionKey;
use cloudlink_store::KeyValueCache;

use crate::config::ValidationConfig;
use crate::recovery::ConnectionRecoveryService;
use crate::status::HealthStatus;
use crate::validator::RealTimeHealthValidator;

fn history_key(key: &ConnectionKey) -> String {
    format!("{}:history", key.cache_key())
}

/// Serves health statuses from cache and revalidates when they go stale.
pub struct CloudStorageHealthService {
    cache: Arc<dyn KeyValueCache>,
    validator: Arc<RealTimeHealthValidator>,
    recovery: Option<Arc<ConnectionRecoveryService>>,
    config: ValidationConfig,
}

impl CloudStorageHealthService {
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        validator: Arc<RealTimeHealthValidator>,
        config: ValidationConfig,
    ) -> Self {
        Self {
            cache,
            validator,
            recovery: None,
            config,
        }
    }

    /// Run automatic recovery when a connection becomes healthy again.
    pub fn with_recovery(mut self, recovery: Arc<ConnectionRecoveryService>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Current health of a connection.
    ///
    /// Serves the cached status while it is fresh; otherwise validates,
    /// caches the result for its TTL and returns it.
    pub async fn check_connection_health(&self, key: &ConnectionKey) -> HealthStatus {
        let now = Utc::now();
        if let Some(cached) = self.cached_status(key).await {
            if cached.is_fresh_at(now) {
                debug!(user = %key.user, provider = %key.provider, "Serving cached health status");
                return cached;
            }
        }

        let previous = self.read(&history_key(key), key).await;
        let mut status = self.validator.validate_connection_health(key).await;
        status.merge_history(previous.as_ref());

        self.write(&key.cache_key(), &status, Duration::from_secs(status.cache_ttl_seconds()))
            .await;
        self.write(
            &history_key(key),
            &status,
            Duration::from_secs(self.config.history_ttl_seconds),
        )
        .await;

        if let Some(previous) = &previous {
            if previous.consolidated_status() != status.consolidated_status() {
                info!(
                    user = %key.user,
                    provider = %key.provider,
                    "Connection status changed from {} to {}",
                    previous.consolidated_status(),
                    status.consolidated_status()
                );
            }
        }

        if status.recovered_from(previous.as_ref()) {
            if let Some(recovery) = &self.recovery {
                let result = recovery.attempt_automatic_recovery(key).await;
                debug!(
                    user = %key.user,
                    provider = %key.provider,
                    "Recovery requeued {} operations",
                    result.operations_requeued
                );
            }
        }

        status
    }

    /// Cached status, fresh or not. `None` on a miss or unreadable entry.
    pub async fn cached_status(&self, key: &ConnectionKey) -> Option<HealthStatus> {
        self.read(&key.cache_key(), key).await
    }

    /// Drop the cached status so the next check revalidates.
    pub async fn invalidate(&self, key: &ConnectionKey) {
        if let Err(e) = self.cache.delete(&key.cache_key()).await {
            warn!(user = %key.user, provider = %key.provider, "Failed to invalidate health status: {}", e);
        }
    }

    async fn read(&self, cache_key: &str, key: &ConnectionKey) -> Option<HealthStatus> {
        let raw = match self.cache.get(cache_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(user = %key.user, provider = %key.provider, "Health cache read failed: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(user = %key.user, provider = %key.provider, "Discarding unreadable health entry: {}", e);
                None
            }
        }
    }

    async fn write(&self, cache_key: &str, status: &HealthStatus, ttl: Duration) {
        let raw = match serde_json::to_string(status) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize health status: {}", e);
                return;
            }
        };
        if let Err(e) = self.cache.set(cache_key, raw, ttl).await {
            warn!(user = %status.user, provider = %status.provider, "Health cache write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cloudlink_common::Secret;
    use cloudlink_providers::{ProviderClients, ProviderError, ScriptedProvider};
    use cloudlink_store::{MemoryCache, MemoryLock, MemoryTokenStore, Token, TokenStore};
    use serde_json::json;

    use crate::config::{NotificationConfig, RecoveryConfig, RefreshConfig, RenewalConfig};
    use crate::coordinator::TokenRefreshCoordinator;
    use crate::notification::{MemoryMailer, NotificationGateway};
    use crate::queue::{FailedOperation, MemoryFailedOperations, MemoryJobQueue};
    use crate::renewal::ProactiveTokenRenewalService;
    use crate::status::ConsolidatedStatus;

    fn key() -> ConnectionKey {
        ConnectionKey::parse("42", "google-drive").unwrap()
    }

    struct Harness {
        service: CloudStorageHealthService,
        cache: Arc<MemoryCache>,
        provider: Arc<ScriptedProvider>,
        operations: Arc<MemoryFailedOperations>,
        queue: Arc<MemoryJobQueue>,
        mailer: Arc<MemoryMailer>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .insert(Token::from_grant(
                key(),
                Secret::new("access"),
                Some(Secret::new("refresh")),
                Some(Utc::now() + ChronoDuration::hours(1)),
            ))
            .await
            .unwrap();
        let cache = Arc::new(MemoryCache::new());
        let provider = Arc::new(ScriptedProvider::new(key().provider));
        let mut providers = ProviderClients::new();
        providers.insert(provider.clone());

        let mailer = Arc::new(MemoryMailer::new());
        let lock = Arc::new(MemoryLock::new());
        let notifier = Arc::new(NotificationGateway::new(
            store.clone(),
            lock.clone(),
            mailer.clone(),
            NotificationConfig::default(),
        ));
        let coordinator = Arc::new(
            TokenRefreshCoordinator::new(
                store.clone(),
                lock,
                cache.clone(),
                providers.clone(),
                RefreshConfig::default(),
            )
            .with_notifier(notifier.clone()),
        );
        let renewal = Arc::new(ProactiveTokenRenewalService::new(
            store.clone(),
            coordinator,
            RenewalConfig::default(),
        ));
        let validator = Arc::new(RealTimeHealthValidator::new(
            store.clone(),
            renewal,
            providers,
            ValidationConfig::default(),
        ));
        let operations = Arc::new(MemoryFailedOperations::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let recovery = Arc::new(ConnectionRecoveryService::new(
            operations.clone(),
            queue.clone(),
            notifier,
            RecoveryConfig::default(),
        ));
        let service = CloudStorageHealthService::new(cache.clone(), validator, ValidationConfig::default())
            .with_recovery(recovery);

        Harness {
            service,
            cache,
            provider,
            operations,
            queue,
            mailer,
        }
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_validation() {
        let h = harness().await;

        let first = h.service.check_connection_health(&key()).await;
        let second = h.service.check_connection_health(&key()).await;

        assert!(first.is_healthy());
        assert_eq!(first, second);
        assert_eq!(h.provider.probe_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_revalidation() {
        let h = harness().await;

        h.service.check_connection_health(&key()).await;
        h.service.invalidate(&key()).await;
        assert!(h.service.cached_status(&key()).await.is_none());

        h.service.check_connection_health(&key()).await;
        assert_eq!(h.provider.probe_calls(), 2);
    }

    #[tokio::test]
    async fn test_consecutive_failures_accumulate() {
        let h = harness().await;
        h.provider
            .set_default_probe(Err(ProviderError::Network("unreachable".into())));

        for expected in 1..=3 {
            h.service.invalidate(&key()).await;
            let status = h.service.check_connection_health(&key()).await;
            assert_eq!(status.consolidated_status(), ConsolidatedStatus::ConnectionIssues);
            assert_eq!(status.consecutive_failures, expected);
        }
    }

    #[tokio::test]
    async fn test_recovery_on_transition_to_healthy() {
        let h = harness().await;
        h.operations.record(FailedOperation::new(key(), "network_error", json!({ "file": "a" })));
        h.operations.record(FailedOperation::new(key(), "timeout", json!({ "file": "b" })));

        h.provider.queue_probe(Err(ProviderError::Network("unreachable".into())));
        let down = h.service.check_connection_health(&key()).await;
        assert_eq!(down.consolidated_status(), ConsolidatedStatus::ConnectionIssues);

        h.service.invalidate(&key()).await;
        let up = h.service.check_connection_health(&key()).await;
        assert!(up.is_healthy());
        assert_eq!(up.consecutive_failures, 0);

        assert_eq!(h.queue.jobs().len(), 2);
        assert_eq!(h.mailer.sent_with_template("connection_restored").len(), 1);

        // Healthy to healthy is not a transition
        h.service.invalidate(&key()).await;
        h.service.check_connection_health(&key()).await;
        assert_eq!(h.mailer.sent_with_template("connection_restored").len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_is_a_miss() {
        let h = harness().await;
        h.cache
            .set(&key().cache_key(), "not json".into(), Duration::from_secs(300))
            .await
            .unwrap();

        let status = h.service.check_connection_health(&key()).await;
        assert!(status.is_healthy());
        assert_eq!(h.provider.probe_calls(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_status_cached_for_shorter_ttl() {
        let h = harness().await;
        h.provider.queue_probe(Err(ProviderError::Network("unreachable".into())));

        let status = h.service.check_connection_health(&key()).await;
        assert!(status.cache_ttl_seconds() < ValidationConfig::default().healthy_ttl_seconds);
        assert!(h.service.cached_status(&key()).await.is_some());
    }
}
