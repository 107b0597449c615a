//! Proactive renewal ahead of expiry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use cloudlink_common::ConnectionKey;
use cloudlink_store::{Token, TokenStore};

use crate::config::RenewalConfig;
use crate::coordinator::TokenRefreshCoordinator;
use crate::error::{RefreshError, RefreshResult, RefreshSuccess};

/// Counters from one renewal sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalReport {
    pub examined: usize,
    pub refreshed: usize,
    pub already_valid: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: std::time::Duration,
}

/// Refreshes tokens shortly before they expire.
///
/// Never touches credentials itself; every refresh goes through the
/// coordinator.
pub struct ProactiveTokenRenewalService {
    store: Arc<dyn TokenStore>,
    coordinator: Arc<TokenRefreshCoordinator>,
    config: RenewalConfig,
}

impl ProactiveTokenRenewalService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        coordinator: Arc<TokenRefreshCoordinator>,
        config: RenewalConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &RenewalConfig {
        &self.config
    }

    /// Check if `token` expires inside the proactive window.
    pub fn needs_refresh(&self, token: &Token, now: DateTime<Utc>) -> bool {
        token.expires_within(now, self.config.proactive_window())
    }

    /// Refresh the token if it expires within the proactive window.
    ///
    /// Tokens outside the window return [`RefreshSuccess::NotDue`] without
    /// touching the lock.
    pub async fn refresh_token_if_needed(&self, key: &ConnectionKey) -> RefreshResult {
        let token = match self.store.get(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(RefreshError::NotConnected),
            Err(e) => return Err(RefreshError::Persistence(e.to_string())),
        };

        let now = Utc::now();
        if !self.needs_refresh(&token, now) {
            return Ok(RefreshSuccess::NotDue {
                expires_at: token.expires_at,
            });
        }

        if token.requires_user_intervention {
            return Err(intervention_error(&token));
        }

        if let Some(retry_at) = token.next_retry_at.filter(|retry_at| *retry_at > now) {
            debug!(
                user = %key.user,
                provider = %key.provider,
                failures = token.refresh_failure_count,
                "Renewal backing off until {}",
                retry_at
            );
            return Err(RefreshError::BackingOff { retry_at });
        }

        debug!(user = %key.user, provider = %key.provider, "Token inside proactive window, refreshing");
        self.coordinator
            .coordinate_refresh_ahead(key, self.config.proactive_window())
            .await
    }

    /// Refresh a token whose access token the provider rejected.
    ///
    /// Expiry is ignored, but flagged tokens and backoff still apply.
    pub async fn refresh_after_rejection(&self, key: &ConnectionKey) -> RefreshResult {
        let token = match self.store.get(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(RefreshError::NotConnected),
            Err(e) => return Err(RefreshError::Persistence(e.to_string())),
        };

        if token.requires_user_intervention {
            return Err(intervention_error(&token));
        }
        if let Some(retry_at) = token.next_retry_at.filter(|retry_at| *retry_at > Utc::now()) {
            return Err(RefreshError::BackingOff { retry_at });
        }

        info!(user = %key.user, provider = %key.provider, "Access token rejected, forcing refresh");
        self.coordinator.coordinate_forced_refresh(key).await
    }

    /// Refresh every stored token that expires inside the window.
    pub async fn renew_expiring(&self) -> cloudlink_common::Result<RenewalReport> {
        let started = Instant::now();
        let cutoff = Utc::now() + self.config.proactive_window();
        let tokens = self.store.tokens_expiring_before(cutoff).await?;

        let mut report = RenewalReport {
            examined: tokens.len(),
            ..RenewalReport::default()
        };

        for token in tokens {
            if token.requires_user_intervention {
                report.skipped += 1;
                continue;
            }
            match self.refresh_token_if_needed(&token.key).await {
                Ok(RefreshSuccess::Refreshed { .. }) => report.refreshed += 1,
                Ok(RefreshSuccess::AlreadyValid { .. }) => report.already_valid += 1,
                Ok(RefreshSuccess::NotDue { .. })
                | Err(RefreshError::BackingOff { .. })
                | Err(RefreshError::NotConnected) => report.skipped += 1,
                Err(e) => {
                    warn!(
                        user = %token.key.user,
                        provider = %token.key.provider,
                        reason = e.reason(),
                        "Proactive renewal failed: {}",
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        report.duration = started.elapsed();
        info!(
            "Renewal sweep: {} examined, {} refreshed, {} skipped, {} failed",
            report.examined, report.refreshed, report.skipped, report.failed
        );
        Ok(report)
    }
}

fn intervention_error(token: &Token) -> RefreshError {
    RefreshError::Permanent {
        error_type: token
            .last_refresh_error
            .as_ref()
            .map(|record| record.error_type.clone())
            .unwrap_or_else(|| "reconnection_required".to_string()),
        message: "Connection must be re-authorized".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cloudlink_common::Secret;
    use cloudlink_providers::{ProviderClients, ProviderError, ScriptedProvider};
    use cloudlink_store::{MemoryCache, MemoryLock, MemoryTokenStore};
    use std::time::Duration;

    use crate::config::RefreshConfig;

    fn key(user: &str) -> ConnectionKey {
        ConnectionKey::parse(user, "google-drive").unwrap()
    }

    async fn setup() -> (ProactiveTokenRenewalService, Arc<MemoryTokenStore>, Arc<ScriptedProvider>) {
        let store = Arc::new(MemoryTokenStore::new());
        let provider = Arc::new(ScriptedProvider::new(key("1").provider));
        let mut providers = ProviderClients::new();
        providers.insert(provider.clone());

        let config = RefreshConfig {
            lock_wait: Duration::from_secs(1),
            ..RefreshConfig::default()
        };
        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            store.clone(),
            Arc::new(MemoryLock::new()),
            Arc::new(MemoryCache::new()),
            providers,
            config,
        ));
        let service = ProactiveTokenRenewalService::new(store.clone(), coordinator, RenewalConfig::default());
        (service, store, provider)
    }

    async fn insert(store: &MemoryTokenStore, user: &str, expires_in: ChronoDuration) {
        store
            .insert(Token::from_grant(
                key(user),
                Secret::new("access"),
                Some(Secret::new("refresh")),
                Some(Utc::now() + expires_in),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_outside_window_is_noop() {
        let (service, store, provider) = setup().await;
        insert(&store, "1", ChronoDuration::minutes(30)).await;

        let result = service.refresh_token_if_needed(&key("1")).await.unwrap();
        assert!(matches!(result, RefreshSuccess::NotDue { .. }));
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_inside_window_refreshes() {
        let (service, store, provider) = setup().await;
        insert(&store, "1", ChronoDuration::minutes(10)).await;

        let result = service.refresh_token_if_needed(&key("1")).await.unwrap();
        assert!(matches!(result, RefreshSuccess::Refreshed { .. }));
        assert_eq!(provider.refresh_calls(), 1);
        assert!(store
            .get(&key("1"))
            .await
            .unwrap()
            .unwrap()
            .proactive_refresh_scheduled_at
            .is_some());
    }

    #[tokio::test]
    async fn test_rejection_forces_refresh_of_unexpired_token() {
        let (service, store, provider) = setup().await;
        insert(&store, "1", ChronoDuration::hours(1)).await;

        let result = service.refresh_after_rejection(&key("1")).await.unwrap();
        assert!(matches!(result, RefreshSuccess::Refreshed { .. }));
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejection_respects_flag_and_backoff() {
        let (service, store, provider) = setup().await;
        insert(&store, "1", ChronoDuration::hours(1)).await;
        insert(&store, "2", ChronoDuration::hours(1)).await;

        let mut flagged = store.get(&key("1")).await.unwrap().unwrap();
        let version = flagged.version;
        flagged.requires_user_intervention = true;
        store.compare_and_update(&key("1"), version, flagged).await.unwrap();

        let mut waiting = store.get(&key("2")).await.unwrap().unwrap();
        let version = waiting.version;
        waiting.next_retry_at = Some(Utc::now() + ChronoDuration::minutes(5));
        store.compare_and_update(&key("2"), version, waiting).await.unwrap();

        assert!(service.refresh_after_rejection(&key("1")).await.unwrap_err().is_permanent());
        assert!(matches!(
            service.refresh_after_rejection(&key("2")).await,
            Err(RefreshError::BackingOff { .. })
        ));
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off() {
        let (service, store, provider) = setup().await;
        insert(&store, "1", ChronoDuration::minutes(5)).await;
        provider.queue_refresh(Err(ProviderError::Network("reset".into())));

        let err = service.refresh_token_if_needed(&key("1")).await.unwrap_err();
        assert_eq!(err.reason(), "transient_failure");

        let err = service.refresh_token_if_needed(&key("1")).await.unwrap_err();
        assert!(matches!(err, RefreshError::BackingOff { .. }));
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_flagged_token_short_circuits() {
        let (service, store, provider) = setup().await;
        insert(&store, "1", ChronoDuration::minutes(-5)).await;
        provider.queue_refresh(Err(ProviderError::InvalidGrant("revoked".into())));

        assert!(service.refresh_token_if_needed(&key("1")).await.unwrap_err().is_permanent());
        let err = service.refresh_token_if_needed(&key("1")).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.error_type(), "invalid_grant");
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_renew_expiring_sweep() {
        let (service, store, provider) = setup().await;
        insert(&store, "1", ChronoDuration::minutes(5)).await;
        insert(&store, "2", ChronoDuration::minutes(-1)).await;
        insert(&store, "3", ChronoDuration::hours(2)).await;

        let report = service.renew_expiring().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(provider.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_token() {
        let (service, _store, _provider) = setup().await;
        assert_eq!(
            service.refresh_token_if_needed(&key("9")).await.unwrap_err(),
            RefreshError::NotConnected
        );
    }
}
