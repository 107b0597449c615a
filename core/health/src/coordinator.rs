//! Single-flight token refresh across processes.
//!
//! Every refresh of a connection runs inside the distributed lock
//! `refresh:{user}:{provider}`. The holder re-reads the token after
//! acquiring the lock, so callers that queued behind a successful refresh
//! get [`RefreshSuccess::AlreadyValid`] and callers that queued behind a
//! failed attempt get that attempt's outcome. At most one token endpoint
//! call happens per connection at a time.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use cloudlink_common::{ConnectionKey, Error, Secret};
use cloudlink_providers::{ProviderClients, ProviderError, TokenGrant};
use cloudlink_store::{DistributedLock, FailureClass, KeyValueCache, Token, TokenStore};

use crate::config::RefreshConfig;
use crate::error::{failure_record, RefreshError, RefreshResult, RefreshSuccess};
use crate::notification::NotificationGateway;

/// What a refresh request asks for.
#[derive(Debug, Clone, Copy)]
struct RefreshRequest {
    /// Refresh if the token expires within this window of now.
    window: chrono::Duration,
    /// Set when a proactive renewal scheduled this refresh.
    scheduled_at: Option<DateTime<Utc>>,
    /// Exchange even if the token has not expired.
    force: bool,
}

/// Outcome of the critical section.
struct LockedOutcome {
    result: RefreshResult,
    /// True if this call talked to the token endpoint.
    exchanged: bool,
    failure_count: u32,
}

impl LockedOutcome {
    fn local(result: RefreshResult) -> Self {
        Self {
            result,
            exchanged: false,
            failure_count: 0,
        }
    }
}

/// Serializes token refreshes per connection.
pub struct TokenRefreshCoordinator {
    store: Arc<dyn TokenStore>,
    lock: Arc<dyn DistributedLock>,
    cache: Arc<dyn KeyValueCache>,
    providers: ProviderClients,
    notifier: Option<Arc<NotificationGateway>>,
    config: RefreshConfig,
}

impl TokenRefreshCoordinator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        lock: Arc<dyn DistributedLock>,
        cache: Arc<dyn KeyValueCache>,
        providers: ProviderClients,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            lock,
            cache,
            providers,
            notifier: None,
            config,
        }
    }

    /// Send token-expired and refresh-failure notifications through `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<NotificationGateway>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Refresh the token if it has expired.
    ///
    /// # Postconditions
    /// - At most one token endpoint call per connection at any time
    /// - The refresh lock is released on every path
    /// - On success or permanent failure the cached health status is gone
    pub async fn coordinate_refresh(&self, key: &ConnectionKey) -> RefreshResult {
        self.run(
            key,
            RefreshRequest {
                window: chrono::Duration::zero(),
                scheduled_at: None,
                force: false,
            },
        )
        .await
    }

    /// Refresh the token whatever its expiry, for an access token the
    /// provider rejected early.
    ///
    /// Callers that queued behind another holder's successful refresh still
    /// get [`RefreshSuccess::AlreadyValid`] without a second exchange.
    pub async fn coordinate_forced_refresh(&self, key: &ConnectionKey) -> RefreshResult {
        self.run(
            key,
            RefreshRequest {
                window: chrono::Duration::zero(),
                scheduled_at: None,
                force: true,
            },
        )
        .await
    }

    /// Refresh the token if it expires within `window`, recording the
    /// proactive schedule on the token in the same write.
    pub async fn coordinate_refresh_ahead(
        &self,
        key: &ConnectionKey,
        window: chrono::Duration,
    ) -> RefreshResult {
        self.run(
            key,
            RefreshRequest {
                window,
                scheduled_at: Some(Utc::now()),
                force: false,
            },
        )
        .await
    }

    /// Drop the cached health status of a connection.
    pub async fn invalidate_health_cache(&self, key: &ConnectionKey) {
        if let Err(e) = self.cache.delete(&key.cache_key()).await {
            // Stale entries still expire with their TTL
            error!(user = %key.user, provider = %key.provider, "Failed to invalidate health cache: {}", e);
        }
    }

    async fn run(&self, key: &ConnectionKey, request: RefreshRequest) -> RefreshResult {
        let started_at = Utc::now();
        let lock_key = key.lock_key();

        let handle = match self
            .lock
            .acquire(&lock_key, self.config.lock_wait, self.config.lock_ttl)
            .await
        {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                warn!(
                    user = %key.user,
                    provider = %key.provider,
                    reason = "lock_timeout",
                    "Gave up waiting for refresh lock after {:?}",
                    self.config.lock_wait
                );
                return Err(RefreshError::LockTimeout {
                    waited: self.config.lock_wait,
                });
            }
            Err(e) => {
                error!(user = %key.user, provider = %key.provider, reason = "lock_unavailable", "{}", e);
                return Err(RefreshError::LockUnavailable(e.to_string()));
            }
        };

        let outcome = AssertUnwindSafe(self.refresh_locked(key, request, started_at))
            .catch_unwind()
            .await;

        match self.lock.release(&handle).await {
            Ok(true) => {}
            Ok(false) => warn!(
                user = %key.user,
                provider = %key.provider,
                "Refresh lock expired before release; ttl {:?} may be too short",
                self.config.lock_ttl
            ),
            Err(e) => error!(user = %key.user, provider = %key.provider, "Failed to release refresh lock: {}", e),
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(user = %key.user, provider = %key.provider, "Refresh critical section panicked");
                return Err(RefreshError::Persistence(
                    "refresh aborted unexpectedly".to_string(),
                ));
            }
        };

        if outcome.exchanged {
            self.notify(key, &outcome).await;
        }
        outcome.result
    }

    async fn refresh_locked(
        &self,
        key: &ConnectionKey,
        request: RefreshRequest,
        started_at: DateTime<Utc>,
    ) -> LockedOutcome {
        let token = match self.store.get(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return LockedOutcome::local(Err(RefreshError::NotConnected)),
            Err(e) => return LockedOutcome::local(Err(RefreshError::Persistence(e.to_string()))),
        };

        let now = Utc::now();

        // Another holder refreshed while this call waited
        let refreshed_meanwhile = token.last_successful_refresh_at.is_some_and(|at| at >= started_at);
        if refreshed_meanwhile || (!request.force && !token.expires_within(now, request.window)) {
            debug!(user = %key.user, provider = %key.provider, "Token already valid");
            return LockedOutcome::local(Ok(RefreshSuccess::AlreadyValid {
                expires_at: token.expires_at,
            }));
        }

        if token.requires_user_intervention {
            let err = token
                .last_refresh_error
                .as_ref()
                .filter(|record| record.class == FailureClass::Permanent)
                .map(|record| RefreshError::from_record(record, token.refresh_failure_count))
                .unwrap_or_else(|| RefreshError::Permanent {
                    error_type: "reconnection_required".to_string(),
                    message: "Connection must be re-authorized".to_string(),
                });
            return LockedOutcome::local(Err(err));
        }

        // Another holder failed while this call waited; share its outcome
        if let (Some(attempted_at), Some(record)) =
            (token.last_refresh_attempt_at, token.last_refresh_error.as_ref())
        {
            if attempted_at >= started_at {
                debug!(user = %key.user, provider = %key.provider, "Sharing concurrent refresh failure");
                return LockedOutcome::local(Err(RefreshError::from_record(
                    record,
                    token.refresh_failure_count,
                )));
            }
        }

        let Some(client) = self.providers.get(&key.provider) else {
            return LockedOutcome::local(Err(RefreshError::ProviderUnavailable(
                key.provider.to_string(),
            )));
        };

        let Some(refresh_token) = token.refresh_token.clone() else {
            let missing = ProviderError::InvalidGrant("no refresh token stored".to_string());
            return self.record_failure(key, token, request, missing, now).await;
        };

        info!(user = %key.user, provider = %key.provider, "Refreshing access token");
        let exchange = tokio::time::timeout(
            self.config.refresh_timeout,
            client.refresh_token(&refresh_token),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout(self.config.refresh_timeout)));

        let now = Utc::now();
        match exchange {
            Ok(grant) => {
                let expires_at = grant.expires_at(now);
                let stored = self
                    .store_refreshed(key, token, &refresh_token, &grant, request, now)
                    .await;

                let result = match stored {
                    Ok(_) => {
                        info!(user = %key.user, provider = %key.provider, "Token refreshed");
                        self.invalidate_health_cache(key).await;
                        Ok(RefreshSuccess::Refreshed { expires_at })
                    }
                    Err(e) => {
                        error!(
                            user = %key.user,
                            provider = %key.provider,
                            reason = "persistence_failure",
                            "Refreshed token could not be stored: {}",
                            e
                        );
                        Err(persistence_error(e))
                    }
                };
                LockedOutcome {
                    result,
                    exchanged: true,
                    failure_count: 0,
                }
            }
            Err(provider_error) => self.record_failure(key, token, request, provider_error, now).await,
        }
    }

    /// Persist refreshed credentials.
    ///
    /// A version conflict is merged into the current record as long as it
    /// still holds the refresh token that was exchanged; the provider may
    /// already have revoked that token.
    async fn store_refreshed(
        &self,
        key: &ConnectionKey,
        token: Token,
        exchanged: &Secret,
        grant: &TokenGrant,
        request: RefreshRequest,
        now: DateTime<Utc>,
    ) -> cloudlink_common::Result<Token> {
        let apply = |mut token: Token| {
            token.apply_refresh(
                grant.access_token.clone(),
                grant.refresh_token.clone(),
                grant.expires_at(now),
                now,
            );
            if request.scheduled_at.is_some() {
                token.proactive_refresh_scheduled_at = request.scheduled_at;
            }
            token.updated_at = now;
            token
        };

        let expected_version = token.version;
        match self.store.compare_and_update(key, expected_version, apply(token)).await {
            Err(Error::Conflict(msg)) => {
                warn!(user = %key.user, provider = %key.provider, "Token changed during refresh, merging: {}", msg);
                let current = self
                    .store
                    .get(key)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("No token for {}", key)))?;
                if current.refresh_token.as_ref() != Some(exchanged) {
                    return Err(Error::Conflict(format!(
                        "Token {} was re-granted during refresh",
                        key
                    )));
                }
                let version = current.version;
                self.store.compare_and_update(key, version, apply(current)).await
            }
            other => other,
        }
    }

    async fn record_failure(
        &self,
        key: &ConnectionKey,
        mut token: Token,
        request: RefreshRequest,
        provider_error: ProviderError,
        now: DateTime<Utc>,
    ) -> LockedOutcome {
        let record = failure_record(&provider_error);
        let class = record.class;
        let expected_version = token.version;

        token.record_refresh_failure(record.clone(), now);
        let failure_count = token.refresh_failure_count;
        token.next_retry_at = match class {
            FailureClass::Transient => Some(self.config.backoff.retry_at(now, failure_count)),
            FailureClass::Permanent => None,
        };
        if request.scheduled_at.is_some() {
            token.proactive_refresh_scheduled_at = request.scheduled_at;
        }
        token.updated_at = now;

        warn!(
            user = %key.user,
            provider = %key.provider,
            reason = record.error_type.as_str(),
            failures = failure_count,
            "Token refresh failed: {}",
            provider_error
        );

        if let Err(e) = self.store.compare_and_update(key, expected_version, token).await {
            error!(user = %key.user, provider = %key.provider, "Failed to record refresh failure: {}", e);
            return LockedOutcome {
                result: Err(persistence_error(e)),
                exchanged: false,
                failure_count: 0,
            };
        }

        if class == FailureClass::Permanent {
            self.invalidate_health_cache(key).await;
        }

        let result = match provider_error {
            ProviderError::Timeout(limit) => Err(RefreshError::Timeout(limit)),
            _ => Err(RefreshError::from_record(&record, failure_count)),
        };
        LockedOutcome {
            result,
            exchanged: true,
            failure_count,
        }
    }

    async fn notify(&self, key: &ConnectionKey, outcome: &LockedOutcome) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        match &outcome.result {
            Err(RefreshError::Permanent { .. }) => {
                notifier.send_token_expired_notification(key).await;
            }
            Err(err @ (RefreshError::Transient { .. } | RefreshError::Timeout(_)))
                if outcome.failure_count >= self.config.notify_after_transient_failures =>
            {
                notifier
                    .send_refresh_failure_notification(key, &err.error_type(), outcome.failure_count)
                    .await;
            }
            _ => {}
        }
    }
}

fn persistence_error(e: Error) -> RefreshError {
    RefreshError::Persistence(e.to_string())
}
