//! Live validation of a connection against its provider.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use cloudlink_common::ConnectionKey;
use cloudlink_providers::{ProbeReport, ProviderClient, ProviderClients, ProviderError};
use cloudlink_store::{Token, TokenStore};

use crate::config::ValidationConfig;
use crate::error::{RefreshError, RefreshSuccess};
use crate::renewal::ProactiveTokenRenewalService;
use crate::status::{HealthError, HealthStatus, ValidatorOutcome};

/// Validates connections by refreshing if needed and probing the provider.
///
/// Never writes tokens; refreshes go through the renewal service.
pub struct RealTimeHealthValidator {
    store: Arc<dyn TokenStore>,
    renewal: Arc<ProactiveTokenRenewalService>,
    providers: ProviderClients,
    config: ValidationConfig,
}

impl RealTimeHealthValidator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        renewal: Arc<ProactiveTokenRenewalService>,
        providers: ProviderClients,
        config: ValidationConfig,
    ) -> Self {
        Self {
            store,
            renewal,
            providers,
            config,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate one connection.
    ///
    /// Failures are reported in the returned status, never as errors.
    pub async fn validate_connection_health(&self, key: &ConnectionKey) -> HealthStatus {
        let token = match self.load(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return self.status(key, None, ValidatorOutcome::NotConnected, None),
            Err(error) => {
                return self.status(key, None, ValidatorOutcome::ConnectivityError, Some(error));
            }
        };

        let refresh = self.renewal.refresh_token_if_needed(key).await;

        // Pick up whatever the refresh wrote
        let token = match self.load(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return self.status(key, None, ValidatorOutcome::NotConnected, None),
            Err(_) => token,
        };

        if let Err(err) = &refresh {
            if err.is_permanent() || token.requires_user_intervention {
                let error = HealthError::new(err.error_type(), err.to_string());
                return self.status(key, Some(&token), ValidatorOutcome::AuthenticationError, Some(error));
            }
            // A token still inside its lifetime is worth probing anyway
            if token.is_expired() || matches!(err, RefreshError::NotConnected) {
                debug!(user = %key.user, provider = %key.provider, reason = err.reason(), "Refresh failed on expired token");
                let error = HealthError::new(err.error_type(), err.to_string());
                return self.status(key, Some(&token), ValidatorOutcome::ConnectivityError, Some(error));
            }
        }

        let Some(client) = self.providers.get(&key.provider) else {
            let error = HealthError::new(
                "provider_unavailable",
                format!("No client configured for provider '{}'", key.provider),
            );
            return self.status(key, Some(&token), ValidatorOutcome::ConnectivityError, Some(error));
        };

        let probe = self.probe(client.as_ref(), &token).await;
        let refreshed = matches!(refresh, Ok(RefreshSuccess::Refreshed { .. }));

        // A rejected access token gets one forced refresh and one more probe
        let (token, probe) = match probe {
            Err(err) if !err.is_connectivity() && !refreshed => {
                debug!(user = %key.user, provider = %key.provider, reason = err.error_type(), "Probe rejected, refreshing");
                if let Err(refresh_err) = self.renewal.refresh_after_rejection(key).await {
                    let token = match self.load(key).await {
                        Ok(Some(token)) => token,
                        _ => token,
                    };
                    let outcome = if refresh_err.is_permanent() || token.requires_user_intervention {
                        ValidatorOutcome::AuthenticationError
                    } else {
                        ValidatorOutcome::ConnectivityError
                    };
                    let error = HealthError::new(refresh_err.error_type(), refresh_err.to_string());
                    return self.status(key, Some(&token), outcome, Some(error));
                }
                let token = match self.load(key).await {
                    Ok(Some(token)) => token,
                    Ok(None) => return self.status(key, None, ValidatorOutcome::NotConnected, None),
                    Err(_) => token,
                };
                let retry = self.probe(client.as_ref(), &token).await;
                (token, retry)
            }
            other => (token, other),
        };

        match probe {
            Ok(report) => {
                let mut status = self.status(key, Some(&token), ValidatorOutcome::Success, None);
                status.account = report.account;
                status
            }
            Err(err) => {
                let error_type = match &err {
                    ProviderError::Timeout(_) => "probe_timeout",
                    other => other.error_type(),
                };
                let outcome = if err.is_connectivity() {
                    ValidatorOutcome::ConnectivityError
                } else {
                    ValidatorOutcome::AuthenticationError
                };
                warn!(
                    user = %key.user,
                    provider = %key.provider,
                    reason = error_type,
                    "Probe failed: {}",
                    err
                );
                self.status(key, Some(&token), outcome, Some(HealthError::new(error_type, err.to_string())))
            }
        }
    }

    async fn probe(&self, client: &dyn ProviderClient, token: &Token) -> Result<ProbeReport, ProviderError> {
        tokio::time::timeout(self.config.probe_timeout, client.probe(&token.access_token))
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.config.probe_timeout)))
    }

    async fn load(&self, key: &ConnectionKey) -> Result<Option<Token>, HealthError> {
        self.store.get(key).await.map_err(|e| {
            warn!(user = %key.user, provider = %key.provider, "Failed to load token: {}", e);
            HealthError::new("persistence_failure", e.to_string())
        })
    }

    fn status(
        &self,
        key: &ConnectionKey,
        token: Option<&Token>,
        outcome: ValidatorOutcome,
        error: Option<HealthError>,
    ) -> HealthStatus {
        HealthStatus::evaluate(key, token, outcome, error, &self.config, Utc::now())
    }
}
