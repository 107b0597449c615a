//! Renewal scheduling - periodic sweeps plus on-demand requests.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use cloudlink_common::{Error, Result};

use crate::renewal::{ProactiveTokenRenewalService, RenewalReport};

type SweepResponder = oneshot::Sender<Result<RenewalReport>>;

/// Requests accepted by the scheduler task.
#[derive(Debug)]
enum SchedulerRequest {
    Sweep(SweepResponder),
    Shutdown,
}

/// Client side of the renewal scheduler.
#[derive(Clone)]
pub struct RenewalScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl RenewalScheduler {
    /// Create a scheduler sweeping every `sweep_interval`.
    pub fn new(sweep_interval: Duration) -> (Self, RenewalSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        (
            Self { request_tx },
            RenewalSchedulerHandle {
                sweep_interval,
                request_rx,
            },
        )
    }

    /// Run a sweep now and wait for its report.
    pub async fn request_sweep(&self) -> Result<RenewalReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SchedulerRequest::Sweep(response_tx))
            .await
            .map_err(|_| Error::Unavailable("Renewal scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Unavailable("Renewal scheduler stopped before replying".to_string()))?
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        // Already stopped is fine
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// Handle for the scheduler background task.
pub struct RenewalSchedulerHandle {
    sweep_interval: Duration,
    request_rx: mpsc::Receiver<SchedulerRequest>,
}

impl RenewalSchedulerHandle {
    /// Run the scheduler until shutdown or until every client is dropped.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(mut self, renewal: Arc<ProactiveTokenRenewalService>) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!("Renewal scheduler started, sweeping every {:?}", self.sweep_interval);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(SchedulerRequest::Sweep(response_tx)) => {
                        debug!("Processing on-demand renewal sweep");
                        let _ = response_tx.send(renewal.renew_expiring().await);
                    }
                    Some(SchedulerRequest::Shutdown) | None => {
                        info!("Renewal scheduler shutting down");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    debug!("Triggering periodic renewal sweep");
                    if let Err(e) = renewal.renew_expiring().await {
                        error!("Periodic renewal sweep failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use cloudlink_common::{ConnectionKey, Secret};
    use cloudlink_providers::{ProviderClients, ScriptedProvider};
    use cloudlink_store::{MemoryCache, MemoryLock, MemoryTokenStore, Token, TokenStore};

    use crate::config::{RefreshConfig, RenewalConfig};
    use crate::coordinator::TokenRefreshCoordinator;

    async fn renewal_service(provider: Arc<ScriptedProvider>) -> Arc<ProactiveTokenRenewalService> {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .insert(Token::from_grant(
                ConnectionKey::parse("1", "google-drive").unwrap(),
                Secret::new("a"),
                Some(Secret::new("r")),
                Some(Utc::now() + ChronoDuration::minutes(5)),
            ))
            .await
            .unwrap();
        let mut providers = ProviderClients::new();
        providers.insert(provider);
        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            store.clone(),
            Arc::new(MemoryLock::new()),
            Arc::new(MemoryCache::new()),
            providers,
            RefreshConfig::default(),
        ));
        Arc::new(ProactiveTokenRenewalService::new(store, coordinator, RenewalConfig::default()))
    }

    fn provider() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(
            cloudlink_common::ProviderId::new("google-drive").unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_on_demand_sweep() {
        let provider = provider();
        let renewal = renewal_service(provider.clone()).await;
        let (scheduler, handle) = RenewalScheduler::new(Duration::from_secs(3600));
        let task = tokio::spawn(handle.run(renewal));

        let report = scheduler.request_sweep().await.unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(provider.refresh_calls(), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(scheduler.request_sweep().await.is_err());
    }

    #[tokio::test]
    async fn test_periodic_sweep() {
        let provider = provider();
        let renewal = renewal_service(provider.clone()).await;
        let (scheduler, handle) = RenewalScheduler::new(Duration::from_millis(50));
        let task = tokio::spawn(handle.run(renewal));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(provider.refresh_calls(), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_clients_stops_task() {
        let renewal = renewal_service(provider()).await;
        let (scheduler, handle) = RenewalScheduler::new(Duration::from_secs(3600));
        let task = tokio::spawn(handle.run(renewal));

        drop(scheduler);
        task.await.unwrap();
    }
}
