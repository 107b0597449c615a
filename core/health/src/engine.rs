//! Wiring of all health services around shared collaborators.

use std::sync::Arc;

use cloudlink_common::Result;
use cloudlink_providers::ProviderClients;
use cloudlink_store::{DistributedLock, KeyValueCache, TokenStore};

use crate::config::HealthConfig;
use crate::coordinator::TokenRefreshCoordinator;
use crate::notification::{Mailer, NotificationGateway};
use crate::queue::{FailedOperationStore, JobQueue};
use crate::recovery::ConnectionRecoveryService;
use crate::renewal::ProactiveTokenRenewalService;
use crate::scheduler::{RenewalScheduler, RenewalSchedulerHandle};
use crate::service::CloudStorageHealthService;
use crate::validator::RealTimeHealthValidator;

/// External collaborators the engine is built from.
pub struct Collaborators {
    pub store: Arc<dyn TokenStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub cache: Arc<dyn KeyValueCache>,
    pub providers: ProviderClients,
    pub mailer: Arc<dyn Mailer>,
    pub queue: Arc<dyn JobQueue>,
    pub failed_operations: Arc<dyn FailedOperationStore>,
}

/// All services of one deployment, sharing the same collaborators.
pub struct HealthEngine {
    config: HealthConfig,
    notifications: Arc<NotificationGateway>,
    coordinator: Arc<TokenRefreshCoordinator>,
    renewal: Arc<ProactiveTokenRenewalService>,
    validator: Arc<RealTimeHealthValidator>,
    recovery: Arc<ConnectionRecoveryService>,
    health: Arc<CloudStorageHealthService>,
}

impl HealthEngine {
    /// Validate `config` and build every service.
    pub fn new(config: HealthConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            store,
            lock,
            cache,
            providers,
            mailer,
            queue,
            failed_operations,
        } = collaborators;

        let notifications = Arc::new(
            NotificationGateway::new(
                store.clone(),
                lock.clone(),
                mailer,
                config.notifications.clone(),
            )
            .with_lock_timing(&config.refresh),
        );
        let coordinator = Arc::new(
            TokenRefreshCoordinator::new(
                store.clone(),
                lock,
                cache.clone(),
                providers.clone(),
                config.refresh.clone(),
            )
            .with_notifier(notifications.clone()),
        );
        let renewal = Arc::new(ProactiveTokenRenewalService::new(
            store.clone(),
            coordinator.clone(),
            config.renewal.clone(),
        ));
        let validator = Arc::new(RealTimeHealthValidator::new(
            store,
            renewal.clone(),
            providers,
            config.validation.clone(),
        ));
        let recovery = Arc::new(ConnectionRecoveryService::new(
            failed_operations,
            queue,
            notifications.clone(),
            config.recovery.clone(),
        ));
        let health = Arc::new(
            CloudStorageHealthService::new(cache, validator.clone(), config.validation.clone())
                .with_recovery(recovery.clone()),
        );

        Ok(Self {
            config,
            notifications,
            coordinator,
            renewal,
            validator,
            recovery,
            health,
        })
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn notifications(&self) -> Arc<NotificationGateway> {
        self.notifications.clone()
    }

    pub fn coordinator(&self) -> Arc<TokenRefreshCoordinator> {
        self.coordinator.clone()
    }

    pub fn renewal(&self) -> Arc<ProactiveTokenRenewalService> {
        self.renewal.clone()
    }

    pub fn validator(&self) -> Arc<RealTimeHealthValidator> {
        self.validator.clone()
    }

    pub fn recovery(&self) -> Arc<ConnectionRecoveryService> {
        self.recovery.clone()
    }

    pub fn health(&self) -> Arc<CloudStorageHealthService> {
        self.health.clone()
    }

    /// Create the renewal scheduler; spawn `handle.run(engine.renewal())`.
    pub fn init_scheduler(&self) -> (RenewalScheduler, RenewalSchedulerHandle) {
        RenewalScheduler::new(self.config.renewal.sweep_interval)
    }
}
