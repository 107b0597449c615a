//! Cloudlink Health Engine
//!
//! This module keeps OAuth connections to cloud storage providers usable
//! and reports on their health, including:
//! - Single-flight token refresh coordinated through a distributed lock
//! - Proactive renewal ahead of expiry with exponential backoff
//! - Live validation and a cached, consolidated health status
//! - Throttled user notifications with administrator escalation
//! - Automatic requeueing of failed operations once a connection recovers

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod notification;
pub mod queue;
pub mod recovery;
pub mod renewal;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod validator;

// Re-export main types
pub use config::{
    HealthConfig, NotificationConfig, RecoveryConfig, RefreshConfig, RenewalConfig, ValidationConfig,
};
pub use coordinator::TokenRefreshCoordinator;
pub use engine::{Collaborators, HealthEngine};
pub use error::{RefreshError, RefreshResult, RefreshSuccess};
pub use notification::{
    DeliveryError, Mailer, MemoryMailer, NotificationGateway, NotificationOutcome, Recipient,
    SentMessage,
};
pub use queue::{
    FailedOperation, FailedOperationStore, JobQueue, MemoryFailedOperations, MemoryJobQueue,
    QueuedJob,
};
pub use recovery::{ConnectionRecoveryService, RecoveryResult};
pub use renewal::{ProactiveTokenRenewalService, RenewalReport};
pub use retry::BackoffConfig;
pub use scheduler::{RenewalScheduler, RenewalSchedulerHandle};
pub use service::CloudStorageHealthService;
pub use status::{
    derive_consolidated_status, ConsolidatedStatus, HealthError, HealthStatus, ValidatorOutcome,
};
pub use validator::RealTimeHealthValidator;
