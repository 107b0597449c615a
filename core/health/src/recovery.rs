//! Automatic recovery once a connection is healthy again.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use cloudlink_common::ConnectionKey;

use crate::config::RecoveryConfig;
use crate::notification::{NotificationGateway, NotificationOutcome};
use crate::queue::{FailedOperationStore, JobQueue};

/// What a recovery pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    pub operations_found: usize,
    pub operations_requeued: usize,
    pub requeue_failures: usize,
    pub notification: NotificationOutcome,
}

/// Requeues operations that failed while a connection was down.
pub struct ConnectionRecoveryService {
    operations: Arc<dyn FailedOperationStore>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<NotificationGateway>,
    config: RecoveryConfig,
}

impl ConnectionRecoveryService {
    pub fn new(
        operations: Arc<dyn FailedOperationStore>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<NotificationGateway>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            operations,
            queue,
            notifier,
            config,
        }
    }

    /// Requeue recoverable failed operations and tell the user once.
    ///
    /// A failing operation does not stop the others from being requeued.
    pub async fn attempt_automatic_recovery(&self, key: &ConnectionKey) -> RecoveryResult {
        let operations = match self
            .operations
            .failed_operations(key, &self.config.recoverable_error_categories)
            .await
        {
            Ok(operations) => operations,
            Err(e) => {
                warn!(user = %key.user, provider = %key.provider, "Failed to list failed operations: {}", e);
                Vec::new()
            }
        };

        let mut requeued = 0;
        let mut failures = 0;
        for operation in &operations {
            let job = json!({
                "operation_id": operation.id,
                "user": key.user.as_str(),
                "provider": key.provider.as_str(),
                "error_category": operation.error_category,
                "payload": operation.payload,
            });
            match self.queue.enqueue(&self.config.job_type, job).await {
                Ok(job_id) => {
                    requeued += 1;
                    if let Err(e) = self.operations.mark_requeued(&operation.id).await {
                        warn!(operation = %operation.id, job = %job_id, "Requeued operation not marked: {}", e);
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        user = %key.user,
                        provider = %key.provider,
                        operation = %operation.id,
                        "Failed to requeue operation: {}",
                        e
                    );
                }
            }
        }

        let notification = self
            .notifier
            .send_connection_restored_notification(key, requeued)
            .await;

        info!(
            user = %key.user,
            provider = %key.provider,
            "Connection recovered: {} of {} operations requeued",
            requeued,
            operations.len()
        );

        RecoveryResult {
            operations_found: operations.len(),
            operations_requeued: requeued,
            requeue_failures: failures,
            notification,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudlink_common::Secret;
    use cloudlink_store::{MemoryLock, MemoryTokenStore, Token, TokenStore};

    use crate::config::NotificationConfig;
    use crate::notification::MemoryMailer;
    use crate::queue::{FailedOperation, MemoryFailedOperations, MemoryJobQueue};

    fn key() -> ConnectionKey {
        ConnectionKey::parse("42", "google-drive").unwrap()
    }

    struct Harness {
        service: ConnectionRecoveryService,
        operations: Arc<MemoryFailedOperations>,
        queue: Arc<MemoryJobQueue>,
        mailer: Arc<MemoryMailer>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .insert(Token::from_grant(key(), Secret::new("a"), Some(Secret::new("r")), None))
            .await
            .unwrap();
        let mailer = Arc::new(MemoryMailer::new());
        let notifier = Arc::new(NotificationGateway::new(
            store,
            Arc::new(MemoryLock::new()),
            mailer.clone(),
            NotificationConfig::default(),
        ));
        let operations = Arc::new(MemoryFailedOperations::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let service = ConnectionRecoveryService::new(
            operations.clone(),
            queue.clone(),
            notifier,
            RecoveryConfig::default(),
        );
        Harness {
            service,
            operations,
            queue,
            mailer,
        }
    }

    #[tokio::test]
    async fn test_requeues_recoverable_operations_and_notifies_once() {
        let h = harness().await;
        h.operations.record(FailedOperation::new(key(), "network_error", json!({ "file": "a" })));
        h.operations.record(FailedOperation::new(key(), "token_expired", json!({ "file": "b" })));
        h.operations.record(FailedOperation::new(key(), "quota_exceeded", json!({ "file": "c" })));

        let result = h.service.attempt_automatic_recovery(&key()).await;
        assert_eq!(result.operations_found, 2);
        assert_eq!(result.operations_requeued, 2);
        assert_eq!(result.notification, NotificationOutcome::Sent);

        let jobs = h.queue.jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.job_type == "retry_upload"));
        assert_eq!(h.mailer.sent_with_template("connection_restored").len(), 1);
        assert_eq!(h.mailer.sent()[0].payload["requeued_operations"], 2);
        assert_eq!(h.operations.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_one_failed_requeue_does_not_stop_others() {
        let h = harness().await;
        let bad = FailedOperation::new(key(), "timeout", json!({ "file": "bad" }));
        h.queue.reject_payload(json!({
            "operation_id": bad.id,
            "user": "42",
            "provider": "google-drive",
            "error_category": "timeout",
            "payload": { "file": "bad" },
        }));
        h.operations.record(bad);
        h.operations.record(FailedOperation::new(key(), "timeout", json!({ "file": "good" })));

        let result = h.service.attempt_automatic_recovery(&key()).await;
        assert_eq!(result.operations_requeued, 1);
        assert_eq!(result.requeue_failures, 1);
        assert_eq!(h.mailer.sent_with_template("connection_restored").len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_requeue_still_notifies() {
        let h = harness().await;
        let result = h.service.attempt_automatic_recovery(&key()).await;
        assert_eq!(result.operations_found, 0);
        assert_eq!(result.notification, NotificationOutcome::Sent);
    }
}
