//! Failed operation records and the job queue they are requeued into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cloudlink_common::{ConnectionKey, Error, Result};

/// An operation that failed because its connection was unhealthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub id: String,
    pub key: ConnectionKey,
    /// Category of the failure, e.g. `network_error` or `token_expired`.
    pub error_category: String,
    /// Opaque data needed to retry the operation.
    pub payload: Value,
    pub failed_at: DateTime<Utc>,
}

impl FailedOperation {
    pub fn new(key: ConnectionKey, error_category: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key,
            error_category: error_category.into(),
            payload,
            failed_at: Utc::now(),
        }
    }
}

/// Source of failed operations awaiting recovery.
#[async_trait]
pub trait FailedOperationStore: Send + Sync {
    /// Pending operations of a connection whose category is in `categories`.
    async fn failed_operations(
        &self,
        key: &ConnectionKey,
        categories: &[String],
    ) -> Result<Vec<FailedOperation>>;

    /// Mark an operation as requeued so it is not picked up again.
    async fn mark_requeued(&self, id: &str) -> Result<()>;
}

/// Background job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job and return its id.
    async fn enqueue(&self, job_type: &str, payload: Value) -> Result<String>;
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory failed operation store.
#[derive(Default)]
pub struct MemoryFailedOperations {
    pending: Mutex<Vec<FailedOperation>>,
    requeued: Mutex<Vec<String>>,
}

impl MemoryFailedOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: FailedOperation) {
        guard(&self.pending).push(operation);
    }

    /// Ids marked as requeued, in order.
    pub fn requeued(&self) -> Vec<String> {
        guard(&self.requeued).clone()
    }

    pub fn pending_count(&self) -> usize {
        guard(&self.pending).len()
    }
}

#[async_trait]
impl FailedOperationStore for MemoryFailedOperations {
    async fn failed_operations(
        &self,
        key: &ConnectionKey,
        categories: &[String],
    ) -> Result<Vec<FailedOperation>> {
        Ok(guard(&self.pending)
            .iter()
            .filter(|op| &op.key == key && categories.iter().any(|c| c == &op.error_category))
            .cloned()
            .collect())
    }

    async fn mark_requeued(&self, id: &str) -> Result<()> {
        let mut pending = guard(&self.pending);
        let index = pending
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| Error::NotFound(format!("Failed operation '{}'", id)))?;
        pending.remove(index);
        guard(&self.requeued).push(id.to_string());
        Ok(())
    }
}

/// A job accepted by [`MemoryJobQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: String,
    pub job_type: String,
    pub payload: Value,
}

/// In-memory job queue.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
    rejected_payloads: Mutex<Vec<Value>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any job whose payload equals `payload`.
    pub fn reject_payload(&self, payload: Value) {
        guard(&self.rejected_payloads).push(payload);
    }

    pub fn jobs(&self) -> Vec<QueuedJob> {
        guard(&self.jobs).clone()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job_type: &str, payload: Value) -> Result<String> {
        if guard(&self.rejected_payloads).contains(&payload) {
            return Err(Error::Unavailable("job queue rejected payload".to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        guard(&self.jobs).push(QueuedJob {
            id: id.clone(),
            job_type: job_type.to_string(),
            payload,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(user: &str) -> ConnectionKey {
        ConnectionKey::parse(user, "google-drive").unwrap()
    }

    #[tokio::test]
    async fn test_filters_by_connection_and_category() {
        let store = MemoryFailedOperations::new();
        store.record(FailedOperation::new(key("1"), "network_error", json!({ "file": "a" })));
        store.record(FailedOperation::new(key("1"), "quota_exceeded", json!({ "file": "b" })));
        store.record(FailedOperation::new(key("2"), "network_error", json!({ "file": "c" })));

        let found = store
            .failed_operations(&key("1"), &["network_error".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload["file"], "a");
    }

    #[tokio::test]
    async fn test_mark_requeued_removes_pending() {
        let store = MemoryFailedOperations::new();
        let op = FailedOperation::new(key("1"), "timeout", json!({}));
        let id = op.id.clone();
        store.record(op);

        store.mark_requeued(&id).await.unwrap();
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.requeued(), vec![id.clone()]);
        assert!(store.mark_requeued(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_rejection() {
        let queue = MemoryJobQueue::new();
        queue.reject_payload(json!({ "bad": true }));

        assert!(queue.enqueue("retry_upload", json!({ "bad": true })).await.is_err());
        queue.enqueue("retry_upload", json!({ "ok": true })).await.unwrap();
        assert_eq!(queue.jobs().len(), 1);
    }
}
