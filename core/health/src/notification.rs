//! User notifications with per-category throttling and admin escalation.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use cloudlink_common::{ConnectionKey, Error, UserId};
use cloudlink_store::{DistributedLock, NotificationCategory, Token, TokenStore};

use crate::config::{NotificationConfig, RefreshConfig};

/// Compare-and-update retries for notification bookkeeping.
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Template used when delivery failures are escalated.
const ESCALATION_TEMPLATE: &str = "notification_delivery_failure";

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Administrator(String),
}

/// Mail delivery failure.
#[derive(Debug, Clone, Error)]
#[error("Delivery to {recipient} failed: {message}")]
pub struct DeliveryError {
    pub recipient: String,
    pub message: String,
}

/// Outbound mail collaborator.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Render `template` with `payload` and deliver it.
    async fn send(
        &self,
        template: &str,
        recipient: &Recipient,
        payload: &Value,
    ) -> std::result::Result<(), DeliveryError>;
}

/// What happened to a notification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Sent,
    /// Same category already delivered inside the throttle window.
    Throttled,
    /// Delivery failed; `escalated` if the administrator was alerted.
    Failed { escalated: bool },
    /// No token is stored, so there is no one to notify.
    Skipped,
}

/// Sends user-facing notifications at most once per category and window.
///
/// Throttle bookkeeping lives on the token, so it is written under the
/// same `refresh:{user}:{provider}` lock the coordinator holds.
pub struct NotificationGateway {
    store: Arc<dyn TokenStore>,
    lock: Arc<dyn DistributedLock>,
    mailer: Arc<dyn Mailer>,
    config: NotificationConfig,
    lock_wait: Duration,
    lock_ttl: Duration,
}

impl NotificationGateway {
    pub fn new(
        store: Arc<dyn TokenStore>,
        lock: Arc<dyn DistributedLock>,
        mailer: Arc<dyn Mailer>,
        config: NotificationConfig,
    ) -> Self {
        let refresh = RefreshConfig::default();
        Self {
            store,
            lock,
            mailer,
            config,
            lock_wait: refresh.lock_wait,
            lock_ttl: refresh.lock_ttl,
        }
    }

    /// Use the refresh lock timings of `refresh` for bookkeeping writes.
    pub fn with_lock_timing(mut self, refresh: &RefreshConfig) -> Self {
        self.lock_wait = refresh.lock_wait;
        self.lock_ttl = refresh.lock_ttl;
        self
    }

    /// Tell the user their connection needs to be re-authorized.
    pub async fn send_token_expired_notification(&self, key: &ConnectionKey) -> NotificationOutcome {
        self.deliver(
            key,
            NotificationCategory::TokenExpired,
            json!({ "provider": key.provider.as_str() }),
        )
        .await
    }

    /// Tell the user refreshes keep failing.
    pub async fn send_refresh_failure_notification(
        &self,
        key: &ConnectionKey,
        error_type: &str,
        attempt_count: u32,
    ) -> NotificationOutcome {
        self.deliver(
            key,
            NotificationCategory::RefreshFailure,
            json!({
                "provider": key.provider.as_str(),
                "error_type": error_type,
                "attempt_count": attempt_count,
            }),
        )
        .await
    }

    /// Tell the user the connection works again.
    pub async fn send_connection_restored_notification(
        &self,
        key: &ConnectionKey,
        requeued_operations: usize,
    ) -> NotificationOutcome {
        self.deliver(
            key,
            NotificationCategory::ConnectionRestored,
            json!({
                "provider": key.provider.as_str(),
                "requeued_operations": requeued_operations,
            }),
        )
        .await
    }

    async fn deliver(
        &self,
        key: &ConnectionKey,
        category: NotificationCategory,
        payload: Value,
    ) -> NotificationOutcome {
        let token = match self.store.get(key).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(user = %key.user, provider = %key.provider, category = %category, "No token, notification skipped");
                return NotificationOutcome::Skipped;
            }
            Err(e) => {
                // Without the throttle record we cannot honor the window
                error!(user = %key.user, provider = %key.provider, "Failed to load token for notification: {}", e);
                return NotificationOutcome::Failed { escalated: false };
            }
        };

        let now = Utc::now();
        if let Some(last) = token.last_notified(category) {
            if now - last < self.config.throttle_window() {
                debug!(
                    user = %key.user,
                    provider = %key.provider,
                    category = %category,
                    "Notification throttled, last sent at {}",
                    last
                );
                return NotificationOutcome::Throttled;
            }
        }

        let recipient = Recipient::User(key.user.clone());
        match self.mailer.send(category.as_str(), &recipient, &payload).await {
            Ok(()) => {
                info!(user = %key.user, provider = %key.provider, category = %category, "Notification sent");
                let recorded = self
                    .update_token(key, |token| {
                        token.last_notification_sent_at.insert(category, now);
                        token.notification_failure_count = 0;
                    })
                    .await;
                if let Err(e) = recorded {
                    warn!(user = %key.user, provider = %key.provider, "Failed to record notification: {}", e);
                }
                NotificationOutcome::Sent
            }
            Err(delivery_error) => {
                warn!(user = %key.user, provider = %key.provider, category = %category, "{}", delivery_error);
                let failures = match self
                    .update_token(key, |token| {
                        token.notification_failure_count =
                            token.notification_failure_count.saturating_add(1);
                    })
                    .await
                {
                    Ok(token) => token.notification_failure_count,
                    Err(e) => {
                        warn!(user = %key.user, provider = %key.provider, "Failed to record delivery failure: {}", e);
                        token.notification_failure_count.saturating_add(1)
                    }
                };

                let escalated = if failures >= self.config.escalation_threshold {
                    self.escalate(key, category, &payload, &delivery_error, failures)
                        .await
                } else {
                    false
                };
                NotificationOutcome::Failed { escalated }
            }
        }
    }

    async fn escalate(
        &self,
        key: &ConnectionKey,
        category: NotificationCategory,
        payload: &Value,
        delivery_error: &DeliveryError,
        failures: u32,
    ) -> bool {
        let Some(admin) = &self.config.admin_contact else {
            warn!(user = %key.user, "Notification failures reached {} but no admin contact is configured", failures);
            return false;
        };

        let alert = json!({
            "user": key.user.as_str(),
            "provider": key.provider.as_str(),
            "category": category.as_str(),
            "consecutive_failures": failures,
            "error": delivery_error.to_string(),
            "original_payload": payload,
        });
        match self
            .mailer
            .send(ESCALATION_TEMPLATE, &Recipient::Administrator(admin.clone()), &alert)
            .await
        {
            Ok(()) => {
                info!(user = %key.user, provider = %key.provider, "Notification failures escalated to administrator");
                true
            }
            Err(e) => {
                error!(user = %key.user, provider = %key.provider, "Escalation failed: {}", e);
                false
            }
        }
    }

    /// Apply `change` to the stored token while holding the refresh lock.
    async fn update_token<F>(&self, key: &ConnectionKey, change: F) -> cloudlink_common::Result<Token>
    where
        F: Fn(&mut Token) + Send + Sync,
    {
        let handle = self
            .lock
            .acquire(&key.lock_key(), self.lock_wait, self.lock_ttl)
            .await?
            .ok_or_else(|| {
                Error::Lock(format!(
                    "Refresh lock for {} busy for {:?}",
                    key, self.lock_wait
                ))
            })?;

        let updated = self.update_locked(key, &change).await;

        match self.lock.release(&handle).await {
            Ok(true) => {}
            Ok(false) => warn!(user = %key.user, provider = %key.provider, "Lock expired during notification bookkeeping"),
            Err(e) => error!(user = %key.user, provider = %key.provider, "Failed to release refresh lock: {}", e),
        }
        updated
    }

    /// Retries version conflicts from grants stored while the lock was held.
    async fn update_locked<F>(&self, key: &ConnectionKey, change: &F) -> cloudlink_common::Result<Token>
    where
        F: Fn(&mut Token) + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut token = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("No token for {}", key)))?;
            let expected_version = token.version;
            change(&mut token);
            token.updated_at = Utc::now();

            match self.store.compare_and_update(key, expected_version, token).await {
                Err(Error::Conflict(msg)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(user = %key.user, provider = %key.provider, "Retrying notification bookkeeping: {}", msg);
                }
                other => return other,
            }
        }
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message accepted by [`MemoryMailer`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub template: String,
    pub recipient: Recipient,
    pub payload: Value,
}

/// Mailer that records messages in memory.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<VecDeque<String>>,
    fail_users: Mutex<Option<String>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next delivery, whoever it is addressed to.
    pub fn fail_next(&self, message: impl Into<String>) -> &Self {
        guard(&self.failures).push_back(message.into());
        self
    }

    /// Fail every delivery to users until cleared; administrators still receive mail.
    pub fn fail_user_deliveries(&self, message: Option<&str>) {
        *guard(&self.fail_users) = message.map(str::to_string);
    }

    /// Delivered messages in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        guard(&self.sent).clone()
    }

    /// Delivered messages using `template`.
    pub fn sent_with_template(&self, template: &str) -> Vec<SentMessage> {
        guard(&self.sent)
            .iter()
            .filter(|m| m.template == template)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(
        &self,
        template: &str,
        recipient: &Recipient,
        payload: &Value,
    ) -> std::result::Result<(), DeliveryError> {
        let describe = || match recipient {
            Recipient::User(user) => format!("user {}", user),
            Recipient::Administrator(contact) => contact.clone(),
        };

        if let Some(message) = guard(&self.failures).pop_front() {
            return Err(DeliveryError {
                recipient: describe(),
                message,
            });
        }
        if let Recipient::User(_) = recipient {
            if let Some(message) = guard(&self.fail_users).clone() {
                return Err(DeliveryError {
                    recipient: describe(),
                    message,
                });
            }
        }

        guard(&self.sent).push(SentMessage {
            template: template.to_string(),
            recipient: recipient.clone(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
