//! Scripted in-memory provider for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cloudlink_common::{ProviderId, Secret};

use crate::provider::{ProbeReport, ProviderClient, ProviderError, TokenGrant};

type RefreshResponse = Result<TokenGrant, ProviderError>;
type ProbeResponse = Result<ProbeReport, ProviderError>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provider whose responses are queued up front.
///
/// Queued responses are consumed in order; once a queue is empty the
/// default response is returned. Every call is counted, which is what
/// concurrency tests assert on.
pub struct ScriptedProvider {
    id: ProviderId,
    refresh_responses: Mutex<VecDeque<RefreshResponse>>,
    probe_responses: Mutex<VecDeque<ProbeResponse>>,
    default_refresh: Mutex<RefreshResponse>,
    default_probe: Mutex<ProbeResponse>,
    latency: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    probed_tokens: Mutex<Vec<String>>,
    issued: AtomicUsize,
}

impl ScriptedProvider {
    /// Create a provider that refreshes and probes successfully.
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            refresh_responses: Mutex::new(VecDeque::new()),
            probe_responses: Mutex::new(VecDeque::new()),
            default_refresh: Mutex::new(Err(ProviderError::Unsupported(
                "default grant is generated".to_string(),
            ))),
            default_probe: Mutex::new(Ok(ProbeReport::default())),
            latency: Mutex::new(Duration::ZERO),
            refresh_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            probed_tokens: Mutex::new(Vec::new()),
            issued: AtomicUsize::new(0),
        }
        .with_generated_grants()
    }

    fn with_generated_grants(self) -> Self {
        *guard(&self.default_refresh) = Ok(self.next_grant());
        self
    }

    fn next_grant(&self) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            access_token: Secret::new(format!("access-{}", n)),
            refresh_token: Some(Secret::new(format!("refresh-{}", n))),
            expires_in: Some(Duration::from_secs(3600)),
        }
    }

    /// Delay applied to every call, to widen race windows.
    pub fn set_latency(&self, latency: Duration) {
        *guard(&self.latency) = latency;
    }

    /// Queue the next refresh response.
    pub fn queue_refresh(&self, response: RefreshResponse) -> &Self {
        guard(&self.refresh_responses).push_back(response);
        self
    }

    /// Queue the next probe response.
    pub fn queue_probe(&self, response: ProbeResponse) -> &Self {
        guard(&self.probe_responses).push_back(response);
        self
    }

    /// Response used once the refresh queue is empty.
    pub fn set_default_refresh(&self, response: RefreshResponse) {
        *guard(&self.default_refresh) = response;
    }

    /// Response used once the probe queue is empty.
    pub fn set_default_probe(&self, response: ProbeResponse) {
        *guard(&self.default_probe) = response;
    }

    /// Number of refresh exchanges performed.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of probes performed.
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Access tokens seen by probes, in call order.
    pub fn probed_tokens(&self) -> Vec<String> {
        guard(&self.probed_tokens).clone()
    }

    async fn simulate_latency(&self) {
        let latency = *guard(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.id
    }

    async fn refresh_token(&self, _refresh_token: &Secret) -> Result<TokenGrant, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let queued = guard(&self.refresh_responses).pop_front();
        match queued {
            Some(response) => response,
            None => {
                let response = guard(&self.default_refresh).clone();
                if response.is_ok() {
                    // Hand out distinct tokens on every default success
                    let grant = self.next_grant();
                    *guard(&self.default_refresh) = Ok(grant);
                }
                response
            }
        }
    }

    async fn probe(&self, access_token: &Secret) -> Result<ProbeReport, ProviderError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        guard(&self.probed_tokens).push(access_token.expose().to_string());
        self.simulate_latency().await;

        let queued = guard(&self.probe_responses).pop_front();
        queued.unwrap_or_else(|| guard(&self.default_probe).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ScriptedProvider {
        ScriptedProvider::new(ProviderId::new("memory").unwrap())
    }

    #[tokio::test]
    async fn test_default_refresh_issues_distinct_tokens() {
        let provider = provider();
        let first = provider.refresh_token(&Secret::new("r")).await.unwrap();
        let second = provider.refresh_token(&Secret::new("r")).await.unwrap();
        assert_ne!(first.access_token.expose(), second.access_token.expose());
        assert_eq!(provider.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_queued_responses_come_first() {
        let provider = provider();
        provider.queue_refresh(Err(ProviderError::InvalidGrant("revoked".into())));

        let err = provider.refresh_token(&Secret::new("r")).await.unwrap_err();
        assert_eq!(err.error_type(), "invalid_grant");
        assert!(provider.refresh_token(&Secret::new("r")).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_records_tokens() {
        let provider = provider();
        provider.queue_probe(Err(ProviderError::Network("down".into())));

        assert!(provider.probe(&Secret::new("t1")).await.is_err());
        assert!(provider.probe(&Secret::new("t2")).await.is_ok());
        assert_eq!(provider.probed_tokens(), vec!["t1", "t2"]);
        assert_eq!(provider.probe_calls(), 2);
    }
}
