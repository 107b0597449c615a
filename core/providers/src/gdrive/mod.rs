//! Google Drive provider client for cloudlink.
//!
//! This module provides:
//! - OAuth2 refresh-token exchange with error classification
//! - A lightweight `about` probe for connectivity checks
//! - Provider construction from JSON configuration

pub mod auth;
pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use cloudlink_common::{Error, ProviderId, Result, Secret};

use crate::provider::{ProbeReport, ProviderClient, ProviderError, TokenGrant};

pub use auth::{AuthConfig, TokenRefresher};
pub use client::DriveClient;

/// Provider id the Google Drive client registers under.
pub const PROVIDER_ID: &str = "google-drive";

/// Google Drive provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GDriveConfig {
    /// OAuth2 client configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    15
}

/// Google Drive provider client.
pub struct GDriveProvider {
    id: ProviderId,
    refresher: TokenRefresher,
    client: DriveClient,
}

impl GDriveProvider {
    /// Create a new Google Drive provider client.
    ///
    /// # Errors
    /// - Invalid OAuth endpoint configuration
    /// - HTTP client construction failure
    pub fn new(config: GDriveConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        Ok(Self {
            id: ProviderId::new(PROVIDER_ID)?,
            refresher: TokenRefresher::new(config.auth, timeout)?,
            client: DriveClient::new(timeout)?,
        })
    }
}

#[async_trait]
impl ProviderClient for GDriveProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.id
    }

    async fn refresh_token(&self, refresh_token: &Secret) -> std::result::Result<TokenGrant, ProviderError> {
        self.refresher.refresh(refresh_token).await
    }

    async fn probe(&self, access_token: &Secret) -> std::result::Result<ProbeReport, ProviderError> {
        self.client.about(access_token).await
    }
}

/// Create a Google Drive provider from JSON configuration.
pub fn create_gdrive_provider(config: Value) -> Result<Arc<dyn ProviderClient>> {
    let config: GDriveConfig = if config.is_null() {
        GDriveConfig::default()
    } else {
        serde_json::from_value(config)
            .map_err(|e| Error::InvalidInput(format!("Invalid google-drive config: {}", e)))?
    };
    if config.request_timeout_secs == 0 {
        return Err(Error::InvalidInput(
            "google-drive request_timeout_secs must be positive".to_string(),
        ));
    }
    Ok(Arc::new(GDriveProvider::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_from_config() {
        let provider = create_gdrive_provider(serde_json::json!({
            "auth": { "client_id": "id", "client_secret": "secret" },
            "request_timeout_secs": 5
        }))
        .unwrap();
        assert_eq!(provider.provider_id().as_str(), PROVIDER_ID);
    }

    #[test]
    fn test_null_config_uses_defaults() {
        assert!(create_gdrive_provider(Value::Null).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = create_gdrive_provider(serde_json::json!({ "request_timeout_secs": 0 }));
        assert!(result.is_err());
    }
}
