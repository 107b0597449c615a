//! Google Drive API client.

use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use cloudlink_common::{Error, Result, Secret};

use crate::provider::{ProbeReport, ProviderError};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Response from the `about` endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutResponse {
    #[serde(default)]
    user: Option<AboutUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("cloudlink/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: DRIVE_API_BASE.to_string(),
            timeout,
        })
    }

    /// Fetch the account behind the token. Read-only and cheap.
    pub async fn about(&self, access_token: &Secret) -> std::result::Result<ProbeReport, ProviderError> {
        let url = format!("{}/about", self.base_url);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token.expose()))
            .query(&[("fields", "user(emailAddress,displayName)")])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Network(format!("Failed to reach Drive API: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let about: AboutResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
            return Ok(ProbeReport {
                account: about
                    .user
                    .and_then(|u| u.email_address.or(u.display_name)),
            });
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body, retry_after))
    }
}

/// Map a non-success Drive API status onto the provider taxonomy.
fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized("Invalid or expired token".to_string()),
        // Drive reports quota exhaustion as 403 with a rate limit reason
        StatusCode::FORBIDDEN if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            ProviderError::RateLimited { retry_after }
        }
        StatusCode::FORBIDDEN => ProviderError::Unauthorized("Access denied".to_string()),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        _ => ProviderError::Server {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        },
    }
}
