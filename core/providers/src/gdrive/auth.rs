//! OAuth2 refresh-token exchange for Google Drive.

use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::{
    ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken, RequestTokenError,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use cloudlink_common::{Error, Result, Secret};

use crate::provider::{ProviderError, TokenGrant};

/// OAuth2 client ID placeholder; real deployments configure their own.
const GOOGLE_CLIENT_ID: &str = "YOUR_CLIENT_ID";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Configuration for the OAuth2 token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: GOOGLE_CLIENT_ID.to_string(),
            client_secret: None,
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }
}

type RefreshClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Exchanges refresh tokens at Google's token endpoint.
pub struct TokenRefresher {
    client: RefreshClient,
    http: oauth2::reqwest::Client,
}

impl TokenRefresher {
    /// Create a refresher.
    ///
    /// # Errors
    /// - Invalid token URL
    /// - HTTP client construction failure
    pub fn new(config: AuthConfig, timeout: Duration) -> Result<Self> {
        let token_url = TokenUrl::new(config.token_url.clone())
            .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?;

        let mut client = BasicClient::new(ClientId::new(config.client_id)).set_token_uri(token_url);
        if let Some(secret) = config.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret));
        }

        // Following redirects from the token endpoint would leak credentials
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, http })
    }

    /// Refresh an access token using the refresh token.
    ///
    /// # Errors
    /// - `InvalidGrant` for revoked or expired refresh tokens
    /// - `InvalidClient` for rejected client credentials
    /// - Transient variants for transport failures and other server responses
    pub async fn refresh(&self, refresh_token: &Secret) -> std::result::Result<TokenGrant, ProviderError> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose().to_string()))
            .request_async(&self.http)
            .await
            .map_err(|err| match err {
                RequestTokenError::ServerResponse(response) => classify_server_error(
                    response.error(),
                    response.error_description().map(String::as_str),
                ),
                RequestTokenError::Request(e) => ProviderError::Network(e.to_string()),
                RequestTokenError::Parse(e, _) => ProviderError::InvalidResponse(e.to_string()),
                RequestTokenError::Other(msg) => ProviderError::InvalidResponse(msg),
            })?;

        debug!("Google token endpoint issued a new access token");

        Ok(TokenGrant {
            access_token: Secret::new(response.access_token().secret().clone()),
            refresh_token: response
                .refresh_token()
                .map(|t| Secret::new(t.secret().clone())),
            expires_in: response.expires_in(),
        })
    }
}

/// Map an OAuth2 error response onto the provider taxonomy.
fn classify_server_error(kind: &BasicErrorResponseType, description: Option<&str>) -> ProviderError {
    let message = description.unwrap_or_else(|| kind.as_ref()).to_string();
    match kind {
        BasicErrorResponseType::InvalidGrant => ProviderError::InvalidGrant(message),
        BasicErrorResponseType::InvalidClient | BasicErrorResponseType::UnauthorizedClient => {
            ProviderError::InvalidClient(message)
        }
        _ => ProviderError::Server {
            status: 400,
            message,
        },
    }
}
