//! OAuth2 authorization against Google for Drive accounts.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use skyshard_common::{Error, Result};

use crate::auth::{AccessGrant, Identity, RemoteAuth, TokenBundle};

use super::client::{fetch_about, http_client};

/// OAuth2 client ID placeholder; real values come from the config file.
const GOOGLE_CLIENT_ID: &str = "YOUR_CLIENT_ID";
/// OAuth2 client secret placeholder.
const GOOGLE_CLIENT_SECRET: &str = "YOUR_CLIENT_SECRET";
/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Redirect URL for OAuth2 flow (localhost for desktop apps).
const REDIRECT_URL: &str = "http://localhost:8080/callback";

/// Drive scope limited to files this application created.
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: i64 = 3600;

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Configuration for OAuth2 authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Redirect URL registered for the OAuth2 client.
    pub redirect_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: GOOGLE_CLIENT_ID.to_string(),
            client_secret: GOOGLE_CLIENT_SECRET.to_string(),
            redirect_url: REDIRECT_URL.to_string(),
        }
    }
}

/// Google implementation of [`RemoteAuth`].
pub struct GoogleAuth {
    client: ConfiguredClient,
    oauth_http: oauth2::reqwest::Client,
    api_http: reqwest::Client,
    config: AuthConfig,
}

impl GoogleAuth {
    /// Create a new authenticator.
    ///
    /// # Errors
    /// - Malformed endpoint or redirect URL
    /// - HTTP client construction failure
    pub fn new(config: AuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(GOOGLE_AUTH_URL.to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        // Following redirects on the token endpoint would leak the code.
        let oauth_http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to build OAuth client: {}", e)))?;

        Ok(Self {
            client,
            oauth_http,
            api_http: http_client()?,
            config,
        })
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(AuthConfig::default())
    }

    /// Generate the authorization URL for the user to visit.
    ///
    /// Returns the URL and a CSRF token that should be verified on callback.
    pub fn authorization_url(&self) -> (String, String) {
        let (auth_url, csrf_token) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(DRIVE_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        (auth_url.to_string(), csrf_token.secret().clone())
    }

    /// Get the current configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

fn expiry(expires_in: Option<std::time::Duration>) -> chrono::DateTime<Utc> {
    let lifetime = expires_in
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME));
    Utc::now() + lifetime
}

fn map_token_error<RE>(action: &str, err: RequestTokenError<RE, BasicErrorResponse>) -> Error
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            Error::RemoteAuth(format!("{} rejected: {}", action, response))
        }
        RequestTokenError::Request(e) => {
            Error::RemoteUnavailable(format!("{} request failed: {}", action, e))
        }
        RequestTokenError::Parse(e, _) => {
            Error::Protocol(format!("{} returned an unexpected response: {}", action, e))
        }
        RequestTokenError::Other(message) => {
            Error::RemoteUnavailable(format!("{} failed: {}", action, message))
        }
    }
}

#[async_trait]
impl RemoteAuth for GoogleAuth {
    async fn exchange_code(&self, code: &str) -> Result<TokenBundle> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.trim().to_string()))
            .request_async(&self.oauth_http)
            .await
            .map_err(|e| map_token_error("Code exchange", e))?;

        let refresh_token = token
            .refresh_token()
            .ok_or_else(|| {
                Error::RemoteAuth(
                    "No refresh token received. Ensure 'offline' access and 'consent' prompt were requested."
                        .to_string(),
                )
            })?
            .secret()
            .clone();

        info!("Exchanged authorization code");
        Ok(TokenBundle {
            access_token: token.access_token().secret().clone(),
            refresh_token: Zeroizing::new(refresh_token),
            expires_at: expiry(token.expires_in()),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AccessGrant> {
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.oauth_http)
            .await
            .map_err(|e| map_token_error("Token refresh", e))?;

        // Google only sometimes rotates refresh tokens
        let rotated = token
            .refresh_token()
            .map(|t| t.secret().as_str())
            .filter(|t| *t != refresh_token)
            .map(|t| Zeroizing::new(t.to_string()));

        debug!("Refreshed access token (rotated: {})", rotated.is_some());
        Ok(AccessGrant {
            access_token: token.access_token().secret().clone(),
            expires_at: expiry(token.expires_in()),
            rotated_refresh_token: rotated,
        })
    }

    async fn identity(&self, access_token: &str) -> Result<Identity> {
        let about = fetch_about(&self.api_http, access_token).await?;
        Ok(Identity {
            id: about.user.permission_id,
            email: about.user.email_address,
            display_name: about.user.display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig {
            client_id: "test_id".to_string(),
            client_secret: "test_secret".to_string(),
            redirect_url: "http://localhost:8080/callback".to_string(),
        }
    }

    #[test]
    fn test_auth_config_serialization() {
        let config = AuthConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AuthConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_authorization_url_generation() {
        let auth = GoogleAuth::new(test_config()).unwrap();
        let (url, csrf_token) = auth.authorization_url();

        assert!(url.contains("accounts.google.com"));
        assert!(url.contains("client_id=test_id"));
        assert!(url.contains("scope="));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(!csrf_token.is_empty());
        assert_eq!(auth.config().client_id, "test_id");
    }

    #[test]
    fn test_invalid_redirect_rejected() {
        let mut config = test_config();
        config.redirect_url = "not a url".to_string();
        assert!(matches!(GoogleAuth::new(config), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_expiry_defaults_to_one_hour() {
        let at = expiry(None);
        let delta = at - Utc::now();
        assert!(delta > Duration::minutes(59) && delta <= Duration::minutes(60));

        let short = expiry(Some(std::time::Duration::from_secs(120)));
        assert!(short - Utc::now() <= Duration::minutes(2));
    }

    #[test]
    fn test_token_error_classification() {
        let other: RequestTokenError<std::io::Error, BasicErrorResponse> =
            RequestTokenError::Other("boom".to_string());
        assert!(map_token_error("Token refresh", other).is_retryable());

        let request: RequestTokenError<std::io::Error, BasicErrorResponse> =
            RequestTokenError::Request(std::io::Error::other("reset"));
        assert!(matches!(
            map_token_error("Token refresh", request),
            Error::RemoteUnavailable(_)
        ));
    }
}
