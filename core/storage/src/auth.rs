//! Identity-provider capability used to connect accounts and refresh tokens.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use zeroize::Zeroizing;

use skyshard_common::Result;

/// Tokens returned by an authorization-code exchange.
pub struct TokenBundle {
    /// Short-lived access token.
    pub access_token: String,
    /// Long-lived refresh token. Only ever persisted sealed.
    pub refresh_token: Zeroizing<String>,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of refreshing an access token.
pub struct AccessGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Set when the provider rotated the refresh token.
    pub rotated_refresh_token: Option<Zeroizing<String>>,
}

impl AccessGrant {
    /// Check if the access token is expired or expires within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at < Utc::now() + margin
    }
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("rotated", &self.rotated_refresh_token.is_some())
            .finish()
    }
}

/// Account identity as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable provider account id.
    pub id: String,
    pub email: String,
    pub display_name: String,
}

/// OAuth-style authorization capability.
#[async_trait]
pub trait RemoteAuth: Send + Sync {
    /// Exchange an authorization code for an access/refresh token pair.
    ///
    /// # Errors
    /// - `RemoteAuth` when the code is rejected
    /// - `RemoteUnavailable` on network failure
    async fn exchange_code(&self, code: &str) -> Result<TokenBundle>;

    /// Obtain a new access token from a refresh token.
    ///
    /// # Errors
    /// - `RemoteAuth` when the refresh token is invalid or revoked
    /// - `RemoteUnavailable` on network failure
    async fn refresh(&self, refresh_token: &str) -> Result<AccessGrant>;

    /// Look up who an access token belongs to.
    async fn identity(&self, access_token: &str) -> Result<Identity>;
}
