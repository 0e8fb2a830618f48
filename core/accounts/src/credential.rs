//! Short-lived access credentials.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use zeroize::Zeroizing;

use skyshard_common::{AccountId, Result};
use skyshard_storage::AccessTokenSource;

use crate::registry::AccountRegistry;

/// Access token with its expiry. Never persisted.
#[derive(Clone)]
pub struct AccessCredential {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessCredential {
    /// Usable for at least `skew` more.
    pub fn is_fresh(&self, skew: Duration) -> bool {
        self.expires_at > Utc::now() + skew
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredential")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Opened refresh token. Held only for the duration of one refresh.
pub struct CredentialBundle {
    refresh_token: Zeroizing<String>,
}

impl CredentialBundle {
    pub(crate) fn new(refresh_token: Zeroizing<String>) -> Self {
        Self { refresh_token }
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialBundle([REDACTED])")
    }
}

/// Token source handed to stores; resolves through the registry on every call.
#[derive(Clone)]
pub struct AccountTokens {
    registry: AccountRegistry,
    account_id: AccountId,
}

impl AccountTokens {
    pub(crate) fn new(registry: AccountRegistry, account_id: AccountId) -> Self {
        Self {
            registry,
            account_id,
        }
    }
}

#[async_trait]
impl AccessTokenSource for AccountTokens {
    async fn access_token(&self) -> Result<String> {
        let credential = self.registry.get_access_credential(&self.account_id).await?;
        Ok(credential.access_token)
    }

    async fn reject(&self, token: &str) {
        self.registry.invalidate(&self.account_id, token).await;
    }
}
