//! In-process identity provider for testing and dry runs.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

use skyshard_common::{Error, Result};

use crate::auth::{AccessGrant, Identity, RemoteAuth, TokenBundle};

struct Script {
    token_lifetime: Duration,
    rotate: bool,
    reject_refresh: bool,
    refresh_delay: std::time::Duration,
    refresh_calls: u32,
    last_refresh_token: Option<String>,
    identities: HashMap<String, Identity>,
}

/// [`RemoteAuth`] that answers from a script instead of a network.
///
/// The code `X` exchanges to access token `access-X` and refresh token
/// `refresh-X`, owned by account `acct-X`. Codes starting with `invalid`
/// are rejected. Clones share state.
#[derive(Clone)]
pub struct ScriptedAuth {
    script: Arc<Mutex<Script>>,
}

impl ScriptedAuth {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                token_lifetime: Duration::hours(1),
                rotate: false,
                reject_refresh: false,
                refresh_delay: std::time::Duration::ZERO,
                refresh_calls: 0,
                last_refresh_token: None,
                identities: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lifetime of tokens issued from now on. Negative values issue
    /// already-expired tokens.
    pub fn set_token_lifetime(&self, lifetime: Duration) {
        self.lock().token_lifetime = lifetime;
    }

    /// Hand out a new refresh token on every refresh.
    pub fn set_rotation(&self, rotate: bool) {
        self.lock().rotate = rotate;
    }

    /// Reject refreshes as if the grant had been revoked.
    pub fn set_reject_refresh(&self, reject: bool) {
        self.lock().reject_refresh = reject;
    }

    /// Delay every refresh, to widen race windows in tests.
    pub fn set_refresh_delay(&self, delay: std::time::Duration) {
        self.lock().refresh_delay = delay;
    }

    pub fn refresh_calls(&self) -> u32 {
        self.lock().refresh_calls
    }

    /// Refresh token presented by the latest refresh call.
    pub fn last_refresh_token(&self) -> Option<String> {
        self.lock().last_refresh_token.clone()
    }
}

impl Default for ScriptedAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteAuth for ScriptedAuth {
    async fn exchange_code(&self, code: &str) -> Result<TokenBundle> {
        if code.is_empty() || code.starts_with("invalid") {
            return Err(Error::RemoteAuth("invalid_grant".to_string()));
        }
        let mut script = self.lock();
        let access_token = format!("access-{}", code);
        script.identities.insert(
            access_token.clone(),
            Identity {
                id: format!("acct-{}", code),
                email: format!("{}@example.com", code),
                display_name: code.to_uppercase(),
            },
        );
        Ok(TokenBundle {
            access_token,
            refresh_token: Zeroizing::new(format!("refresh-{}", code)),
            expires_at: Utc::now() + script.token_lifetime,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AccessGrant> {
        let delay = self.lock().refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.lock();
        script.refresh_calls += 1;
        script.last_refresh_token = Some(refresh_token.to_string());
        if script.reject_refresh {
            return Err(Error::RemoteAuth("invalid_grant: token revoked".to_string()));
        }

        let n = script.refresh_calls;
        let rotated_refresh_token = script
            .rotate
            .then(|| Zeroizing::new(format!("{}~{}", refresh_token, n)));
        Ok(AccessGrant {
            access_token: format!("fresh-{}", n),
            expires_at: Utc::now() + script.token_lifetime,
            rotated_refresh_token,
        })
    }

    async fn identity(&self, access_token: &str) -> Result<Identity> {
        self.lock()
            .identities
            .get(access_token)
            .cloned()
            .ok_or_else(|| Error::RemoteAuth("unknown access token".to_string()))
    }
}
