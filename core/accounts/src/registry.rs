//! Account lifecycle and access-token cache.

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use skyshard_catalog::{Account, Catalog};
use skyshard_common::{AccountId, Error, FileRecord, QuotaSnapshot, Result};
use skyshard_crypto::{account_context, CipherBlob, CredentialVault};
use skyshard_storage::{RemoteAuth, RemoteStore, RetryExecutor, StoreContext, StoreRegistry};

use crate::credential::{AccessCredential, AccountTokens, CredentialBundle};

/// Access tokens are refreshed this long before they expire.
pub const REFRESH_SKEW_SECS: i64 = 300;

/// Free space of one account, as the planner sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCapacity {
    pub account_id: AccountId,
    pub free_bytes: u64,
    pub created_at: DateTime<Utc>,
}

type Slot = Arc<Mutex<Option<AccessCredential>>>;

struct Inner {
    catalog: Arc<dyn Catalog>,
    auth: Arc<dyn RemoteAuth>,
    stores: Arc<StoreRegistry>,
    vault: CredentialVault,
    /// Session passphrase, zeroized on lock and drop.
    passphrase: RwLock<Option<Zeroizing<String>>>,
    /// One slot per account; holding the slot lock serializes refreshes.
    cache: StdMutex<HashMap<AccountId, Slot>>,
}

/// Connected accounts and their credentials.
///
/// Cheap to clone; clones share the session passphrase and token cache.
#[derive(Clone)]
pub struct AccountRegistry {
    inner: Arc<Inner>,
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Crypto(format!("Key derivation task failed: {}", err))
}

fn skew() -> Duration {
    Duration::seconds(REFRESH_SKEW_SECS)
}

impl AccountRegistry {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        auth: Arc<dyn RemoteAuth>,
        stores: Arc<StoreRegistry>,
        vault: CredentialVault,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                auth,
                stores,
                vault,
                passphrase: RwLock::new(None),
                cache: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Catalog the registry persists to.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.inner.catalog
    }

    fn slot(&self, id: &AccountId) -> Slot {
        let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entry(id.clone()).or_default().clone()
    }

    fn session_passphrase(&self) -> Option<Zeroizing<String>> {
        self.inner
            .passphrase
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_passphrase(&self, passphrase: Option<Zeroizing<String>>) {
        *self
            .inner
            .passphrase
            .write()
            .unwrap_or_else(|e| e.into_inner()) = passphrase;
    }

    fn account(&self, id: &AccountId) -> Result<Account> {
        self.inner
            .catalog
            .get_account(id)?
            .ok_or_else(|| Error::NotFound(format!("Account {}", id)))
    }

    /// Open a sealed refresh token. Argon2 runs off the async workers.
    async fn open_sealed(
        &self,
        account: &Account,
        passphrase: Zeroizing<String>,
    ) -> Result<CredentialBundle> {
        let vault = self.inner.vault.clone();
        let blob = account.credential.clone();
        let context = account_context(account.id.as_str());
        let secret = tokio::task::spawn_blocking(move || {
            vault.open(&blob, passphrase.as_bytes(), &context)
        })
        .await
        .map_err(join_error)??;
        let text = std::str::from_utf8(secret.as_bytes()).map_err(|_| Error::Decryption)?;
        Ok(CredentialBundle::new(Zeroizing::new(text.to_string())))
    }

    async fn seal(
        &self,
        id: &AccountId,
        secret: Zeroizing<String>,
        passphrase: Zeroizing<String>,
    ) -> Result<CipherBlob> {
        let vault = self.inner.vault.clone();
        let context = account_context(id.as_str());
        tokio::task::spawn_blocking(move || {
            vault.seal(secret.as_bytes(), passphrase.as_bytes(), &context)
        })
        .await
        .map_err(join_error)?
    }

    /// Fail with `Decryption` unless `passphrase` opens an existing credential.
    ///
    /// With no accounts connected any passphrase is accepted.
    async fn verify_passphrase(&self, passphrase: &Zeroizing<String>) -> Result<()> {
        match self.inner.catalog.list_accounts()?.first() {
            Some(account) => self.open_sealed(account, passphrase.clone()).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// All accounts, oldest first.
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.inner.catalog.list_accounts()
    }

    /// Connect the account behind an authorization `code`.
    ///
    /// The refresh token is sealed under `passphrase`, which becomes the
    /// session passphrase. Reconnecting an account keeps its creation order.
    ///
    /// # Errors
    /// - `Decryption` if `passphrase` differs from the one already in use
    /// - `RemoteAuth` if the code is rejected
    /// - `NotFound` if `provider` is not registered
    pub async fn connect_account(
        &self,
        code: &str,
        passphrase: &str,
        provider: &str,
        settings: Value,
    ) -> Result<Account> {
        if passphrase.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }
        if !self.inner.stores.has_provider(provider) {
            return Err(Error::NotFound(format!(
                "Provider '{}' is not registered",
                provider
            )));
        }
        let passphrase = Zeroizing::new(passphrase.to_string());
        self.verify_passphrase(&passphrase).await?;

        let tokens = self.inner.auth.exchange_code(code).await?;
        let identity = self.inner.auth.identity(&tokens.access_token).await?;
        let id = AccountId::new(identity.id)?;
        let credential = self
            .seal(&id, tokens.refresh_token.clone(), passphrase.clone())
            .await?;

        *self.slot(&id).lock().await = Some(AccessCredential {
            access_token: tokens.access_token.clone(),
            expires_at: tokens.expires_at,
        });

        let existing = self.inner.catalog.get_account(&id)?;
        let mut account = Account {
            id: id.clone(),
            email: identity.email,
            display_name: identity.display_name,
            provider: provider.to_string(),
            settings,
            quota: existing
                .as_ref()
                .map_or_else(|| QuotaSnapshot::new(0, 0), |a| a.quota),
            credential,
            created_at: existing.map_or_else(Utc::now, |a| a.created_at),
        };
        self.inner.catalog.save_account(&account)?;
        self.set_passphrase(Some(passphrase));

        match self.refresh_quota(&id).await {
            Ok(quota) => account.quota = quota,
            Err(e) => warn!("Could not read quota of {}: {}", id, e),
        }

        info!("Connected account {} ({})", id, account.email);
        Ok(account)
    }

    /// A live access token for `id`, refreshing it when expired.
    ///
    /// Concurrent callers for one account share a single refresh.
    ///
    /// # Errors
    /// - `NeedsPassphrase` when a refresh is due and the registry is locked
    /// - `Decryption` when the session passphrase does not open the credential
    /// - `RemoteAuth` when the provider rejects the refresh token
    pub async fn get_access_credential(&self, id: &AccountId) -> Result<AccessCredential> {
        let slot = self.slot(id);
        let mut cached = slot.lock().await;
        if let Some(credential) = cached.as_ref().filter(|c| c.is_fresh(skew())) {
            return Ok(credential.clone());
        }

        let account = self.account(id)?;
        let passphrase = self
            .session_passphrase()
            .ok_or_else(|| Error::NeedsPassphrase(id.to_string()))?;
        let bundle = self.open_sealed(&account, passphrase.clone()).await?;

        debug!("Refreshing access token for {}", id);
        let grant = self.inner.auth.refresh(bundle.refresh_token()).await?;
        drop(bundle);

        if let Some(rotated) = grant.rotated_refresh_token {
            let sealed = self.seal(id, rotated, passphrase).await?;
            // Re-read so a concurrent quota update is not lost.
            if let Some(mut latest) = self.inner.catalog.get_account(id)? {
                latest.credential = sealed;
                self.inner.catalog.save_account(&latest)?;
                debug!("Stored rotated refresh token for {}", id);
            }
        }

        let credential = AccessCredential {
            access_token: grant.access_token,
            expires_at: grant.expires_at,
        };
        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Drop the cached token of `id` if it is still `token`, so the next
    /// request refreshes it.
    pub async fn invalidate(&self, id: &AccountId, token: &str) {
        let slot = self.slot(id);
        let mut cached = slot.lock().await;
        if cached.as_ref().is_some_and(|c| c.access_token == token) {
            *cached = None;
            debug!("Discarded refused access token of {}", id);
        }
    }

    /// Read live capacity and persist it.
    pub async fn refresh_quota(&self, id: &AccountId) -> Result<QuotaSnapshot> {
        let store = self.store_for(id)?;
        let quota = store.get_quota().await?;

        let mut account = self.account(id)?;
        account.quota = quota;
        self.inner.catalog.save_account(&account)?;
        debug!(
            "Quota of {}: {} of {} bytes used",
            id, quota.bytes_used, quota.bytes_total
        );
        Ok(quota)
    }

    /// Forget an account, its cached token and its file index.
    ///
    /// Returns whether the account existed.
    pub fn remove_account(&self, id: &AccountId) -> Result<bool> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        let existed = self.inner.catalog.delete_account(id)?;
        if existed {
            info!("Removed account {}", id);
        }
        Ok(existed)
    }

    /// Set the session passphrase after checking it against a stored credential.
    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        if passphrase.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }
        let passphrase = Zeroizing::new(passphrase.to_string());
        self.verify_passphrase(&passphrase).await?;
        self.set_passphrase(Some(passphrase));
        Ok(())
    }

    /// Drop the session passphrase. Cached access tokens stay usable until
    /// they expire.
    pub fn lock(&self) {
        self.set_passphrase(None);
    }

    pub fn is_unlocked(&self) -> bool {
        self.session_passphrase().is_some()
    }

    /// Reseal every credential under `new`.
    ///
    /// Nothing is written unless `old` opens all of them. Returns the number
    /// of accounts resealed.
    pub async fn change_passphrase(&self, old: &str, new: &str) -> Result<usize> {
        if new.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }
        let old = Zeroizing::new(old.to_string());
        let new = Zeroizing::new(new.to_string());

        let mut resealed = Vec::new();
        for mut account in self.inner.catalog.list_accounts()? {
            let vault = self.inner.vault.clone();
            let blob = account.credential.clone();
            let context = account_context(account.id.as_str());
            let (old, new) = (old.clone(), new.clone());
            account.credential = tokio::task::spawn_blocking(move || {
                vault.reseal(&blob, old.as_bytes(), new.as_bytes(), &context)
            })
            .await
            .map_err(join_error)??;
            resealed.push(account);
        }

        for account in &resealed {
            self.inner.catalog.save_account(account)?;
        }
        self.set_passphrase(Some(new));
        info!("Resealed {} credential(s) under a new passphrase", resealed.len());
        Ok(resealed.len())
    }

    /// Last known free space of every account, oldest first.
    pub fn capacities(&self) -> Result<Vec<AccountCapacity>> {
        Ok(self
            .inner
            .catalog
            .list_accounts()?
            .into_iter()
            .map(|a| AccountCapacity {
                free_bytes: a.quota.free_bytes(),
                account_id: a.id,
                created_at: a.created_at,
            })
            .collect())
    }

    /// Build a store for `id` that draws tokens from this registry.
    pub fn store_for(&self, id: &AccountId) -> Result<Arc<dyn RemoteStore>> {
        let account = self.account(id)?;
        self.inner.stores.resolve(
            &account.provider,
            StoreContext {
                account_id: account.id.clone(),
                tokens: Arc::new(AccountTokens::new(self.clone(), account.id.clone())),
                settings: account.settings,
            },
        )
    }

    /// Rebuild the file index of `id` from a full remote listing.
    ///
    /// A failed listing restarts from the first page. Returns the number of
    /// records indexed.
    pub async fn refresh_index(&self, id: &AccountId) -> Result<usize> {
        let store = self.store_for(id)?;
        let records: Vec<FileRecord> = RetryExecutor::default()
            .execute(|| store.list_all(None).try_collect())
            .await?;
        self.inner.catalog.replace_file_records(id, &records)?;
        info!("Indexed {} file(s) on {}", records.len(), id);
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshard_catalog::{FileQuery, MemoryCatalog};
    use skyshard_crypto::KdfParams;
    use skyshard_storage::{AccessTokenSource, MemoryStore, ScriptedAuth};

    const GIB: u64 = 1 << 30;

    struct Fixture {
        registry: AccountRegistry,
        auth: ScriptedAuth,
        stores: Arc<StdMutex<HashMap<String, MemoryStore>>>,
    }

    /// Registry whose "memory" provider hands out one shared store per account.
    fn fixture() -> Fixture {
        let auth = ScriptedAuth::new();
        let stores: Arc<StdMutex<HashMap<String, MemoryStore>>> = Arc::default();
        let shared = stores.clone();
        let mut registry = StoreRegistry::new();
        registry
            .register(
                "memory",
                Box::new(move |ctx: StoreContext| {
                    let mut stores = shared.lock().unwrap();
                    let store = stores
                        .entry(ctx.account_id.to_string())
                        .or_insert_with(|| MemoryStore::new(ctx.account_id.clone(), 15 * GIB))
                        .clone();
                    Ok(Arc::new(store) as Arc<dyn RemoteStore>)
                }),
            )
            .unwrap();

        let vault = CredentialVault::new(KdfParams {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        });
        Fixture {
            registry: AccountRegistry::new(
                Arc::new(MemoryCatalog::new()),
                Arc::new(auth.clone()),
                Arc::new(registry),
                vault,
            ),
            auth,
            stores,
        }
    }

    impl Fixture {
        async fn connect(&self, code: &str) -> Account {
            self.registry
                .connect_account(code, "hunter2", "memory", Value::Null)
                .await
                .unwrap()
        }

        fn store(&self, id: &AccountId) -> MemoryStore {
            self.stores.lock().unwrap()[id.as_str()].clone()
        }
    }

    #[tokio::test]
    async fn test_connect_persists_sealed_credential() {
        let f = fixture();
        let account = f.connect("alice").await;

        assert_eq!(account.id.as_str(), "acct-alice");
        assert_eq!(account.email, "alice@example.com");
        assert_eq!(account.quota.bytes_total, 15 * GIB);

        let stored = f.registry.catalog().get_account(&account.id).unwrap().unwrap();
        let json = serde_json::to_string(&stored).unwrap();
        assert!(!json.contains("refresh-alice"));

        // Primed cache: no refresh needed
        let credential = f.registry.get_access_credential(&account.id).await.unwrap();
        assert_eq!(credential.access_token, "access-alice");
        assert_eq!(f.auth.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_creation_order() {
        let f = fixture();
        let first = f.connect("alice").await;
        f.connect("bob").await;
        let again = f.connect("alice").await;

        assert_eq!(again.created_at, first.created_at);
        let ids: Vec<String> = f
            .registry
            .list_accounts()
            .unwrap()
            .into_iter()
            .map(|a| a.id.to_string())
            .collect();
        assert_eq!(ids, vec!["acct-alice", "acct-bob"]);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_code_and_other_passphrase() {
        let f = fixture();
        assert!(matches!(
            f.registry
                .connect_account("invalid-code", "pw", "memory", Value::Null)
                .await,
            Err(Error::RemoteAuth(_))
        ));

        f.connect("alice").await;
        assert!(matches!(
            f.registry
                .connect_account("bob", "different", "memory", Value::Null)
                .await,
            Err(Error::Decryption)
        ));
        assert!(matches!(
            f.registry
                .connect_account("bob", "hunter2", "nowhere", Value::Null)
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let f = fixture();
        f.auth.set_token_lifetime(Duration::minutes(-10));
        let account = f.connect("alice").await;
        f.auth.set_token_lifetime(Duration::hours(1));

        let credential = f.registry.get_access_credential(&account.id).await.unwrap();
        assert_eq!(credential.access_token, "fresh-1");
        assert!(credential.expires_at > Utc::now());
        assert_eq!(f.auth.last_refresh_token().as_deref(), Some("refresh-alice"));
    }

    #[tokio::test]
    async fn test_refused_token_is_refreshed_next_time() {
        let f = fixture();
        let account = f.connect("alice").await;
        let tokens = AccountTokens::new(f.registry.clone(), account.id.clone());

        // A token from an earlier refresh leaves the cache alone
        tokens.reject("stale").await;
        assert_eq!(tokens.access_token().await.unwrap(), "access-alice");
        assert_eq!(f.auth.refresh_calls(), 0);

        tokens.reject("access-alice").await;
        let renewed = tokens.access_token().await.unwrap();
        assert_ne!(renewed, "access-alice");
        assert_eq!(f.auth.refresh_calls(), 1);
        assert_eq!(tokens.access_token().await.unwrap(), renewed);
        assert_eq!(f.auth.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_token_near_expiry_is_refreshed() {
        let f = fixture();
        f.auth.set_token_lifetime(Duration::minutes(2));
        let account = f.connect("alice").await;

        f.registry.get_access_credential(&account.id).await.unwrap();
        assert_eq!(f.auth.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let f = fixture();
        f.auth.set_token_lifetime(Duration::minutes(-10));
        let account = f.connect("alice").await;
        f.auth.set_token_lifetime(Duration::hours(1));
        f.auth.set_refresh_delay(std::time::Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = f.registry.clone();
            let id = account.id.clone();
            handles.push(tokio::spawn(async move {
                registry.get_access_credential(&id).await
            }));
        }
        for handle in handles {
            let credential = handle.await.unwrap().unwrap();
            assert_eq!(credential.access_token, "fresh-1");
        }
        assert_eq!(f.auth.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_locked_registry_needs_passphrase() {
        let f = fixture();
        f.auth.set_token_lifetime(Duration::minutes(-10));
        let account = f.connect("alice").await;

        f.registry.lock();
        assert!(!f.registry.is_unlocked());
        assert!(matches!(
            f.registry.get_access_credential(&account.id).await,
            Err(Error::NeedsPassphrase(_))
        ));

        assert!(matches!(
            f.registry.unlock("wrong").await,
            Err(Error::Decryption)
        ));
        f.registry.unlock("hunter2").await.unwrap();
        f.auth.set_token_lifetime(Duration::hours(1));
        assert!(f.registry.get_access_credential(&account.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_is_remote_auth() {
        let f = fixture();
        f.auth.set_token_lifetime(Duration::minutes(-10));
        let account = f.connect("alice").await;
        f.auth.set_reject_refresh(true);

        assert!(matches!(
            f.registry.get_access_credential(&account.id).await,
            Err(Error::RemoteAuth(_))
        ));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_resealed() {
        let f = fixture();
        f.auth.set_token_lifetime(Duration::minutes(-10));
        let account = f.connect("alice").await;
        f.auth.set_rotation(true);

        f.registry.get_access_credential(&account.id).await.unwrap();
        let stored = f.registry.catalog().get_account(&account.id).unwrap().unwrap();
        assert_ne!(stored.credential, account.credential);

        // The next refresh presents the rotated token
        f.registry.get_access_credential(&account.id).await.unwrap();
        assert_eq!(f.auth.last_refresh_token().as_deref(), Some("refresh-alice~1"));
    }

    #[tokio::test]
    async fn test_change_passphrase_reseals_all() {
        let f = fixture();
        let alice = f.connect("alice").await;
        f.connect("bob").await;

        assert!(matches!(
            f.registry.change_passphrase("wrong", "new-pass").await,
            Err(Error::Decryption)
        ));
        let unchanged = f.registry.catalog().get_account(&alice.id).unwrap().unwrap();
        assert_eq!(unchanged.credential, alice.credential);

        assert_eq!(f.registry.change_passphrase("hunter2", "new-pass").await.unwrap(), 2);
        f.registry.lock();
        assert!(f.registry.unlock("hunter2").await.is_err());
        f.registry.unlock("new-pass").await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_quota_and_capacities() {
        let f = fixture();
        let alice = f.connect("alice").await;
        let bob = f.connect("bob").await;

        f.store(&bob.id).set_external_used(10 * GIB);
        let quota = f.registry.refresh_quota(&bob.id).await.unwrap();
        assert_eq!(quota.free_bytes(), 5 * GIB);

        let capacities = f.registry.capacities().unwrap();
        assert_eq!(capacities.len(), 2);
        assert_eq!(capacities[0].account_id, alice.id);
        assert_eq!(capacities[0].free_bytes, 15 * GIB);
        assert_eq!(capacities[1].free_bytes, 5 * GIB);
    }

    #[tokio::test]
    async fn test_refresh_index_replaces_records() {
        let f = fixture();
        let alice = f.connect("alice").await;
        let store = f.store(&alice.id);
        store.put_file("a.bin", vec![1u8; 10]);
        store.put_file("b.bin", vec![2u8; 20]);

        assert_eq!(f.registry.refresh_index(&alice.id).await.unwrap(), 2);
        let records = f
            .registry
            .catalog()
            .query_file_records(&FileQuery::account(alice.id.clone()))
            .unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);
    }

    #[tokio::test]
    async fn test_remove_account_is_idempotent() {
        let f = fixture();
        let alice = f.connect("alice").await;

        assert!(f.registry.remove_account(&alice.id).unwrap());
        assert!(!f.registry.remove_account(&alice.id).unwrap());
        assert!(matches!(
            f.registry.get_access_credential(&alice.id).await,
            Err(Error::NotFound(_))
        ));
    }
}
