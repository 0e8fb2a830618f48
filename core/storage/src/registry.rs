//! Store registry for resolving an account's provider by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use skyshard_common::{AccountId, Error, Result};

use crate::provider::{AccessTokenSource, RemoteStore};

/// Everything a factory needs to bind a store to one account.
#[derive(Clone)]
pub struct StoreContext {
    pub account_id: AccountId,
    /// Live access tokens for `account_id`.
    pub tokens: Arc<dyn AccessTokenSource>,
    /// Provider-specific settings, e.g. a target folder.
    pub settings: Value,
}

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(StoreContext) -> Result<Arc<dyn RemoteStore>> + Send + Sync>;

/// Registry for remote store factories.
///
/// Accounts persist the name of their provider; the registry turns that
/// name back into a store instance.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build a store for `name` bound to the account in `context`.
    ///
    /// # Errors
    /// - Provider not found
    /// - Settings invalid for the provider
    pub fn resolve(&self, name: &str, context: StoreContext) -> Result<Arc<dyn RemoteStore>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Provider '{}' is not registered", name))
        })?;
        factory(context)
    }

    /// Get list of registered provider names.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in providers.
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();
    registry.factories.insert(
        crate::gdrive::PROVIDER_NAME.to_string(),
        Box::new(crate::gdrive::create_drive_store),
    );
    registry
}
