//! Persisted records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skyshard_common::{AccountId, FileRecord, QuotaSnapshot};
use skyshard_crypto::CipherBlob;

/// A connected storage account.
///
/// The long-lived credential is only ever stored sealed. Short-lived access
/// tokens are not part of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub display_name: String,
    /// Registry name of the store provider, e.g. `gdrive`.
    pub provider: String,
    /// Provider-specific settings handed to the store factory.
    #[serde(default)]
    pub settings: serde_json::Value,
    /// Last capacity read from the remote.
    pub quota: QuotaSnapshot,
    /// Sealed refresh token.
    pub credential: CipherBlob,
    /// Creation order breaks placement ties.
    pub created_at: DateTime<Utc>,
}

/// Filter for [`Catalog::query_file_records`](crate::Catalog::query_file_records).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileQuery {
    pub account_id: Option<AccountId>,
    pub name_prefix: Option<String>,
}

impl FileQuery {
    /// All records of one account.
    pub fn account(account_id: AccountId) -> Self {
        Self {
            account_id: Some(account_id),
            name_prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        self.account_id
            .as_ref()
            .map_or(true, |id| &record.account_id == id)
            && self
                .name_prefix
                .as_ref()
                .map_or(true, |p| record.name.starts_with(p.as_str()))
    }
}
