//! Google Drive remote store.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use skyshard_common::{
    AccountId, Error, FileDescriptor, QuotaSnapshot, ResumeSession, Result,
};

use crate::provider::{ByteStream, ListQuery, RecordStream, RemoteStore, SessionStatus};
use crate::registry::StoreContext;

use super::client::{ChunkStatus, DriveClient, FOLDER_MIME_TYPE};

/// Registry name of the Drive provider.
pub const PROVIDER_NAME: &str = "gdrive";

/// Records requested per listing page.
const PAGE_SIZE: u32 = 1000;

/// Per-account Drive settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSettings {
    /// Folder that receives uploads and scopes listings. Drive root when unset.
    pub folder_id: Option<String>,
}

/// Google Drive implementation of [`RemoteStore`].
pub struct DriveStore {
    account_id: AccountId,
    settings: DriveSettings,
    client: Arc<DriveClient>,
}

impl DriveStore {
    /// Create a store bound to the account in `context`.
    ///
    /// # Errors
    /// - Settings do not deserialize
    pub fn new(context: StoreContext) -> Result<Self> {
        let settings = if context.settings.is_null() {
            DriveSettings::default()
        } else {
            serde_json::from_value(context.settings)
                .map_err(|e| Error::InvalidInput(format!("Invalid gdrive settings: {}", e)))?
        };
        Ok(Self {
            account_id: context.account_id,
            settings,
            client: Arc::new(DriveClient::new(context.tokens)?),
        })
    }

    fn search_query(&self, query: &ListQuery) -> String {
        let mut clauses = vec![
            "trashed = false".to_string(),
            format!("mimeType != '{}'", FOLDER_MIME_TYPE),
        ];
        if let Some(parent) = query.parent_id.as_ref().or(self.settings.folder_id.as_ref()) {
            clauses.push(format!("'{}' in parents", escape(parent)));
        }
        if let Some(prefix) = &query.name_prefix {
            // Drive's `contains` on names is a prefix match on words;
            // exact prefix filtering happens client-side.
            clauses.push(format!("name contains '{}'", escape(prefix)));
        }
        clauses.join(" and ")
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Factory registered under [`PROVIDER_NAME`].
pub fn create_drive_store(context: StoreContext) -> Result<Arc<dyn RemoteStore>> {
    Ok(Arc::new(DriveStore::new(context)?))
}

enum Cursor {
    Start,
    Next(String),
}

impl From<ChunkStatus> for SessionStatus {
    fn from(status: ChunkStatus) -> Self {
        match status {
            ChunkStatus::Complete(file) => SessionStatus::Complete { remote_id: file.id },
            ChunkStatus::Incomplete { acknowledged } => SessionStatus::InProgress { acknowledged },
        }
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    async fn get_quota(&self) -> Result<QuotaSnapshot> {
        let about = self.client.about().await?;
        let (total, used) = about.quota()?;
        Ok(QuotaSnapshot::new(total, used))
    }

    fn list_all(&self, query: Option<ListQuery>) -> RecordStream {
        let query = query.unwrap_or_default();
        let search = self.search_query(&query);
        let client = self.client.clone();
        let account_id = self.account_id.clone();

        let pages = stream::try_unfold(Some(Cursor::Start), move |cursor| {
            let client = client.clone();
            let search = search.clone();
            async move {
                let token = match cursor {
                    None => return Ok(None),
                    Some(Cursor::Start) => None,
                    Some(Cursor::Next(token)) => Some(token),
                };
                let page = client.list_page(&search, token.as_deref(), PAGE_SIZE).await?;
                debug!("Listed page of {} files", page.files.len());
                let next = page.next_page_token.map(Cursor::Next);
                Ok::<_, Error>(Some((page.files, next)))
            }
        });

        pages
            .map_ok(move |files| {
                let records: Vec<Result<_>> = files
                    .iter()
                    .filter(|f| !f.trashed)
                    .filter_map(|f| f.to_record(&account_id))
                    .filter(|r| query.matches(r))
                    .map(Ok)
                    .collect();
                stream::iter(records)
            })
            .try_flatten()
            .boxed()
    }

    async fn upload_simple(&self, file: &FileDescriptor, data: Bytes) -> Result<String> {
        let uploaded = self
            .client
            .upload_multipart(
                &file.name,
                &file.content_type,
                self.settings.folder_id.as_deref(),
                data,
            )
            .await?;
        Ok(uploaded.id)
    }

    async fn begin_upload(&self, file: &FileDescriptor) -> Result<ResumeSession> {
        let session_uri = self
            .client
            .start_resumable(
                &file.name,
                &file.content_type,
                self.settings.folder_id.as_deref(),
                file.size_bytes,
            )
            .await?;
        Ok(ResumeSession {
            session_uri,
            acknowledged: 0,
        })
    }

    async fn upload_chunk(
        &self,
        session: &ResumeSession,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<SessionStatus> {
        Ok(self
            .client
            .upload_chunk(&session.session_uri, offset, data, total)
            .await?
            .into())
    }

    async fn query_upload(&self, session: &ResumeSession, total: u64) -> Result<SessionStatus> {
        Ok(self
            .client
            .query_session(&session.session_uri, total)
            .await?
            .into())
    }

    async fn download(&self, remote_id: &str) -> Result<ByteStream> {
        self.client.download(remote_id).await
    }
}
