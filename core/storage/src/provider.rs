//! Remote store trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use skyshard_common::{AccountId, FileDescriptor, FileRecord, QuotaSnapshot, ResumeSession, Result};

/// Byte stream type for upload sources and downloads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Lazy stream of index records produced by [`RemoteStore::list_all`].
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<FileRecord>> + Send>>;

/// Supplies a live access token for the account a store is bound to.
///
/// Implementations refresh expired tokens on demand; stores call this
/// before every request instead of holding a token themselves.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;

    /// The remote refused `token`; stop handing it out.
    async fn reject(&self, _token: &str) {}
}

/// Filter for listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Only files whose name starts with this prefix.
    pub name_prefix: Option<String>,
    /// Only files directly inside this folder.
    pub parent_id: Option<String>,
}

impl ListQuery {
    /// Whether a record passes this filter.
    pub fn matches(&self, record: &FileRecord) -> bool {
        if let Some(prefix) = &self.name_prefix {
            if !record.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(parent) = &self.parent_id {
            if record.parent_id.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        true
    }
}

/// State of a resumable session as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// More bytes are expected; `acknowledged` bytes are durably stored.
    InProgress { acknowledged: u64 },
    /// The upload finished and produced a remote file.
    Complete { remote_id: String },
}

/// Remote object store bound to a single account.
///
/// All operations fail with `RemoteUnavailable` (retryable) or
/// `RemoteRejected` (permanent); providers may additionally return
/// `RemoteAuth` and `Protocol`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Provider name (e.g., "gdrive", "memory").
    fn name(&self) -> &str;

    /// Account this store operates on.
    fn account_id(&self) -> &AccountId;

    /// Read live capacity.
    async fn get_quota(&self) -> Result<QuotaSnapshot>;

    /// List every file matching `query`.
    ///
    /// Pages are fetched lazily as the stream is polled. The stream is finite;
    /// retrying a failed listing means calling `list_all` again, which starts
    /// over from the first page.
    fn list_all(&self, query: Option<ListQuery>) -> RecordStream;

    /// Upload a small file in a single request.
    async fn upload_simple(&self, file: &FileDescriptor, data: Bytes) -> Result<String>;

    /// Open a resumable upload session.
    async fn begin_upload(&self, file: &FileDescriptor) -> Result<ResumeSession>;

    /// Send `data` starting at byte `offset` of a `total`-byte upload.
    ///
    /// The remote may acknowledge fewer bytes than were sent.
    async fn upload_chunk(
        &self,
        session: &ResumeSession,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<SessionStatus>;

    /// Ask the remote how far a session got.
    ///
    /// # Errors
    /// - `RemoteRejected` when the session expired or is unknown
    async fn query_upload(&self, session: &ResumeSession, total: u64) -> Result<SessionStatus>;

    /// Stream a file's content.
    async fn download(&self, remote_id: &str) -> Result<ByteStream>;
}
