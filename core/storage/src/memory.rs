//! In-memory remote store for testing and dry runs.
//!
//! Behaves like a resumable-upload remote: it enforces quota, tracks the
//! acknowledged offset of every session and refuses gaps. Failures can be
//! injected per operation so callers can exercise their retry paths.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use skyshard_common::{
    AccountId, Error, FileDescriptor, FileRecord, QuotaSnapshot, ResumeSession, Result,
};

use crate::provider::{ByteStream, ListQuery, RecordStream, RemoteStore, SessionStatus};

/// Size of the pieces a download is streamed in.
const DOWNLOAD_PIECE: usize = 64 * 1024;

/// Counters for assertions in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub quota_calls: u32,
    pub chunk_calls: u32,
    pub list_pages: u32,
    pub downloads: u32,
    /// Session bytes stored, not counting overlap.
    pub bytes_received: u64,
    /// Bytes sent for offsets the remote already held.
    pub overlap_bytes: u64,
}

struct StoredFile {
    record: FileRecord,
    data: Bytes,
}

struct Session {
    file: FileDescriptor,
    data: Vec<u8>,
}

#[derive(Default)]
struct Faults {
    chunk_failures: u32,
    lost_acks: u32,
    quota_failures: u32,
    list_failures: u32,
    failing_downloads: HashSet<String>,
    truncated_downloads: HashSet<String>,
    chunk_delay: Duration,
    reject_uploads: bool,
}

struct State {
    bytes_total: u64,
    external_used: u64,
    files: Vec<StoredFile>,
    sessions: HashMap<String, Session>,
    finished: HashMap<String, String>,
    faults: Faults,
    stats: MemoryStats,
}

impl State {
    fn used(&self) -> u64 {
        self.external_used + self.files.iter().map(|f| f.data.len() as u64).sum::<u64>()
    }

    fn check_room(&self, size: u64) -> Result<()> {
        if self.faults.reject_uploads {
            return Err(Error::RemoteRejected("insufficientFilePermissions".to_string()));
        }
        if self.used() + size > self.bytes_total {
            return Err(Error::RemoteRejected(format!(
                "storageQuotaExceeded: {} bytes do not fit",
                size
            )));
        }
        Ok(())
    }

    fn store(&mut self, account_id: &AccountId, file: &FileDescriptor, data: Bytes) -> FileRecord {
        let record = FileRecord {
            remote_id: Uuid::new_v4().to_string(),
            account_id: account_id.clone(),
            name: file.name.clone(),
            size: data.len() as u64,
            content_type: file.content_type.clone(),
            parent_id: None,
            modified: Utc::now(),
        };
        self.files.push(StoredFile {
            record: record.clone(),
            data,
        });
        record
    }
}

/// In-memory store bound to one account.
///
/// Clones share state, so a test can keep a handle for inspection while
/// handing another to the code under test.
#[derive(Clone)]
pub struct MemoryStore {
    account_id: AccountId,
    page_size: usize,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store with `bytes_total` capacity.
    pub fn new(account_id: AccountId, bytes_total: u64) -> Self {
        Self {
            account_id,
            page_size: 100,
            state: Arc::new(Mutex::new(State {
                bytes_total,
                external_used: 0,
                files: Vec::new(),
                sessions: HashMap::new(),
                finished: HashMap::new(),
                faults: Faults::default(),
                stats: MemoryStats::default(),
            })),
        }
    }

    /// Set the number of records per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a file directly, bypassing quota. Returns its record.
    pub fn put_file(&self, name: &str, data: impl Into<Bytes>) -> FileRecord {
        let data = data.into();
        let file = FileDescriptor::new(name, data.len() as u64, "application/octet-stream");
        self.lock().store(&self.account_id, &file, data)
    }

    /// Content of a stored file.
    pub fn file_bytes(&self, remote_id: &str) -> Option<Bytes> {
        self.lock()
            .files
            .iter()
            .find(|f| f.record.remote_id == remote_id)
            .map(|f| f.data.clone())
    }

    /// Records of all stored files, in upload order.
    pub fn files(&self) -> Vec<FileRecord> {
        self.lock().files.iter().map(|f| f.record.clone()).collect()
    }

    /// Usage from outside this tool, counted against the quota.
    pub fn set_external_used(&self, bytes: u64) {
        self.lock().external_used = bytes;
    }

    /// Fail the next `n` chunk calls before storing anything.
    pub fn inject_chunk_failures(&self, n: u32) {
        self.lock().faults.chunk_failures = n;
    }

    /// Store the next `n` chunks but report a transient failure.
    pub fn inject_lost_acks(&self, n: u32) {
        self.lock().faults.lost_acks = n;
    }

    /// Fail the next `n` quota reads.
    pub fn inject_quota_failures(&self, n: u32) {
        self.lock().faults.quota_failures = n;
    }

    /// Fail the next `n` listing pages.
    pub fn inject_list_failures(&self, n: u32) {
        self.lock().faults.list_failures = n;
    }

    /// Make every download of `remote_id` fail before the first byte.
    pub fn fail_download(&self, remote_id: &str) {
        self.lock().faults.failing_downloads.insert(remote_id.to_string());
    }

    /// Make downloads of `remote_id` fail after the first piece.
    pub fn truncate_download(&self, remote_id: &str) {
        self.lock().faults.truncated_downloads.insert(remote_id.to_string());
    }

    /// Refuse every new upload as a permission problem would.
    pub fn reject_uploads(&self) {
        self.lock().faults.reject_uploads = true;
    }

    /// Delay every chunk call.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.lock().faults.chunk_delay = delay;
    }

    /// Forget all open sessions, as a remote does after its session lifetime.
    pub fn expire_sessions(&self) {
        self.lock().sessions.clear();
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    async fn get_quota(&self) -> Result<QuotaSnapshot> {
        let mut state = self.lock();
        state.stats.quota_calls += 1;
        if state.faults.quota_failures > 0 {
            state.faults.quota_failures -= 1;
            return Err(Error::RemoteUnavailable("quota read failed".to_string()));
        }
        Ok(QuotaSnapshot::new(state.bytes_total, state.used()))
    }

    fn list_all(&self, query: Option<ListQuery>) -> RecordStream {
        let state = self.state.clone();
        let page_size = self.page_size;

        let pages = stream::try_unfold(Some(0usize), move |cursor| {
            let state = state.clone();
            let query = query.clone();
            async move {
                let Some(start) = cursor else {
                    return Ok(None);
                };
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if state.faults.list_failures > 0 {
                    state.faults.list_failures -= 1;
                    return Err(Error::RemoteUnavailable("listing failed".to_string()));
                }
                state.stats.list_pages += 1;

                let mut page: Vec<FileRecord> = state
                    .files
                    .iter()
                    .map(|f| &f.record)
                    .filter(|r| query.as_ref().map_or(true, |q| q.matches(r)))
                    .skip(start)
                    .take(page_size + 1)
                    .cloned()
                    .collect();
                let next = if page.len() > page_size {
                    page.truncate(page_size);
                    Some(start + page_size)
                } else {
                    None
                };
                Ok(Some((page, next)))
            }
        });

        Box::pin(
            pages
                .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
                .try_flatten(),
        )
    }

    async fn upload_simple(&self, file: &FileDescriptor, data: Bytes) -> Result<String> {
        if data.len() as u64 != file.size_bytes {
            return Err(Error::RemoteRejected(format!(
                "Declared {} bytes, received {}",
                file.size_bytes,
                data.len()
            )));
        }
        let mut state = self.lock();
        state.check_room(file.size_bytes)?;
        Ok(state.store(&self.account_id, file, data).remote_id)
    }

    async fn begin_upload(&self, file: &FileDescriptor) -> Result<ResumeSession> {
        let mut state = self.lock();
        state.check_room(file.size_bytes)?;

        let session_uri = format!("memory://upload/{}", Uuid::new_v4());
        state.sessions.insert(
            session_uri.clone(),
            Session {
                file: file.clone(),
                data: Vec::new(),
            },
        );
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
        let delay = {
            let mut state = self.lock();
            state.stats.chunk_calls += 1;
            state.faults.chunk_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.faults.chunk_failures > 0 {
            state.faults.chunk_failures -= 1;
            return Err(Error::RemoteUnavailable("connection reset".to_string()));
        }

        let state = &mut *state;
        let entry = state
            .sessions
            .get_mut(&session.session_uri)
            .ok_or_else(|| Error::RemoteRejected("Upload session not found".to_string()))?;
        if total != entry.file.size_bytes {
            return Err(Error::RemoteRejected(format!(
                "Session expects {} bytes, chunk declares {}",
                entry.file.size_bytes, total
            )));
        }

        let held = entry.data.len() as u64;
        if offset > held {
            return Err(Error::RemoteRejected(format!(
                "Chunk starts at {} but only {} bytes are held",
                offset, held
            )));
        }
        let overlap = (held - offset).min(data.len() as u64);
        let fresh = &data[overlap as usize..];
        if held + fresh.len() as u64 > total {
            return Err(Error::RemoteRejected("Chunk runs past declared size".to_string()));
        }
        entry.data.extend_from_slice(fresh);
        state.stats.overlap_bytes += overlap;
        state.stats.bytes_received += fresh.len() as u64;

        let acknowledged = entry.data.len() as u64;
        let status = if acknowledged == total {
            let finished = state
                .sessions
                .remove(&session.session_uri)
                .ok_or_else(|| Error::RemoteRejected("Upload session not found".to_string()))?;
            let remote_id = state
                .store(&self.account_id, &finished.file, Bytes::from(finished.data))
                .remote_id;
            state
                .finished
                .insert(session.session_uri.clone(), remote_id.clone());
            SessionStatus::Complete { remote_id }
        } else {
            SessionStatus::InProgress { acknowledged }
        };

        if state.faults.lost_acks > 0 {
            state.faults.lost_acks -= 1;
            return Err(Error::RemoteUnavailable("response lost".to_string()));
        }
        Ok(status)
    }

    async fn query_upload(&self, session: &ResumeSession, _total: u64) -> Result<SessionStatus> {
        let state = self.lock();
        if let Some(remote_id) = state.finished.get(&session.session_uri) {
            return Ok(SessionStatus::Complete {
                remote_id: remote_id.clone(),
            });
        }
        let entry = state
            .sessions
            .get(&session.session_uri)
            .ok_or_else(|| Error::RemoteRejected("Upload session expired".to_string()))?;
        Ok(SessionStatus::InProgress {
            acknowledged: entry.data.len() as u64,
        })
    }

    async fn download(&self, remote_id: &str) -> Result<ByteStream> {
        let mut state = self.lock();
        state.stats.downloads += 1;
        if state.faults.failing_downloads.contains(remote_id) {
            return Err(Error::RemoteUnavailable(format!("Download of {} failed", remote_id)));
        }
        let data = state
            .files
            .iter()
            .find(|f| f.record.remote_id == remote_id)
            .map(|f| f.data.clone())
            .ok_or_else(|| Error::RemoteRejected(format!("File not found: {}", remote_id)))?;
        let truncate = state.faults.truncated_downloads.contains(remote_id);

        let mut pieces: Vec<Result<Bytes>> = (0..data.len())
            .step_by(DOWNLOAD_PIECE)
            .map(|start| Ok(data.slice(start..(start + DOWNLOAD_PIECE).min(data.len()))))
            .collect();
        if truncate {
            pieces.truncate(1);
            pieces.push(Err(Error::RemoteUnavailable("connection closed".to_string())));
        }
        Ok(Box::pin(stream::iter(pieces)))
    }
}

/// Collect a download into memory. Test helper.
#[cfg(test)]
pub(crate) async fn collect(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(piece) = stream.next().await {
        out.extend_from_slice(&piece?);
    }
    Ok(out)
}
