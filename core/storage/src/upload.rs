//! Upload driver on top of the [`RemoteStore`] session primitives.
//!
//! Small inputs go up in one request. Larger inputs open a resumable
//! session and are sent in chunks; after a transient failure the driver asks
//! the remote how many bytes it holds and continues from exactly there, so
//! acknowledged bytes are never sent twice and no byte is skipped.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skyshard_common::{Error, FileDescriptor, ResumeSession, Result};

use crate::provider::{RemoteStore, SessionStatus};
use crate::retry::{millis, RetryConfig, RetryExecutor};
use crate::source::{read_all, ContentSource};

/// Granularity required by resumable sessions for every non-final chunk.
pub const CHUNK_ALIGNMENT: u64 = 256 * 1024;

/// Upload tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Inputs of at least this many bytes use a resumable session.
    pub resumable_threshold: u64,
    /// Bytes per chunk; a multiple of [`CHUNK_ALIGNMENT`].
    pub chunk_size: u64,
    /// Retry policy for a single chunk (and for opening a session).
    pub chunk_retry: RetryConfig,
    /// Limit for any single remote call.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            resumable_threshold: 5 * 1024 * 1024,
            chunk_size: 32 * CHUNK_ALIGNMENT,
            chunk_retry: RetryConfig::new(5),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl UploadConfig {
    /// Check chunk size constraints.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(Error::InvalidInput(format!(
                "Chunk size {} is not a positive multiple of {}",
                self.chunk_size, CHUNK_ALIGNMENT
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::InvalidInput("Call timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Progress notifications emitted while uploading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// A resumable session is open; persist it to resume later.
    Session(ResumeSession),
    /// The remote holds this many bytes. Never decreases.
    Acknowledged(u64),
}

/// How an upload ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed { remote_id: String },
    /// Cancelled; `session` is set when a resumable session was open.
    Paused { session: Option<ResumeSession> },
}

/// Run a remote call under the per-call timeout.
pub(crate) async fn timed<T>(
    limit: Duration,
    what: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call).await.map_err(|_| {
        Error::RemoteUnavailable(format!("{} timed out after {:?}", what, limit))
    })?
}

/// Upload `source` as `file` to `store`.
///
/// With `resume`, the session is first queried: a completed session returns
/// immediately, an expired one fails with `RemoteRejected` so the caller can
/// start over without it.
///
/// # Errors
/// - `InvalidInput` when the source length differs from the descriptor
/// - `RemoteUnavailable` after the chunk retry budget is spent
/// - `RemoteRejected`, `RemoteAuth` and `Protocol` as reported by the store
pub async fn upload_file(
    store: &dyn RemoteStore,
    file: &FileDescriptor,
    source: &dyn ContentSource,
    resume: Option<ResumeSession>,
    config: &UploadConfig,
    events: &mpsc::UnboundedSender<UploadEvent>,
    cancel: &CancellationToken,
) -> Result<UploadOutcome> {
    config.validate()?;
    if source.len() != file.size_bytes {
        return Err(Error::InvalidInput(format!(
            "{} is {} bytes but the source holds {}",
            file.name,
            file.size_bytes,
            source.len()
        )));
    }

    if resume.is_none() && file.size_bytes < config.resumable_threshold {
        return upload_small(store, file, source, config, events, cancel).await;
    }

    let session_retry = RetryExecutor::new(config.chunk_retry.clone());
    let total = file.size_bytes;

    let mut session = match resume {
        Some(previous) => {
            let status = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(UploadOutcome::Paused { session: Some(previous.clone()) });
                }
                status = session_retry.execute(|| {
                    timed(config.call_timeout, "Session query", store.query_upload(&previous, total))
                }) => status?,
            };
            match status {
                SessionStatus::Complete { remote_id } => {
                    info!("Session for {} had already completed", file.name);
                    let _ = events.send(UploadEvent::Acknowledged(total));
                    return Ok(UploadOutcome::Completed { remote_id });
                }
                SessionStatus::InProgress { acknowledged } => {
                    check_ack(acknowledged, 0, total)?;
                    debug!("Resuming {} at byte {}", file.name, acknowledged);
                    ResumeSession {
                        session_uri: previous.session_uri,
                        acknowledged,
                    }
                }
            }
        }
        None => tokio::select! {
            _ = cancel.cancelled() => return Ok(UploadOutcome::Paused { session: None }),
            session = session_retry.execute(|| {
                timed(config.call_timeout, "Session start", store.begin_upload(file))
            }) => session?,
        },
    };

    let _ = events.send(UploadEvent::Session(session.clone()));
    if session.acknowledged > 0 {
        let _ = events.send(UploadEvent::Acknowledged(session.acknowledged));
    }

    loop {
        if cancel.is_cancelled() {
            return Ok(UploadOutcome::Paused { session: Some(session) });
        }

        let offset = session.acknowledged;
        let chunk = read_chunk(source, offset, config.chunk_size).await?;
        let sent = chunk.len();

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Upload of {} paused at byte {}", file.name, offset);
                return Ok(UploadOutcome::Paused { session: Some(session.clone()) });
            }
            status = send_chunk(store, &session, offset, chunk, total, config) => status?,
        };

        match status {
            SessionStatus::Complete { remote_id } => {
                let _ = events.send(UploadEvent::Acknowledged(total));
                info!("Uploaded {} ({} bytes)", file.name, total);
                return Ok(UploadOutcome::Completed { remote_id });
            }
            SessionStatus::InProgress { acknowledged } => {
                check_ack(acknowledged, offset, total)?;
                if acknowledged == total {
                    return Err(Error::Protocol(format!(
                        "Session for {} holds every byte but is not complete",
                        file.name
                    )));
                }
                debug!(
                    "Chunk at {} ({} bytes): remote holds {}",
                    offset, sent, acknowledged
                );
                session.acknowledged = acknowledged;
                let _ = events.send(UploadEvent::Acknowledged(acknowledged));
            }
        }
    }
}

async fn upload_small(
    store: &dyn RemoteStore,
    file: &FileDescriptor,
    source: &dyn ContentSource,
    config: &UploadConfig,
    events: &mpsc::UnboundedSender<UploadEvent>,
    cancel: &CancellationToken,
) -> Result<UploadOutcome> {
    let data = read_all(source).await?;
    let retry = RetryExecutor::new(config.chunk_retry.clone());

    let remote_id = tokio::select! {
        _ = cancel.cancelled() => return Ok(UploadOutcome::Paused { session: None }),
        id = retry.execute(|| {
            timed(config.call_timeout, "Upload", store.upload_simple(file, data.clone()))
        }) => id?,
    };

    let _ = events.send(UploadEvent::Acknowledged(file.size_bytes));
    info!("Uploaded {} ({} bytes) in one request", file.name, file.size_bytes);
    Ok(UploadOutcome::Completed { remote_id })
}

/// The remote may never move backwards or past the end.
fn check_ack(acknowledged: u64, offset: u64, total: u64) -> Result<()> {
    if acknowledged < offset || acknowledged > total {
        return Err(Error::Protocol(format!(
            "Remote acknowledged {} bytes (sent from {}, total {})",
            acknowledged, offset, total
        )));
    }
    Ok(())
}

/// Send one chunk, retrying transient failures.
///
/// After each failure the session is queried: if the remote already holds
/// bytes past `offset`, that status is returned so the caller continues from
/// the acknowledged position instead of resending.
async fn send_chunk(
    store: &dyn RemoteStore,
    session: &ResumeSession,
    offset: u64,
    chunk: Bytes,
    total: u64,
    config: &UploadConfig,
) -> Result<SessionStatus> {
    let policy = &config.chunk_retry;
    let mut attempt = 0;

    loop {
        let err = match timed(
            config.call_timeout,
            "Chunk upload",
            store.upload_chunk(session, offset, chunk.clone(), total),
        )
        .await
        {
            Ok(SessionStatus::InProgress { acknowledged }) if acknowledged == offset && !chunk.is_empty() => {
                Error::RemoteUnavailable(format!("No bytes acknowledged at offset {}", offset))
            }
            Ok(status) => return Ok(status),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        let delay = policy.delay_for_attempt(attempt - 1);
        warn!(
            "Chunk at {} failed (attempt {}): {}. Retrying in {:?}",
            offset, attempt, err, delay
        );
        tokio::time::sleep(delay).await;

        match timed(config.call_timeout, "Session query", store.query_upload(session, total)).await {
            Ok(SessionStatus::InProgress { acknowledged }) if acknowledged > offset => {
                return Ok(SessionStatus::InProgress { acknowledged });
            }
            Ok(SessionStatus::Complete { remote_id }) => {
                return Ok(SessionStatus::Complete { remote_id });
            }
            Ok(SessionStatus::InProgress { .. }) => {}
            Err(err) if err.is_retryable() => {
                debug!("Session query failed: {}", err);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Read up to `limit` bytes starting at `offset`.
async fn read_chunk(source: &dyn ContentSource, offset: u64, limit: u64) -> Result<Bytes> {
    let remaining = source.len().saturating_sub(offset);
    let want = remaining.min(limit) as usize;
    let mut buf = BytesMut::with_capacity(want);
    let mut stream = source.open_at(offset).await?;

    while buf.len() < want {
        match stream.next().await {
            Some(piece) => {
                let piece = piece?;
                let take = piece.len().min(want - buf.len());
                buf.extend_from_slice(&piece[..take]);
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "Source ended at byte {} of {}",
                    offset + buf.len() as u64,
                    source.len()
                )));
            }
        }
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::source::BytesSource;
    use skyshard_common::AccountId;

    const KIB: u64 = 1024;

    fn config() -> UploadConfig {
        UploadConfig {
            resumable_threshold: 512 * KIB,
            chunk_size: CHUNK_ALIGNMENT,
            chunk_retry: RetryConfig::new(4)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn payload(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn store() -> MemoryStore {
        MemoryStore::new(AccountId::new("acct-a").unwrap(), 64 * 1024 * KIB)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn acks(events: &[UploadEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Acknowledged(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_chunk_size_must_be_aligned() {
        let mut cfg = config();
        cfg.chunk_size = 300 * KIB;
        assert!(cfg.validate().is_err());
        cfg.chunk_size = 0;
        assert!(cfg.validate().is_err());
        assert!(UploadConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_small_file_uses_single_request() {
        let store = store();
        let data = payload(10 * KIB);
        let file = FileDescriptor::new("small.bin", data.len() as u64, "application/octet-stream");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = upload_file(
            &store,
            &file,
            &BytesSource::new(data.clone()),
            None,
            &config(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let UploadOutcome::Completed { remote_id } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(store.file_bytes(&remote_id).unwrap(), data);
        assert_eq!(store.stats().chunk_calls, 0);
        assert_eq!(acks(&drain(&mut rx)), vec![10 * KIB]);
    }

    #[tokio::test]
    async fn test_large_file_chunked_with_monotonic_progress() {
        let store = store();
        let data = payload(1024 * KIB + 100);
        let file = FileDescriptor::new("large.bin", data.len() as u64, "application/octet-stream");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = upload_file(
            &store,
            &file,
            &BytesSource::new(data.clone()),
            None,
            &config(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let UploadOutcome::Completed { remote_id } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(store.file_bytes(&remote_id).unwrap(), data);
        assert_eq!(store.stats().chunk_calls, 5);

        let events = drain(&mut rx);
        assert!(matches!(events[0], UploadEvent::Session(_)));
        let progress = acks(&events);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last().copied(), Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_transient_failures_resume_from_acknowledged_offset() {
        let store = store();
        store.inject_chunk_failures(2);
        // Bytes land but the response is lost; the re-query must see them.
        store.inject_lost_acks(1);

        let data = payload(1024 * KIB);
        let file = FileDescriptor::new("flaky.bin", data.len() as u64, "application/octet-stream");
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = upload_file(
            &store,
            &file,
            &BytesSource::new(data.clone()),
            None,
            &config(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let UploadOutcome::Completed { remote_id } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(store.file_bytes(&remote_id).unwrap(), data);
        let stats = store.stats();
        assert_eq!(stats.overlap_bytes, 0);
        assert_eq!(stats.bytes_received, data.len() as u64);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let store = store();
        store.inject_chunk_failures(100);

        let data = payload(1024 * KIB);
        let file = FileDescriptor::new("doomed.bin", data.len() as u64, "application/octet-stream");
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = upload_file(
            &store,
            &file,
            &BytesSource::new(data),
            None,
            &config(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancel_then_resume_without_gap_or_overlap() {
        let store = store();
        let data = payload(2048 * KIB);
        let file = FileDescriptor::new("paused.bin", data.len() as u64, "application/octet-stream");
        let source = BytesSource::new(data.clone());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Cancel once the remote holds three chunks.
        let watcher = {
            let cancel = cancel.clone();
            let store = store.clone();
            tokio::spawn(async move {
                while store.stats().bytes_received < 3 * CHUNK_ALIGNMENT {
                    tokio::task::yield_now().await;
                }
                cancel.cancel();
            })
        };
        store.set_chunk_delay(Duration::from_millis(5));

        let outcome = upload_file(&store, &file, &source, None, &config(), &tx, &cancel)
            .await
            .unwrap();
        watcher.await.unwrap();

        let UploadOutcome::Paused { session: Some(session) } = outcome else {
            panic!("expected paused with session");
        };
        let first = acks(&drain(&mut rx));
        let held = store.stats().bytes_received;
        assert!(held >= 3 * CHUNK_ALIGNMENT && held < data.len() as u64);

        store.set_chunk_delay(Duration::ZERO);
        let outcome = upload_file(
            &store,
            &file,
            &source,
            Some(session),
            &config(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let UploadOutcome::Completed { remote_id } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(store.file_bytes(&remote_id).unwrap(), data);
        let stats = store.stats();
        assert_eq!(stats.overlap_bytes, 0);
        assert_eq!(stats.bytes_received, data.len() as u64);

        let second = acks(&drain(&mut rx));
        assert!(second[0] >= *first.last().unwrap_or(&0));
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let store = store();
        let data = payload(1024 * KIB);
        let file = FileDescriptor::new("stale.bin", data.len() as u64, "application/octet-stream");
        let session = store.begin_upload(&file).await.unwrap();
        store.expire_sessions();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = upload_file(
            &store,
            &file,
            &BytesSource::new(data),
            Some(session),
            &config(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::RemoteRejected(_)));
    }

    #[tokio::test]
    async fn test_size_mismatch_is_invalid_input() {
        let store = store();
        let file = FileDescriptor::new("liar.bin", 99, "application/octet-stream");
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = upload_file(
            &store,
            &file,
            &BytesSource::new(payload(10)),
            None,
            &config(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let err = timed(Duration::from_millis(5), "Slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
    }
}
