//! Restore: stream indexed files from many accounts into one archive.

use futures::{StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use skyshard_accounts::AccountRegistry;
use skyshard_catalog::FileQuery;
use skyshard_common::{AccountId, Error, FileRecord, Result};
use skyshard_storage::{ByteStream, RemoteStore, RetryConfig, RetryExecutor};

use crate::zip::ZipStreamWriter;

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Archive bytes buffered between the composer and the reader.
const PIPE_CAPACITY: usize = 256 * 1024;

/// What happened to one requested file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Complete,
    /// Nothing could be read; an error marker took the file's place.
    Replaced { error: String },
    /// The download broke off; the entry holds what arrived before.
    Truncated { bytes_written: u64, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    /// Name of the entry written to the archive.
    pub entry_name: String,
    pub account_id: AccountId,
    pub remote_id: String,
    pub status: EntryStatus,
}

/// Per-file results of a finished archive, in archive order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub entries: Vec<EntryOutcome>,
}

impl ArchiveReport {
    /// Entry names of files that did not make it in full.
    pub fn failed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.status != EntryStatus::Complete)
            .map(|e| e.entry_name.as_str())
            .collect()
    }

    /// `PartialArchive` if any file failed.
    pub fn into_result(self) -> Result<Self> {
        let failed: Vec<String> = self.failed().into_iter().map(str::to_string).collect();
        if failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialArchive { failed })
        }
    }
}

pub type ReportFuture = Pin<Box<dyn Future<Output = Result<ArchiveReport>> + Send>>;

/// An archive being produced.
///
/// `body` must be drained for composition to make progress; `report`
/// resolves once the archive is finalized.
pub struct ArchiveStream {
    pub content_type: &'static str,
    pub body: ByteStream,
    pub report: ReportFuture,
}

/// Builds archives from indexed files.
#[derive(Clone)]
pub struct ArchiveComposer {
    accounts: AccountRegistry,
    retry: RetryConfig,
}

impl ArchiveComposer {
    pub fn new(accounts: AccountRegistry) -> Self {
        Self {
            accounts,
            retry: RetryConfig::default(),
        }
    }

    /// Retry policy for opening each download.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Archive every indexed file matching `query`.
    ///
    /// # Errors
    /// - `NotFound` if nothing matches
    pub fn compose_query(&self, query: &FileQuery) -> Result<ArchiveStream> {
        let records = self.accounts.catalog().query_file_records(query)?;
        if records.is_empty() {
            return Err(Error::NotFound("No indexed files match".to_string()));
        }
        Ok(self.compose(records))
    }

    /// Archive `records` in the given order.
    ///
    /// Files are downloaded one at a time and copied straight into the
    /// output. A file that cannot be read becomes a `<name>.error.txt`
    /// entry; the archive is always finalized.
    pub fn compose(&self, records: Vec<FileRecord>) -> ArchiveStream {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let this = self.clone();
        let task = tokio::spawn(async move { this.write_archive(records, writer).await });

        let body = ReaderStream::new(reader).map_err(Error::from);
        let report = async move {
            task.await
                .map_err(|e| Error::InvalidState(format!("Archive task failed: {}", e)))?
        };
        ArchiveStream {
            content_type: ZIP_CONTENT_TYPE,
            body: Box::pin(body),
            report: Box::pin(report),
        }
    }

    async fn write_archive(
        &self,
        records: Vec<FileRecord>,
        out: DuplexStream,
    ) -> Result<ArchiveReport> {
        info!("Composing archive of {} file(s)", records.len());
        let mut zip = ZipStreamWriter::new(out);
        let mut stores: HashMap<AccountId, Result<Arc<dyn RemoteStore>>> = HashMap::new();
        let mut names = EntryNames::default();
        let mut report = ArchiveReport::default();

        for record in records {
            let store = stores
                .entry(record.account_id.clone())
                .or_insert_with(|| self.accounts.store_for(&record.account_id));
            let (entry_name, status) = match store {
                Ok(store) => {
                    self.copy_file(&mut zip, &mut names, store.as_ref(), &record)
                        .await?
                }
                Err(e) => {
                    let marker = write_marker(&mut zip, &mut names, &record, &e.to_string()).await?;
                    let status = EntryStatus::Replaced {
                        error: e.to_string(),
                    };
                    (marker, status)
                }
            };
            report.entries.push(EntryOutcome {
                entry_name,
                account_id: record.account_id,
                remote_id: record.remote_id,
                status,
            });
        }

        let failed = report.failed().len();
        zip.finish().await?;
        if failed > 0 {
            warn!("Archive finalized with {} failed file(s)", failed);
        } else {
            info!("Archive finalized");
        }
        Ok(report)
    }

    /// Stream one file into the archive, returning the entry name used.
    /// `Err` only when the archive itself can no longer be written.
    async fn copy_file<W: AsyncWrite + Unpin>(
        &self,
        zip: &mut ZipStreamWriter<W>,
        names: &mut EntryNames,
        store: &dyn RemoteStore,
        record: &FileRecord,
    ) -> Result<(String, EntryStatus)> {
        let executor = RetryExecutor::new(self.retry.clone());
        let mut body = match executor.execute(|| store.download(&record.remote_id)).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not read {} from {}: {}", record.name, record.account_id, e);
                let marker = write_marker(zip, names, record, &e.to_string()).await?;
                let status = EntryStatus::Replaced {
                    error: e.to_string(),
                };
                return Ok((marker, status));
            }
        };

        // Hold back the header until the first piece so a download that
        // fails straight away still becomes a marker.
        let first = match body.next().await {
            Some(Ok(piece)) => Some(piece),
            None => None,
            Some(Err(e)) => {
                warn!("Could not read {} from {}: {}", record.name, record.account_id, e);
                let marker = write_marker(zip, names, record, &e.to_string()).await?;
                let status = EntryStatus::Replaced {
                    error: e.to_string(),
                };
                return Ok((marker, status));
            }
        };

        let entry_name = names.claim(&record.name);
        zip.start_entry(&entry_name, record.modified, record.size).await?;
        let mut written = 0u64;
        let mut pieces = futures::stream::iter(first.map(Ok)).chain(body);
        while let Some(piece) = pieces.next().await {
            let error = match piece {
                Ok(piece) if piece.len() as u64 <= zip.remaining() => {
                    zip.write_data(&piece).await?;
                    written += piece.len() as u64;
                    continue;
                }
                // Indexed below 4 GiB, so the entry has no ZIP64 sizes
                Ok(_) => format!(
                    "file outgrew the {} bytes it was indexed with",
                    record.size
                ),
                Err(e) => e.to_string(),
            };
            warn!(
                "Copy of {} broke off after {} bytes: {}",
                record.name, written, error
            );
            let note = format!("truncated after {} bytes: {}", written, error);
            zip.finish_entry(Some(&note)).await?;
            let status = EntryStatus::Truncated {
                bytes_written: written,
                error,
            };
            return Ok((entry_name, status));
        }

        if written != record.size {
            // The index may be stale; what the remote served is what we keep.
            debug!(
                "{} is {} bytes, index says {}",
                record.name, written, record.size
            );
        }
        zip.finish_entry(None).await?;
        debug!("Archived {} ({} bytes)", entry_name, written);
        Ok((entry_name, EntryStatus::Complete))
    }
}

/// Write `<name>.error.txt` in place of `record`, returning its entry name.
async fn write_marker<W: AsyncWrite + Unpin>(
    zip: &mut ZipStreamWriter<W>,
    names: &mut EntryNames,
    record: &FileRecord,
    error: &str,
) -> Result<String> {
    let text = format!(
        "{} could not be restored.\n\nAccount: {}\nRemote id: {}\nError: {}\n",
        record.name, record.account_id, record.remote_id, error
    );
    let entry_name = names.claim(&format!("{}.error.txt", sanitize(&record.name)));
    zip.add_entry(&entry_name, chrono::Utc::now(), text.as_bytes())
        .await?;
    Ok(entry_name)
}

/// Hands out unique, relative entry names.
#[derive(Default)]
struct EntryNames {
    taken: HashSet<String>,
}

impl EntryNames {
    fn claim(&mut self, name: &str) -> String {
        let clean = sanitize(name);
        if self.taken.insert(clean.clone()) {
            return clean;
        }
        let (stem, ext) = match clean.rfind('.') {
            Some(dot) if dot > 0 && !clean[dot..].contains('/') => clean.split_at(dot),
            _ => (clean.as_str(), ""),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{} ({}){}", stem, n, ext);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Strip anything that would escape the archive root.
fn sanitize(name: &str) -> String {
    let parts: Vec<&str> = name
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect();
    if parts.is_empty() {
        "unnamed".to_string()
    } else {
        parts.join("/")
    }
}
