//! Upload sources that can be reopened at an offset.
//!
//! Resuming an upload needs the bytes after the last acknowledged offset,
//! possibly in a later process, so sources are reopenable rather than
//! one-shot streams.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::AsyncSeekExt;
use tokio_util::io::ReaderStream;

use skyshard_common::{Error, Result};

use crate::provider::ByteStream;

/// Read buffer size for file sources.
const READ_BUFFER: usize = 64 * 1024;

/// Content that can be streamed from any offset.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the content starting at `offset`.
    async fn open_at(&self, offset: u64) -> Result<ByteStream>;
}

/// A file on local disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Open a source for `path`, recording its current length.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn open_at(&self, offset: u64) -> Result<ByteStream> {
        if offset > self.len {
            return Err(Error::InvalidInput(format!(
                "Offset {} beyond end of {}",
                offset,
                self.path.display()
            )));
        }
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let stream = ReaderStream::with_capacity(file, READ_BUFFER).map_err(Error::from);
        Ok(Box::pin(stream))
    }
}

/// In-memory content.
#[derive(Debug, Clone)]
pub struct BytesSource(Bytes);

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }
}

#[async_trait]
impl ContentSource for BytesSource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    async fn open_at(&self, offset: u64) -> Result<ByteStream> {
        let offset = usize::try_from(offset)
            .ok()
            .filter(|o| *o <= self.0.len())
            .ok_or_else(|| Error::InvalidInput(format!("Offset {} beyond end", offset)))?;
        let rest = self.0.slice(offset..);
        Ok(Box::pin(stream::once(async move { Ok(rest) })))
    }
}

/// Read a whole source into memory. Only used below the resumable threshold.
pub(crate) async fn read_all(source: &dyn ContentSource) -> Result<Bytes> {
    let mut stream = source.open_at(0).await?;
    let mut data = Vec::with_capacity(source.len() as usize);
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(data))
}
