//! Files handed to the coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use skyshard_common::{Error, FileDescriptor, Result};
use skyshard_storage::{ContentSource, FileSource};

/// A file to upload together with the bytes behind it.
#[derive(Clone)]
pub struct UploadItem {
    pub descriptor: FileDescriptor,
    pub source: Arc<dyn ContentSource>,
    /// Recorded on the job so it can be resumed by a later process.
    pub path: Option<PathBuf>,
}

impl UploadItem {
    pub fn new(descriptor: FileDescriptor, source: Arc<dyn ContentSource>) -> Self {
        Self {
            descriptor,
            source,
            path: None,
        }
    }

    /// Upload a local file under its file name.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("No file name in {}", path.display())))?;
        let source = FileSource::open(path).await?;
        Ok(Self {
            descriptor: FileDescriptor::new(name, source.len(), content_type_for(path)),
            source: Arc::new(source),
            path: Some(path.to_path_buf()),
        })
    }
}

/// MIME type guessed from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt" | "log" | "md") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("tar") => "application/x-tar",
        Some("gz" | "tgz") => "application/gzip",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_guess() {
        assert_eq!(content_type_for(Path::new("a/Photo.JPG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("backup.tar")), "application/x-tar");
        assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_from_path_reads_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let item = UploadItem::from_path(&path).await.unwrap();
        assert_eq!(item.descriptor.name, "notes.txt");
        assert_eq!(item.descriptor.size_bytes, 11);
        assert_eq!(item.descriptor.content_type, "text/plain");
        assert_eq!(item.path.as_deref(), Some(path.as_path()));

        assert!(UploadItem::from_path(dir.path()).await.is_err());
    }
}
