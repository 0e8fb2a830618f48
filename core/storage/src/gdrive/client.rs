//! Google Drive v3 API client.
//!
//! Every response is decoded into a typed record; bodies that do not match
//! fail with `Protocol`. HTTP statuses are mapped onto the retryable /
//! permanent split of the error taxonomy by [`classify_status`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use skyshard_common::{AccountId, Error, FileRecord, Result};

use crate::provider::{AccessTokenSource, ByteStream};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// MIME type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents,trashed";
const LIST_FIELDS: &str = "files(id,name,mimeType,size,modifiedTime,parents,trashed),nextPageToken";

/// Build the shared HTTP client for API calls.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent("SkyShard/0.1")
        .connect_timeout(Duration::from_secs(15))
        .read_timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))
}

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }

    /// Convert to an index record. Folders have no record.
    pub fn to_record(&self, account_id: &AccountId) -> Option<FileRecord> {
        if self.is_folder() {
            return None;
        }
        Some(FileRecord {
            remote_id: self.id.clone(),
            account_id: account_id.clone(),
            name: self.name.clone(),
            size: self.size_bytes().unwrap_or(0),
            content_type: self.mime_type.clone(),
            parent_id: self.parents.first().cloned(),
            modified: self.modified_time.unwrap_or_else(Utc::now),
        })
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListResponse {
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveUser {
    pub display_name: String,
    pub email_address: String,
    /// Stable per-user id.
    pub permission_id: String,
}

/// Quota values are decimal strings; `limit` is absent for unlimited plans.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuota {
    #[serde(default)]
    pub limit: Option<String>,
    pub usage: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutResponse {
    pub user: DriveUser,
    pub storage_quota: StorageQuota,
}

impl AboutResponse {
    /// `(bytes_total, bytes_used)`.
    pub fn quota(&self) -> Result<(u64, u64)> {
        let parse = |field: &str, value: &str| {
            value
                .parse::<u64>()
                .map_err(|_| Error::Protocol(format!("Quota {} is not a number: {}", field, value)))
        };
        let total = match &self.storage_quota.limit {
            Some(limit) => parse("limit", limit)?,
            None => u64::MAX,
        };
        Ok((total, parse("usage", &self.storage_quota.usage)?))
    }
}

/// Result of a resumable-session call.
#[derive(Debug)]
pub enum ChunkStatus {
    Complete(DriveFile),
    Incomplete { acknowledged: u64 },
}

/// Map a failed HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let detail = format!("{} - {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED => Error::RemoteAuth(detail),
        StatusCode::FORBIDDEN => {
            if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") {
                Error::RemoteUnavailable(detail)
            } else {
                Error::RemoteRejected(detail)
            }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::RemoteUnavailable(detail)
        }
        s if s.is_server_error() => Error::RemoteUnavailable(detail),
        _ => Error::RemoteRejected(detail),
    }
}

fn network_error(action: &str, err: reqwest::Error) -> Error {
    Error::RemoteUnavailable(format!("{}: {}", action, err))
}

/// Parse the `Range: bytes=0-N` header of an incomplete session.
///
/// No header means the remote holds nothing yet.
pub fn parse_range(value: Option<&str>) -> Result<u64> {
    let Some(value) = value else {
        return Ok(0);
    };
    let end = value
        .strip_prefix("bytes=")
        .and_then(|r| r.split_once('-'))
        .and_then(|(start, end)| (start == "0").then_some(end))
        .and_then(|end| end.parse::<u64>().ok())
        .ok_or_else(|| Error::Protocol(format!("Malformed Range header: {}", value)))?;
    Ok(end + 1)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| network_error("Failed to read response", e))?;
    if !status.is_success() {
        return Err(classify_status(status, &String::from_utf8_lossy(&body)));
    }
    serde_json::from_slice(&body)
        .map_err(|e| Error::Protocol(format!("Unexpected response shape: {}", e)))
}

async fn fail(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body)
}

/// Read the `about` resource: identity and quota.
pub async fn fetch_about(http: &Client, access_token: &str) -> Result<AboutResponse> {
    let response = http
        .get(format!("{}/about", DRIVE_API_BASE))
        .bearer_auth(access_token)
        .query(&[("fields", "user,storageQuota")])
        .send()
        .await
        .map_err(|e| network_error("Failed to read account info", e))?;
    decode(response).await
}

/// Google Drive API client bound to one account's tokens.
pub struct DriveClient {
    http: Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new(tokens: Arc<dyn AccessTokenSource>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            tokens,
        })
    }

    /// Run `call` with the current access token. A token the remote
    /// refuses is handed back so the next call gets a new one.
    async fn authorized<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.tokens.access_token().await?;
        let result = call(token.clone()).await;
        if let Err(Error::RemoteAuth(reason)) = &result {
            warn!("Access token refused ({}), discarding it", reason);
            self.tokens.reject(&token).await;
        }
        result
    }

    /// Identity and quota of the account.
    pub async fn about(&self) -> Result<AboutResponse> {
        self.authorized(|token| async move { fetch_about(&self.http, &token).await })
            .await
    }

    /// Fetch one page of a file listing.
    pub async fn list_page(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FileListResponse> {
        let page_size = page_size.to_string();
        self.authorized(|token| async move {
            let mut request = self
                .http
                .get(format!("{}/files", DRIVE_API_BASE))
                .bearer_auth(token)
                .query(&[
                    ("q", query),
                    ("fields", LIST_FIELDS),
                    ("pageSize", page_size.as_str()),
                    ("spaces", "drive"),
                ]);
            if let Some(page) = page_token {
                request = request.query(&[("pageToken", page)]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| network_error("Failed to list files", e))?;
            decode(response).await
        })
        .await
    }

    /// Upload a small file in one multipart request.
    pub async fn upload_multipart(
        &self,
        name: &str,
        content_type: &str,
        parent_id: Option<&str>,
        data: Bytes,
    ) -> Result<DriveFile> {
        let metadata = serde_json::to_vec(&file_metadata(name, content_type, parent_id))?;

        let boundary = format!("SkyShard-{}", uuid::Uuid::new_v4().simple());
        let mut body = Vec::with_capacity(data.len() + metadata.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(&metadata);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(&data);
        body.extend_from_slice(format!("\r\n--{}--", boundary).as_bytes());

        self.authorized(|token| async move {
            let response = self
                .http
                .post(format!("{}/files", DRIVE_UPLOAD_BASE))
                .bearer_auth(token)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/related; boundary={}", boundary),
                )
                .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                .body(body)
                .send()
                .await
                .map_err(|e| network_error("Failed to upload file", e))?;
            decode(response).await
        })
        .await
    }

    /// Start a resumable upload session and return its URI.
    pub async fn start_resumable(
        &self,
        name: &str,
        content_type: &str,
        parent_id: Option<&str>,
        total_size: u64,
    ) -> Result<String> {
        let response = self
            .authorized(|token| async move {
                let response = self
                    .http
                    .post(format!("{}/files", DRIVE_UPLOAD_BASE))
                    .bearer_auth(token)
                    .header("X-Upload-Content-Type", content_type)
                    .header("X-Upload-Content-Length", total_size.to_string())
                    .query(&[("uploadType", "resumable")])
                    .json(&file_metadata(name, content_type, parent_id))
                    .send()
                    .await
                    .map_err(|e| network_error("Failed to start resumable upload", e))?;
                if !response.status().is_success() {
                    return Err(fail(response).await);
                }
                Ok(response)
            })
            .await?;

        let location = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Protocol("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::Protocol(format!("Invalid upload URI: {}", e)))?;
        let uri = Url::parse(location)
            .map_err(|e| Error::Protocol(format!("Invalid upload URI: {}", e)))?;
        Ok(uri.to_string())
    }

    /// Send `data` at `offset` of a `total`-byte session.
    pub async fn upload_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkStatus> {
        let content_range = if data.is_empty() {
            format!("bytes */{}", total)
        } else {
            format!("bytes {}-{}/{}", offset, offset + data.len() as u64 - 1, total)
        };
        debug!("PUT {} ({})", content_range, data.len());

        let url = session_url(session_uri)?;
        self.authorized(|token| async move {
            let response = self
                .http
                .put(url)
                .bearer_auth(token)
                .header(header::CONTENT_LENGTH, data.len().to_string())
                .header(header::CONTENT_RANGE, content_range)
                .body(data)
                .send()
                .await
                .map_err(|e| network_error("Failed to upload chunk", e))?;
            session_status(response).await
        })
        .await
    }

    /// Ask how many bytes a session holds.
    pub async fn query_session(&self, session_uri: &str, total: u64) -> Result<ChunkStatus> {
        let url = session_url(session_uri)?;
        self.authorized(|token| async move {
            let response = self
                .http
                .put(url)
                .bearer_auth(token)
                .header(header::CONTENT_LENGTH, "0")
                .header(header::CONTENT_RANGE, format!("bytes */{}", total))
                .send()
                .await
                .map_err(|e| network_error("Failed to query upload session", e))?;
            session_status(response).await
        })
        .await
    }

    /// Download file content as a stream.
    pub async fn download(&self, file_id: &str) -> Result<ByteStream> {
        let file_id = utf8_percent_encode(file_id, NON_ALPHANUMERIC).to_string();
        let response = self
            .authorized(|token| async move {
                let response = self
                    .http
                    .get(format!("{}/files/{}", DRIVE_API_BASE, file_id))
                    .bearer_auth(token)
                    .query(&[("alt", "media")])
                    .send()
                    .await
                    .map_err(|e| network_error("Failed to start download", e))?;
                if !response.status().is_success() {
                    return Err(fail(response).await);
                }
                Ok(response)
            })
            .await?;

        let stream = response
            .bytes_stream()
            .map_err(|e| network_error("Download interrupted", e))
            .boxed();
        Ok(stream)
    }
}

fn file_metadata(name: &str, content_type: &str, parent_id: Option<&str>) -> serde_json::Value {
    let mut metadata = serde_json::json!({
        "name": name,
        "mimeType": content_type,
    });
    if let Some(parent) = parent_id {
        metadata["parents"] = serde_json::json!([parent]);
    }
    metadata
}

fn session_url(session_uri: &str) -> Result<Url> {
    Url::parse(session_uri)
        .map_err(|e| Error::InvalidInput(format!("Invalid session URI: {}", e)))
}

async fn session_status(response: Response) -> Result<ChunkStatus> {
    let status = response.status();
    match status.as_u16() {
        200 | 201 => Ok(ChunkStatus::Complete(decode(response).await?)),
        308 => {
            let range = response
                .headers()
                .get(header::RANGE)
                .map(|v| v.to_str())
                .transpose()
                .map_err(|e| Error::Protocol(format!("Invalid Range header: {}", e)))?;
            Ok(ChunkStatus::Incomplete {
                acknowledged: parse_range(range)?,
            })
        }
        // The session no longer exists
        404 | 410 => Err(Error::RemoteRejected(format!(
            "Upload session expired ({})",
            status
        ))),
        _ => Err(fail(response).await),
    }
}
