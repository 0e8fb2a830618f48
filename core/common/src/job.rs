//! Transfer job state machine.
//!
//! ```text
//! pending -> uploading -> completed
//!                      -> failed
//!                      -> paused -> uploading
//! ```
//!
//! `completed` is final. `failed` only leaves through an explicit
//! [`TransferJob::reset_for_retry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AccountId, FileDescriptor};

/// Unique identifier for a transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Generate a new unique job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id, e.g. one typed on the command line.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidInput("JobId cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Uploading,
    Completed,
    Failed,
    Paused,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Uploading => "uploading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Paused => "paused",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "uploading" => Ok(JobState::Uploading),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "paused" => Ok(JobState::Paused),
            other => Err(Error::InvalidInput(format!("Unknown job state: {}", other))),
        }
    }
}

/// Resumable upload session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSession {
    /// Provider session locator (for Drive, the upload URI).
    pub session_uri: String,
    /// Bytes the remote has acknowledged.
    pub acknowledged: u64,
}

/// A single file transfer to one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: JobId,
    pub file: FileDescriptor,
    pub account_id: AccountId,
    /// Local file the bytes are read from, when there is one.
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    pub state: JobState,
    /// Bytes acknowledged so far. Never decreases within an attempt.
    pub bytes_transferred: u64,
    pub session: Option<ResumeSession>,
    /// Remote id of the finished upload.
    pub remote_id: Option<String>,
    pub error: Option<String>,
    /// Number of times the job entered `uploading`.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferJob {
    /// Create a pending job.
    pub fn new(file: FileDescriptor, account_id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            file,
            account_id,
            source_path: None,
            state: JobState::Pending,
            bytes_transferred: 0,
            session: None,
            remote_id: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Remember where the bytes come from so the job can resume after a restart.
    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Whether the job reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }

    fn invalid(&self, action: &str) -> Error {
        Error::InvalidState(format!(
            "Cannot {} job {} in state {}",
            action, self.id, self.state
        ))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// `pending | paused -> uploading`.
    pub fn mark_uploading(&mut self) -> Result<()> {
        match self.state {
            JobState::Pending | JobState::Paused => {
                self.state = JobState::Uploading;
                self.attempts += 1;
                self.error = None;
                self.touch();
                Ok(())
            }
            _ => Err(self.invalid("start")),
        }
    }

    /// Record acknowledged bytes. Returns `true` if the counter advanced.
    ///
    /// Lower values than the current counter are ignored.
    pub fn record_progress(&mut self, acknowledged: u64) -> bool {
        if self.state != JobState::Uploading {
            return false;
        }
        let acknowledged = acknowledged.min(self.file.size_bytes);
        if acknowledged > self.bytes_transferred {
            self.bytes_transferred = acknowledged;
            self.touch();
            true
        } else {
            false
        }
    }

    /// Remember the resumable session so that a pause can be resumed.
    pub fn set_session(&mut self, session: ResumeSession) {
        self.session = Some(session);
        self.touch();
    }

    /// `uploading -> completed`.
    pub fn mark_completed(&mut self, remote_id: impl Into<String>) -> Result<()> {
        if self.state != JobState::Uploading {
            return Err(self.invalid("complete"));
        }
        self.state = JobState::Completed;
        self.bytes_transferred = self.file.size_bytes;
        self.remote_id = Some(remote_id.into());
        self.session = None;
        self.error = None;
        self.touch();
        Ok(())
    }

    /// `pending | uploading | paused -> failed`.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid("fail"));
        }
        self.state = JobState::Failed;
        self.error = Some(error.into());
        self.touch();
        Ok(())
    }

    /// `uploading -> paused`, keeping the session token.
    pub fn mark_paused(&mut self) -> Result<()> {
        if self.state != JobState::Uploading {
            return Err(self.invalid("pause"));
        }
        self.state = JobState::Paused;
        self.touch();
        Ok(())
    }

    /// Back to `pending` from scratch after the remote refused a resume.
    pub fn restart(&mut self) -> Result<()> {
        match self.state {
            JobState::Uploading | JobState::Paused => {
                self.state = JobState::Pending;
                self.session = None;
                self.bytes_transferred = 0;
                self.touch();
                Ok(())
            }
            _ => Err(self.invalid("restart")),
        }
    }

    /// `failed -> pending`. The session token, if any, is kept so the next
    /// attempt can continue from the acknowledged offset.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.state != JobState::Failed {
            return Err(self.invalid("retry"));
        }
        self.state = JobState::Pending;
        self.error = None;
        if self.session.is_none() {
            self.bytes_transferred = 0;
        }
        self.touch();
        Ok(())
    }
}
