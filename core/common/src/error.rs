//! Error taxonomy for SkyShard.
//!
//! Remote failures are split into retryable (`RemoteUnavailable`) and
//! permanent (`RemoteRejected`) so that the transfer layer can decide
//! between backoff and failing a job outright.

use thiserror::Error;

/// Top-level error type for SkyShard operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong passphrase or corrupt sealed credential. The two causes are
    /// reported identically.
    #[error("Unable to decrypt credential")]
    Decryption,

    /// A sealed credential must be opened but no passphrase is available.
    #[error("Passphrase required to unlock account {0}")]
    NeedsPassphrase(String),

    /// The identity provider rejected a code exchange or token refresh.
    #[error("Remote authentication failed: {0}")]
    RemoteAuth(String),

    /// Transient network or service fault.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Permanent rejection by the remote (invalid id, quota exceeded, ...).
    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    /// Remote answered with a response that does not match the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No account has room for the listed files.
    #[error("Insufficient capacity for {} file(s): {}", unplaced.len(), unplaced.join(", "))]
    CapacityExceeded {
        /// Names of the files that could not be placed.
        unplaced: Vec<String>,
    },

    /// A bulk restore completed but some entries are error markers.
    #[error("Archive completed with {} failed file(s): {}", failed.len(), failed.join(", "))]
    PartialArchive {
        /// Names of the files that were replaced by error markers.
        failed: Vec<String>,
    },

    /// Operation was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// A state transition that the current state does not allow.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Cryptographic primitive failure unrelated to authentication.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Persistence layer failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::RemoteUnavailable("timeout".into()).is_retryable());
        assert!(Error::Io(std::io::Error::other("reset")).is_retryable());
        assert!(!Error::RemoteRejected("quota".into()).is_retryable());
        assert!(!Error::RemoteAuth("revoked".into()).is_retryable());
        assert!(!Error::Decryption.is_retryable());
    }

    #[test]
    fn test_capacity_message_lists_files() {
        let err = Error::CapacityExceeded {
            unplaced: vec!["a.bin".into(), "b.bin".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 file(s)"));
        assert!(msg.contains("a.bin, b.bin"));
    }

    #[test]
    fn test_decryption_message_has_no_detail() {
        assert_eq!(Error::Decryption.to_string(), "Unable to decrypt credential");
    }
}
