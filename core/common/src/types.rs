//! Common types used throughout SkyShard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Unique identifier for a connected storage account.
///
/// The value is the provider's stable account identifier, so reconnecting
/// the same account yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create a new AccountId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "AccountId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// A file to be transferred, independent of where its bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Name the file will carry on the remote side.
    pub name: String,
    /// Exact size in bytes.
    pub size_bytes: u64,
    /// MIME type.
    pub content_type: String,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size_bytes: u64, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            content_type: content_type.into(),
        }
    }
}

/// Point-in-time capacity of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Total capacity in bytes.
    pub bytes_total: u64,
    /// Used capacity in bytes.
    pub bytes_used: u64,
    /// When the snapshot was read from the remote.
    pub taken_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    pub fn new(bytes_total: u64, bytes_used: u64) -> Self {
        Self {
            bytes_total,
            bytes_used,
            taken_at: Utc::now(),
        }
    }

    /// Free bytes; zero when the remote reports more used than total.
    pub fn free_bytes(&self) -> u64 {
        self.bytes_total.saturating_sub(self.bytes_used)
    }
}

/// Entry of the file index kept per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Provider-specific file identifier.
    pub remote_id: String,
    /// Account that stores the file.
    pub account_id: AccountId,
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type.
    pub content_type: String,
    /// Folder the file lives in, if the provider reports one.
    pub parent_id: Option<String>,
    /// Last modification time on the remote.
    pub modified: DateTime<Utc>,
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SensitiveBytes {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_creation() {
        let id = AccountId::new("0123456789").unwrap();
        assert_eq!(id.as_str(), "0123456789");
        assert_eq!(id.to_string(), "0123456789");
    }

    #[test]
    fn test_account_id_empty_fails() {
        assert!(AccountId::new("").is_err());
        assert!(AccountId::new("   ").is_err());
    }

    #[test]
    fn test_free_bytes_saturates() {
        let quota = QuotaSnapshot::new(100, 40);
        assert_eq!(quota.free_bytes(), 60);

        // Remote may report usage above the limit after a plan downgrade.
        let over = QuotaSnapshot::new(100, 140);
        assert_eq!(over.free_bytes(), 0);
    }

    #[test]
    fn test_sensitive_bytes_debug_redacted() {
        let secret = SensitiveBytes::from("1//refresh-token".to_string());
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("refresh"));
        assert!(debug.contains("16 bytes"));
    }
}
