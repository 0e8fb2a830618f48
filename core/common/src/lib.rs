//! Common utilities and types shared across SkyShard crates.
//!
//! Everything that more than one component needs to agree on lives here:
//! the error taxonomy, account and file identifiers, quota snapshots and the
//! transfer job state machine.

pub mod error;
pub mod job;
pub mod types;

pub use error::{Error, Result};
pub use job::{JobId, JobState, ResumeSession, TransferJob};
pub use types::{AccountId, FileDescriptor, FileRecord, QuotaSnapshot, SensitiveBytes};
