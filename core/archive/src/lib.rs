//! Restore archives.
//!
//! [`ArchiveComposer`] streams indexed files from any number of accounts
//! into a single ZIP, written by [`ZipStreamWriter`] as the bytes arrive.

pub mod composer;
pub mod zip;

pub use composer::{
    ArchiveComposer, ArchiveReport, ArchiveStream, EntryOutcome, EntryStatus, ReportFuture,
    ZIP_CONTENT_TYPE,
};
pub use zip::ZipStreamWriter;
