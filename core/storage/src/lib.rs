//! Remote object store abstraction for SkyShard.
//!
//! One [`RemoteStore`] instance serves one account. Stores expose quota,
//! paginated listing, resumable-upload primitives and streamed downloads;
//! [`upload_file`] drives the primitives into a complete resumable upload.
//!
//! # Design Principles
//! - Provider isolation: no provider-specific logic above this crate
//! - Streaming: uploads read from a [`ContentSource`], downloads return a
//!   [`ByteStream`], neither buffers a whole file
//! - Unified error semantics: every failure is `RemoteUnavailable`
//!   (retryable), `RemoteRejected`, `RemoteAuth` or `Protocol`

pub mod auth;
pub mod gdrive;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod scripted;
pub mod source;
pub mod upload;

pub use auth::{AccessGrant, Identity, RemoteAuth, TokenBundle};
pub use memory::{MemoryStats, MemoryStore};
pub use provider::{AccessTokenSource, ByteStream, ListQuery, RecordStream, RemoteStore, SessionStatus};
pub use registry::{create_default_registry, StoreContext, StoreFactory, StoreRegistry};
pub use retry::{RetryConfig, RetryExecutor};
pub use scripted::ScriptedAuth;
pub use source::{BytesSource, ContentSource, FileSource};
pub use upload::{upload_file, UploadConfig, UploadEvent, UploadOutcome, CHUNK_ALIGNMENT};
