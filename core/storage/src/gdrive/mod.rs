//! Google Drive provider for SkyShard.
//!
//! - OAuth2 authorization code exchange and token refresh ([`GoogleAuth`])
//! - Drive v3 API client with typed responses ([`DriveClient`])
//! - [`RemoteStore`](crate::RemoteStore) implementation using resumable
//!   upload sessions ([`DriveStore`])

pub mod auth;
pub mod client;
pub mod store;

pub use auth::{AuthConfig, GoogleAuth};
pub use client::DriveClient;
pub use store::{create_drive_store, DriveSettings, DriveStore, PROVIDER_NAME};
