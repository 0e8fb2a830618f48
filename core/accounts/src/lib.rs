//! Connected storage accounts for SkyShard.
//!
//! [`AccountRegistry`] owns the lifecycle of an account: connecting it
//! through the identity provider, sealing its long-lived credential,
//! handing out short-lived access tokens and building stores bound to
//! those tokens.

pub mod credential;
pub mod registry;

pub use credential::{AccessCredential, AccountTokens, CredentialBundle};
pub use registry::{AccountCapacity, AccountRegistry, REFRESH_SKEW_SECS};
