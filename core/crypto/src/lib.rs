//! Credential vault for SkyShard.
//!
//! Long-lived account secrets are sealed under a user passphrase:
//! - Key derivation using Argon2id with a fresh salt per secret
//! - Authenticated encryption using ChaCha20-Poly1305 with a fresh nonce per call
//! - Associated data binding every blob to the application and the account
//!
//! # Security Guarantees
//! - Key material is zeroized on drop
//! - No plaintext or key material is ever logged
//! - Wrong passphrase and corrupt blob are indistinguishable to the caller

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod vault;

pub use kdf::{derive_key, KdfParams};
pub use keys::{DerivedKey, Salt};
pub use vault::{account_context, CipherBlob, CredentialVault, CREDENTIAL_CONTEXT};
