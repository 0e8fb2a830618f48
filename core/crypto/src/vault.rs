//! Sealing long-lived secrets under a passphrase.
//!
//! A [`CipherBlob`] is self-describing: it carries the KDF parameters, the
//! salt and the nonce it was produced with, so opening never depends on the
//! current configuration.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aead::{self, NONCE_SIZE};
use crate::kdf::{derive_key, KdfParams};
use crate::keys::Salt;
use skyshard_common::{Error, Result, SensitiveBytes};

/// Application context mixed into the associated data of every blob.
pub const CREDENTIAL_CONTEXT: &[u8] = b"skyshard/credential/v1";

/// Current blob format version.
pub const BLOB_VERSION: u8 = 1;

/// Associated data for a secret that belongs to `account_id`.
///
/// Binding the account id prevents a blob from being copied onto another
/// account record and opened there.
pub fn account_context(account_id: &str) -> Vec<u8> {
    let mut context = Vec::with_capacity(CREDENTIAL_CONTEXT.len() + 1 + account_id.len());
    context.extend_from_slice(CREDENTIAL_CONTEXT);
    context.push(0);
    context.extend_from_slice(account_id.as_bytes());
    context
}

/// Encrypted secret plus everything needed to decrypt it except the passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherBlob {
    pub version: u8,
    pub kdf: KdfParams,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Ciphertext with the 16-byte Poly1305 tag appended.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Seals and opens secrets with a passphrase-derived key.
#[derive(Debug, Clone, Default)]
pub struct CredentialVault {
    params: KdfParams,
}

impl CredentialVault {
    /// Create a vault that seals new blobs with `params`.
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// KDF parameters used for new blobs.
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Encrypt `secret` under `passphrase`.
    ///
    /// A fresh salt and nonce are drawn for every call.
    ///
    /// # Errors
    /// - Empty passphrase
    /// - KDF or cipher failure
    pub fn seal(&self, secret: &[u8], passphrase: &[u8], context: &[u8]) -> Result<CipherBlob> {
        let salt = Salt::generate();
        let key = derive_key(passphrase, &salt, &self.params)?;
        let (nonce, ciphertext) = aead::encrypt(&key, secret, context)?;

        debug!("Sealed credential ({} bytes)", secret.len());

        Ok(CipherBlob {
            version: BLOB_VERSION,
            kdf: self.params.clone(),
            salt: salt.as_bytes().to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt a blob produced by [`seal`](Self::seal).
    ///
    /// # Errors
    /// - [`Error::Decryption`] for a wrong passphrase, a different context,
    ///   or any structural corruption of the blob.
    pub fn open(&self, blob: &CipherBlob, passphrase: &[u8], context: &[u8]) -> Result<SensitiveBytes> {
        if blob.version != BLOB_VERSION || passphrase.is_empty() {
            return Err(Error::Decryption);
        }
        if !self.accepts(&blob.kdf) {
            return Err(Error::Decryption);
        }
        let salt = Salt::from_slice(&blob.salt).ok_or(Error::Decryption)?;
        let nonce: [u8; NONCE_SIZE] = blob
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| Error::Decryption)?;

        let key = derive_key(passphrase, &salt, &blob.kdf).map_err(|_| Error::Decryption)?;
        let plaintext = aead::decrypt(&key, &nonce, &blob.ciphertext, context)?;
        Ok(SensitiveBytes::new(plaintext))
    }

    /// Whether `kdf` is no costlier than the `sensitive` preset or the
    /// vault's own parameters, whichever is higher.
    fn accepts(&self, kdf: &KdfParams) -> bool {
        let ceiling = KdfParams::sensitive();
        kdf.memory_cost <= ceiling.memory_cost.max(self.params.memory_cost)
            && kdf.time_cost <= ceiling.time_cost.max(self.params.time_cost)
            && kdf.parallelism <= ceiling.parallelism.max(self.params.parallelism)
    }

    /// Re-encrypt a blob under a new passphrase with fresh salt and nonce.
    pub fn reseal(
        &self,
        blob: &CipherBlob,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
        context: &[u8],
    ) -> Result<CipherBlob> {
        let secret = self.open(blob, old_passphrase, context)?;
        self.seal(secret.as_bytes(), new_passphrase, context)
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
