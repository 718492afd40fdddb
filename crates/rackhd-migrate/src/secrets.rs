//! Credential sealing for migrated settings.
//!
//! Credential values inside a settings `config` are stored sealed with
//! AES-256-GCM as `base64(nonce || ciphertext)`. Sealing is idempotent: a
//! value that already opens under the current key is left alone, so rerunning
//! the migration never double-encrypts.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use rackhd_store::bson::{Bson, Document};
use thiserror::Error;
use tracing::{info, warn};

/// Keys inside a settings `config` that hold credential material.
pub const CREDENTIAL_FIELDS: &[&str] = &["password", "privateKey", "community"];

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Errors from the secrets codec.
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("no encryption key configured")]
    NoKey,

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Seals and opens credential values.
pub struct SecretsCodec {
    cipher: Option<Aes256Gcm>,
}

impl fmt::Debug for SecretsCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsCodec")
            .field("sealing", &self.is_sealing())
            .finish()
    }
}

impl SecretsCodec {
    /// Start the codec from a base64 encoded 32-byte key.
    ///
    /// Without a key the codec runs in passthrough mode and credentials are
    /// written unchanged.
    pub fn start(key: Option<&str>) -> Result<Self, SecretsError> {
        let Some(encoded) = key.map(str::trim).filter(|k| !k.is_empty()) else {
            warn!("no encryption key configured, credentials will be migrated unsealed");
            return Ok(Self { cipher: None });
        };

        let bytes = B64.decode(encoded)?;
        if bytes.len() != KEY_LEN {
            return Err(SecretsError::InvalidKey(format!(
                "key has wrong length: {} (expected {})",
                bytes.len(),
                KEY_LEN
            )));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes));
        info!("secrets codec started");
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// Whether credentials are being sealed.
    pub fn is_sealing(&self) -> bool {
        self.cipher.is_some()
    }

    fn cipher(&self) -> Result<&Aes256Gcm, SecretsError> {
        self.cipher.as_ref().ok_or(SecretsError::NoKey)
    }

    /// Seal a plaintext value.
    pub fn seal(&self, plaintext: &str) -> Result<String, SecretsError> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| SecretsError::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(B64.encode(sealed))
    }

    /// Open a sealed value.
    pub fn open(&self, sealed: &str) -> Result<String, SecretsError> {
        let cipher = self.cipher()?;
        let bytes = B64.decode(sealed)?;
        if bytes.len() <= NONCE_LEN {
            return Err(SecretsError::Decrypt(format!(
                "sealed value too short: {} bytes",
                bytes.len()
            )));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SecretsError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| SecretsError::Decrypt(format!("invalid UTF-8 in opened value: {}", e)))
    }

    /// Seal every credential field of a settings config in place.
    ///
    /// Returns how many fields were newly sealed.
    pub fn seal_credentials(&self, config: &mut Document) -> Result<usize, SecretsError> {
        if !self.is_sealing() {
            return Ok(0);
        }

        let mut sealed = 0;
        for field in CREDENTIAL_FIELDS {
            let Some(Bson::String(value)) = config.get(*field) else {
                continue;
            };
            if self.open(value).is_ok() {
                continue;
            }
            let value = self.seal(value)?;
            config.insert(*field, value);
            sealed += 1;
        }
        Ok(sealed)
    }
}
