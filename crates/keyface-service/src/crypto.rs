use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("template encryption failed")]
    EncryptionFailed,
    #[error("template decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("encrypted blob too short: {0} bytes")]
    InvalidBlob(usize),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// AES-256-GCM cipher for serialized templates.
///
/// Blob layout: 12-byte random nonce || ciphertext || 16-byte GCM tag.
#[derive(Clone)]
pub struct TemplateCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for TemplateCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCipher").finish_non_exhaustive()
    }
}

impl TemplateCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Fixed all-zeros key. Only for in-memory databases.
    pub fn ephemeral() -> Self {
        Self::new([0u8; KEY_LEN])
    }

    /// Load the key from `key_path`, generating it on first use.
    pub fn from_key_file(key_path: &Path) -> Result<Self, CryptoError> {
        load_or_generate_key(key_path).map(Self::new)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; KEY_LEN], CryptoError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(CryptoError::KeyIo)?;
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected {KEY_LEN})",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded template encryption key");
        Ok(key)
    } else {
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent).map_err(CryptoError::KeyIo)?;
        }

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut f = options.open(key_path).map_err(CryptoError::KeyIo)?;
        f.write_all(&key).map_err(CryptoError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 template key");
        Ok(key)
    }
}
