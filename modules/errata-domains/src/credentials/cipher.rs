use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use super::key_source::CredentialError;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// AES-256-GCM sealing of per-run API keys.
#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyCipher(<redacted>)")
    }
}

impl KeyCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Parse a base64-encoded 32-byte secret.
    pub fn from_base64_secret(secret: &str) -> Result<Self, CredentialError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(secret.trim())
            .map_err(|e| CredentialError::Invalid(format!("secret is not base64: {e}")))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CredentialError::Invalid(format!("secret must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(&key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedKey, CredentialError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| CredentialError::Invalid(format!("encryption failed: {e}")))?;

        Ok(EncryptedKey {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    pub fn decrypt(&self, key: &EncryptedKey) -> Result<String, CredentialError> {
        if key.nonce.len() != NONCE_LEN {
            return Err(CredentialError::Invalid(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                key.nonce.len()
            )));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&key.nonce), key.ciphertext.as_ref())
            .map_err(|_| CredentialError::Invalid("decryption failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CredentialError::Invalid("decrypted key is not UTF-8".into()))
    }
}
