use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::error::AppError;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const FIELD_SEPARATOR: char = ':';

/// Authenticated symmetric encryption for tenant credentials at rest.
///
/// Wire format: `base64(iv):base64(tag):base64(ciphertext)`. Anything that
/// does not decrypt cleanly maps to the single opaque
/// [`AppError::Decryption`] so callers cannot distinguish tampering from
/// malformed input.
#[derive(Clone)]
pub struct EncryptionBox {
    cipher: Aes256Gcm,
}

impl EncryptionBox {
    /// Builds the box from the process-wide base64 key in configuration.
    pub fn from_base64_key(encoded: &str) -> Result<Self, AppError> {
        let key_bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AppError::Validation(format!("encryption_key is not valid base64: {e}")))?;
        if key_bytes.len() != KEY_LEN {
            return Err(AppError::Validation(format!(
                "encryption_key must decode to {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, AppError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        // aes-gcm appends the 16-byte tag to the ciphertext; the wire format
        // carries it as its own field.
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), Payload::from(plaintext))
            .map_err(|_| AppError::InternalError("encryption failed".into()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{iv}{sep}{tag}{sep}{ct}",
            iv = STANDARD.encode(iv),
            tag = STANDARD.encode(tag),
            ct = STANDARD.encode(ciphertext),
            sep = FIELD_SEPARATOR,
        ))
    }

    pub fn decrypt(&self, wire: &str) -> Result<Vec<u8>, AppError> {
        let mut fields = wire.split(FIELD_SEPARATOR);
        let (Some(iv), Some(tag), Some(ciphertext), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(AppError::Decryption);
        };

        let iv = STANDARD.decode(iv).map_err(|_| AppError::Decryption)?;
        let tag = STANDARD.decode(tag).map_err(|_| AppError::Decryption)?;
        let ciphertext = STANDARD.decode(ciphertext).map_err(|_| AppError::Decryption)?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(AppError::Decryption);
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        self.cipher
            .decrypt(Nonce::from_slice(&iv), Payload::from(sealed.as_slice()))
            .map_err(|_| AppError::Decryption)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    pub fn test_key_base64() -> String {
        STANDARD.encode([7u8; 32])
    }
}
