//! AES-256-GCM encryption for sensitive payloads.
//!
//! Wire format: [1 byte: version=1][12 bytes: IV][N bytes: ciphertext + tag].
//! The key comes from the deployment environment and is never logged or
//! persisted.

use crate::config::EncryptionKey;
use crate::error::{Result, SyncError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

const FORMAT_VERSION: u8 = 1;
const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// Marker key wrapping an encrypted payload inside a JSON value.
const ENVELOPE_KEY: &str = "__enc";

/// Encrypts and decrypts record payloads before they leave the local
/// process.
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new_from_slice(&key.0).expect("32-byte key");
        Self { cipher }
    }

    /// Encrypt raw bytes into the framed wire format.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LENGTH];
        getrandom::getrandom(&mut iv)
            .map_err(|e| SyncError::Internal(format!("getrandom failed: {e}")))?;
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = self
            .cipher
            .encrypt(nonce, data)
            .map_err(|e| SyncError::Internal(format!("encryption failed: {e}")))?;

        let mut framed = Vec::with_capacity(1 + IV_LENGTH + ciphertext.len());
        framed.push(FORMAT_VERSION);
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    /// Decrypt framed bytes produced by [`PayloadCipher::encrypt`].
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < 1 + IV_LENGTH + TAG_LENGTH {
            return Err(SyncError::Internal("encrypted payload too short".into()));
        }
        if framed[0] != FORMAT_VERSION {
            return Err(SyncError::Internal(format!(
                "unsupported encryption version: {}",
                framed[0]
            )));
        }

        let iv = &framed[1..1 + IV_LENGTH];
        let ciphertext = &framed[1 + IV_LENGTH..];
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| SyncError::Internal("decryption failed".into()))
    }

    /// Wrap a JSON payload into an opaque envelope value.
    pub fn seal_payload(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        let framed = self.encrypt(&plaintext)?;
        Ok(serde_json::json!({ ENVELOPE_KEY: hex::encode(framed) }))
    }

    /// Unwrap an envelope produced by [`PayloadCipher::seal_payload`].
    /// Values without an envelope pass through unchanged, so pre-encryption
    /// rows stay readable.
    pub fn open_payload(&self, value: &serde_json::Value) -> Result<serde_json::Value> {
        let Some(envelope) = value.get(ENVELOPE_KEY).and_then(|v| v.as_str()) else {
            return Ok(value.clone());
        };
        let framed = hex::decode(envelope)
            .map_err(|_| SyncError::Internal("malformed encrypted payload".into()))?;
        let plaintext = self.decrypt(&framed)?;
        serde_json::from_slice(&plaintext).map_err(|e| SyncError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cipher() -> PayloadCipher {
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key).unwrap();
        PayloadCipher::new(&EncryptionKey(key))
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let c = cipher();
        let encrypted = c.encrypt(b"Hello, World!").unwrap();
        assert_eq!(encrypted[0], FORMAT_VERSION);
        let decrypted = c.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, b"Hello, World!");
    }

    #[test]
    fn different_ciphertext_each_time() {
        let c = cipher();
        let enc1 = c.encrypt(b"test").unwrap();
        let enc2 = c.encrypt(b"test").unwrap();
        assert_ne!(enc1, enc2);
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let c = cipher();
        let mut encrypted = c.encrypt(b"secret").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;
        assert!(c.decrypt(&encrypted).is_err());
    }

    #[test]
    fn rejects_truncated_data() {
        let c = cipher();
        assert!(c.decrypt(&[FORMAT_VERSION, 0, 1, 2]).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let c = cipher();
        let mut encrypted = c.encrypt(b"data").unwrap();
        encrypted[0] = 9;
        assert!(c.decrypt(&encrypted).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let a = cipher();
        let b = cipher();
        let encrypted = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn payload_envelope_round_trip() {
        let c = cipher();
        let payload = json!({"api_key": "sk-12345", "base_url": "https://api"});

        let sealed = c.seal_payload(&payload).unwrap();
        assert!(sealed.get(ENVELOPE_KEY).is_some());
        assert!(sealed.get("api_key").is_none());

        let opened = c.open_payload(&sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn plain_payload_passes_through() {
        let c = cipher();
        let payload = json!({"setting": "value"});
        assert_eq!(c.open_payload(&payload).unwrap(), payload);
    }
}
