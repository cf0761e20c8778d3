use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

const NONCE_LEN: usize = 12;

/// Upstream API key. Never printed; `Debug` redacts the value.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(****)")
    }
}

/// Uniform failure for every decrypt anomaly: bad base64, truncated buffer,
/// tag mismatch, non-UTF-8 plaintext. Callers map it straight to an auth
/// failure; no detail ever leaves this module.
#[derive(Error, Debug)]
#[error("credential decryption failed")]
pub struct CipherError;

/// AES-256-GCM cipher over the process-wide credential key.
///
/// Wire format: base64(nonce[12] || ciphertext || tag).
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(bytes).map_err(|_| CipherError)?;
        Ok(Self { cipher })
    }

    pub fn from_base64(b64: &str) -> Result<Self, CipherError> {
        let bytes = BASE64.decode(b64).map_err(|_| CipherError)?;
        Self::from_key_bytes(&bytes)
    }

    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<ApiKey, CipherError> {
        let raw = BASE64.decode(ciphertext_b64).map_err(|_| CipherError)?;
        if raw.len() < NONCE_LEN {
            return Err(CipherError);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError)?;

        let key = String::from_utf8(plaintext).map_err(|_| CipherError)?;
        Ok(ApiKey::new(key))
    }

    /// Used by provisioning paths and tests; the read path only decrypts.
    pub fn encrypt(&self, key: &ApiKey) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, key.as_str().as_bytes())
            .map_err(|_| CipherError)?;

        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> KeyCipher {
        KeyCipher::from_key_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let c = cipher();
        let sealed = c.encrypt(&ApiKey::new("sk-test-123")).unwrap();
        let opened = c.decrypt(&sealed).unwrap();
        assert_eq!(opened.as_str(), "sk-test-123");
    }

    #[test]
    fn malformed_inputs_fail_uniformly() {
        let c = cipher();

        // Not base64, too short, and tampered ciphertext all look the same.
        assert!(c.decrypt("%%%not-base64%%%").is_err());
        assert!(c.decrypt(&BASE64.encode([1u8; 4])).is_err());

        let sealed = c.encrypt(&ApiKey::new("sk-test-123")).unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(c.decrypt(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = cipher().encrypt(&ApiKey::new("sk-test-123")).unwrap();
        let other = KeyCipher::from_key_bytes(&[9u8; 32]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let key = ApiKey::new("sk-very-secret");
        assert_eq!(format!("{key:?}"), "ApiKey(****)");
    }

    #[test]
    fn key_must_be_32_bytes() {
        assert!(KeyCipher::from_key_bytes(&[1u8; 16]).is_err());
    }
}
