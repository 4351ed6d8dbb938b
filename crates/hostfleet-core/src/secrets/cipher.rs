// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AES-256-GCM envelope.
//!
//! Format: `nonce (12 bytes) || ciphertext || tag`, base64 (standard) when
//! stored as text.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};

use crate::error::{Error, Result};

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// Encrypts plugin configs and TOTP secrets under a 32-byte key.
#[derive(Clone)]
pub struct ConfigCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for ConfigCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConfigCipher(..)")
    }
}

impl ConfigCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Parse a base64-url (padded or not) or standard base64 key of 32 bytes.
    pub fn from_base64url(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| URL_SAFE.decode(encoded))
            .or_else(|_| STANDARD.decode(encoded))
            .map_err(|_| Error::invalid("master key is not valid base64"))?;
        if bytes.len() != KEY_LEN {
            return Err(Error::invalid(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::Internal("invalid cipher key".into()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Internal("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < NONCE_LEN {
            return Err(Error::invalid("ciphertext too short"));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::Internal("invalid cipher key".into()))?;
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::invalid("decryption failed"))
    }

    /// Encrypt to base64 text. Empty input stays empty.
    pub fn encrypt_string(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        Ok(STANDARD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Decrypt base64 text. Empty input stays empty.
    pub fn decrypt_string(&self, encoded: &str) -> Result<String> {
        if encoded.trim().is_empty() {
            return Ok(String::new());
        }
        let envelope = STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::invalid("ciphertext is not valid base64"))?;
        String::from_utf8(self.decrypt(&envelope)?)
            .map_err(|_| Error::invalid("plaintext is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ConfigCipher {
        ConfigCipher::new([7u8; KEY_LEN])
    }

    #[test]
    fn test_round_trip_and_nonce_prefix() {
        let c = cipher();
        let envelope = c.encrypt(br#"{"app_id":"x"}"#).unwrap();
        assert!(envelope.len() > NONCE_LEN + 16);
        assert_eq!(c.decrypt(&envelope).unwrap(), br#"{"app_id":"x"}"#);
        // Fresh nonce per call
        assert_ne!(envelope, c.encrypt(br#"{"app_id":"x"}"#).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = cipher().encrypt(b"secret").unwrap();
        let other = ConfigCipher::new([8u8; KEY_LEN]);
        assert!(matches!(other.decrypt(&envelope), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_from_base64url_checks_length() {
        let key = URL_SAFE_NO_PAD.encode([1u8; KEY_LEN]);
        assert!(ConfigCipher::from_base64url(&key).is_ok());
        let short = URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert!(ConfigCipher::from_base64url(&short).is_err());
        assert!(ConfigCipher::from_base64url("not base64 !!").is_err());
    }

    #[test]
    fn test_string_helpers_keep_empty() {
        let c = cipher();
        assert_eq!(c.encrypt_string("").unwrap(), "");
        assert_eq!(c.decrypt_string("").unwrap(), "");
        let enc = c.encrypt_string("hello").unwrap();
        assert_eq!(c.decrypt_string(&enc).unwrap(), "hello");
    }
}
