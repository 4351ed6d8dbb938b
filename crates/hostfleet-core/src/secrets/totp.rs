// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-based one-time passwords (RFC 6238, SHA-1, 6 digits, 30 s step).

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::cipher::{ConfigCipher, KEY_LEN};
use crate::error::{Error, Result};

pub const STEP_SECS: i64 = 30;
pub const DIGITS: u32 = 6;
pub const SECRET_LEN: usize = 20;

const LEGACY_KEY_SEED: &[u8] = b"xiaoheiplay-totp-v1";
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 without padding.
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Case-insensitive; ignores `=`, spaces and dashes.
pub fn base32_decode(encoded: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in encoded.chars() {
        if matches!(c, '=' | ' ' | '-') {
            continue;
        }
        let upper = c.to_ascii_uppercase() as u8;
        let value = ALPHABET
            .iter()
            .position(|&a| a == upper)
            .ok_or_else(|| Error::invalid("invalid base32 secret"))?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Ok(out)
}

/// Fresh 20-byte secret, base32 encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base32_encode(&bytes)
}

fn hotp(key: &[u8], counter: u64) -> Result<String> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
        .map_err(|_| Error::invalid("invalid TOTP key"))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(DIGITS);
    Ok(format!("{:0width$}", code, width = DIGITS as usize))
}

/// Code for the step containing `unix_secs`.
pub fn code_at(secret: &str, unix_secs: i64) -> Result<String> {
    let key = base32_decode(secret)?;
    if key.is_empty() {
        return Err(Error::invalid("empty TOTP secret"));
    }
    hotp(&key, (unix_secs.max(0) / STEP_SECS) as u64)
}

/// Accepts the current step and one step either side.
pub fn verify(secret: &str, code: &str, now_unix: i64) -> Result<bool> {
    let code = code.trim();
    if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }
    for delta in [-1, 0, 1] {
        if code_at(secret, now_unix + delta * STEP_SECS)? == code {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `otpauth://totp/` provisioning URI for authenticator apps.
pub fn otpauth_uri(issuer: &str, account: &str, secret: &str) -> String {
    let label = format!("{issuer}:{account}");
    format!(
        "otpauth://totp/{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        urlencoding::encode(&label),
        secret,
        urlencoding::encode(issuer),
        DIGITS,
        STEP_SECS
    )
}

/// Encrypts TOTP secrets at rest.
#[derive(Clone, Debug)]
pub struct TotpVault {
    cipher: ConfigCipher,
}

impl TotpVault {
    pub fn new(cipher: ConfigCipher) -> Self {
        Self { cipher }
    }

    /// Vault keyed with the historical fixed key, for data written before a
    /// TOTP key was configured.
    pub fn legacy() -> Self {
        let digest = Sha256::digest(LEGACY_KEY_SEED);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Self::new(ConfigCipher::new(key))
    }

    pub fn seal(&self, secret: &str) -> Result<String> {
        self.cipher.encrypt_string(secret)
    }

    /// Accepts the base64 envelope written by [`seal`](Self::seal) and the
    /// older `{"n":"<base32 nonce>","c":"<base32 ciphertext>"}` form.
    pub fn open(&self, sealed: &str) -> Result<String> {
        let trimmed = sealed.trim();
        if !trimmed.starts_with('{') {
            return self.cipher.decrypt_string(trimmed);
        }
        let legacy: LegacyEnvelope = serde_json::from_str(trimmed)
            .map_err(|_| Error::invalid("malformed TOTP envelope"))?;
        let mut envelope = base32_decode(&legacy.n)?;
        envelope.extend(base32_decode(&legacy.c)?);
        String::from_utf8(self.cipher.decrypt(&envelope)?)
            .map_err(|_| Error::invalid("plaintext is not UTF-8"))
    }
}

#[derive(Deserialize)]
struct LegacyEnvelope {
    n: String,
    c: String,
}
