// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Detached Ed25519 signatures over a plugin directory.
//!
//! The signed payload is a digest document the host rebuilds from disk:
//!
//! ```text
//! {"algo":"sha256","files":{"bin/linux_amd64/plugin":"<hex>","manifest.json":"<hex>"}}
//! ```
//!
//! covering `manifest.json`, every regular file under `bin/`, a root
//! `plugin`/`plugin.exe` when present, and every binary the manifest declares
//! wherever it lives. `manifest.sig` holds the 64 signature bytes, raw or
//! base64.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{SIGNATURE_LENGTH, Signature, Verifier, VerifyingKey};
use hostfleet_core::domain::SignatureStatus;
use hostfleet_protocol::manifest::is_safe_relative_path;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{PluginError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SIGNATURE_FILE: &str = "manifest.sig";

/// Public keys whose signatures mark a plugin `official`.
#[derive(Debug, Clone, Default)]
pub struct OfficialKeys {
    keys: Vec<VerifyingKey>,
}

impl OfficialKeys {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Parse a comma-separated list of base64 public keys. Entries that do
    /// not decode to a valid key are skipped with a warning.
    pub fn parse(list: &str) -> Self {
        let mut keys = Vec::new();
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let decoded = STANDARD
                .decode(raw)
                .ok()
                .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
                .and_then(|b| VerifyingKey::from_bytes(&b).ok());
            match decoded {
                Some(key) => keys.push(key),
                None => warn!(key = raw, "Ignoring malformed official plugin key"),
            }
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn verifies(&self, payload: &[u8], signature: &Signature) -> bool {
        self.keys.iter().any(|k| k.verify(payload, signature).is_ok())
    }
}

#[derive(Serialize)]
struct DigestDocument {
    algo: &'static str,
    files: BTreeMap<String, String>,
}

/// Canonical digest document of the plugin at `dir`.
pub fn digest_document(dir: &Path) -> Result<Vec<u8>> {
    let mut files = BTreeMap::new();
    let manifest = dir.join(MANIFEST_FILE);
    if !manifest.is_file() {
        return Err(PluginError::Manifest(format!("{MANIFEST_FILE} not found")));
    }
    files.insert(MANIFEST_FILE.to_string(), sha256_file(&manifest)?);
    for root_bin in ["plugin", "plugin.exe"] {
        let path = dir.join(root_bin);
        if is_regular_file(&path) {
            files.insert(root_bin.to_string(), sha256_file(&path)?);
        }
    }
    let bin = dir.join("bin");
    if bin.is_dir() {
        collect_files(dir, &bin, &mut files)?;
    }
    for rel in declared_binaries(&fs::read(&manifest)?) {
        let path = dir.join(&rel);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => {
                files.insert(rel, sha256_file(&path)?);
            }
            Ok(_) => {
                return Err(PluginError::Manifest(format!(
                    "binary {rel} is not a regular file"
                )));
            }
            // Binaries for other platforms may be absent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(serde_json::to_vec(&DigestDocument {
        algo: "sha256",
        files,
    })?)
}

/// Safe relative paths listed under `binaries`. Read loosely so that a
/// manifest failing validation still digests.
fn declared_binaries(manifest: &[u8]) -> Vec<String> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(manifest) else {
        return Vec::new();
    };
    value
        .get("binaries")
        .and_then(|b| b.as_object())
        .map(|binaries| {
            binaries
                .values()
                .filter_map(|v| v.as_str())
                .map(|p| p.trim().to_string())
                .filter(|p| is_safe_relative_path(p))
                .collect()
        })
        .unwrap_or_default()
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            collect_files(root, &path, out)?;
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| PluginError::Manifest(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(rel, sha256_file(&path)?);
        }
    }
    Ok(())
}

fn is_regular_file(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Decode `manifest.sig`: 64 raw bytes, or their base64.
pub fn parse_signature(raw: &[u8]) -> Result<Signature> {
    if raw.len() == SIGNATURE_LENGTH {
        if let Ok(bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(raw) {
            return Ok(Signature::from_bytes(&bytes));
        }
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| PluginError::Signature("signature is neither raw nor base64".into()))?;
    let decoded = STANDARD
        .decode(text.trim())
        .map_err(|_| PluginError::Signature("signature is not valid base64".into()))?;
    let bytes = <[u8; SIGNATURE_LENGTH]>::try_from(decoded.as_slice()).map_err(|_| {
        PluginError::Signature(format!(
            "signature must be {SIGNATURE_LENGTH} bytes, got {}",
            decoded.len()
        ))
    })?;
    Ok(Signature::from_bytes(&bytes))
}

/// Classify the plugin at `dir`.
///
/// No `manifest.sig` is `untrusted`; a signature the keyring accepts is
/// `official`; any other well-formed signature is `community`. A malformed
/// signature file is an error.
pub fn verify_dir(dir: &Path, keys: &OfficialKeys) -> Result<SignatureStatus> {
    let sig_path = dir.join(SIGNATURE_FILE);
    let raw = match fs::read(&sig_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SignatureStatus::Untrusted);
        }
        Err(e) => return Err(e.into()),
    };
    let signature = parse_signature(&raw)?;
    let payload = digest_document(dir)?;
    if keys.verifies(&payload, &signature) {
        Ok(SignatureStatus::Official)
    } else {
        Ok(SignatureStatus::Community)
    }
}
