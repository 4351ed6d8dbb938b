// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin manifest (`manifest.json`) model and validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rpc::Service;

/// Errors found while validating a manifest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest field `{0}` is required")]
    MissingField(&'static str),

    #[error("invalid plugin_id `{0}`")]
    InvalidPluginId(String),

    #[error("invalid binary path for platform `{platform}`: {path}")]
    InvalidBinaryPath { platform: String, path: String },

    #[error("manifest declares no capabilities")]
    NoCapabilities,
}

/// The on-disk manifest of a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Platform key (`linux_amd64`, `windows_arm64`, ...) to relative executable path.
    #[serde(default)]
    pub binaries: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<SmsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyc: Option<KycCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<AutomationCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmsCapability {
    #[serde(default)]
    pub send: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentCapability {
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KycCapability {
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub query_result: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationCapability {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub not_supported_reasons: BTreeMap<String, String>,
}

/// Automation features a driver may declare.
pub const AUTOMATION_FEATURES: &[&str] = &[
    "catalog_sync",
    "lifecycle",
    "port_mapping",
    "backup",
    "snapshot",
    "firewall",
];

impl Capabilities {
    /// Capability services declared by this manifest, in a fixed order.
    pub fn services(&self) -> Vec<Service> {
        let mut out = Vec::new();
        if self.payment.is_some() {
            out.push(Service::Payment);
        }
        if self.kyc.is_some() {
            out.push(Service::Kyc);
        }
        if self.sms.is_some() {
            out.push(Service::Sms);
        }
        if self.automation.is_some() {
            out.push(Service::Automation);
        }
        out
    }

    pub fn declares(&self, service: Service) -> bool {
        service == Service::Core || self.services().contains(&service)
    }

    pub fn payment_methods(&self) -> &[String] {
        self.payment
            .as_ref()
            .map(|p| p.methods.as_slice())
            .unwrap_or(&[])
    }
}

impl PluginManifest {
    /// Parse and validate manifest JSON.
    pub fn from_json(raw: &[u8]) -> Result<Self, ManifestParseError> {
        let manifest: PluginManifest = serde_json::from_slice(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.plugin_id.trim().is_empty() {
            return Err(ManifestError::MissingField("plugin_id"));
        }
        if !is_valid_plugin_id(&self.plugin_id) {
            return Err(ManifestError::InvalidPluginId(self.plugin_id.clone()));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingField("name"));
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::MissingField("version"));
        }
        for (platform, path) in &self.binaries {
            if !is_safe_relative_path(path) {
                return Err(ManifestError::InvalidBinaryPath {
                    platform: platform.clone(),
                    path: path.clone(),
                });
            }
        }
        if self.capabilities.services().is_empty() {
            return Err(ManifestError::NoCapabilities);
        }
        Ok(())
    }
}

/// Errors from [`PluginManifest::from_json`].
#[derive(Debug, Error)]
pub enum ManifestParseError {
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] ManifestError),
}

/// Plugin ids are 1..=64 chars of `[a-z0-9_-]`.
pub fn is_valid_plugin_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Relative path without traversal, drive letters or absolute roots.
pub fn is_safe_relative_path(path: &str) -> bool {
    let path = path.trim();
    if path.is_empty() || path.starts_with('/') || path.contains(':') || path.contains('\\') {
        return false;
    }
    path.split('/').all(|seg| !seg.is_empty() && seg != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json() -> &'static str {
        r#"{
            "plugin_id": "mockpay",
            "name": "Mock Pay",
            "version": "1.0.0",
            "binaries": {"linux_amd64": "bin/linux_amd64/plugin"},
            "capabilities": {"payment": {"methods": ["mock_qr", "mock_h5"]}}
        }"#
    }

    #[test]
    fn test_parse_valid_manifest() {
        let m = PluginManifest::from_json(manifest_json().as_bytes()).unwrap();
        assert_eq!(m.plugin_id, "mockpay");
        assert_eq!(m.capabilities.payment_methods(), ["mock_qr", "mock_h5"]);
        assert_eq!(m.capabilities.services(), vec![Service::Payment]);
        assert!(m.capabilities.declares(Service::Core));
        assert!(!m.capabilities.declares(Service::Kyc));
    }

    #[test]
    fn test_rejects_traversal_in_binary_path() {
        let mut m = PluginManifest::from_json(manifest_json().as_bytes()).unwrap();
        m.binaries
            .insert("linux_arm64".into(), "bin/../../etc/passwd".into());
        assert!(matches!(
            m.validate(),
            Err(ManifestError::InvalidBinaryPath { .. })
        ));
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(is_safe_relative_path("bin/linux_amd64/plugin"));
        assert!(!is_safe_relative_path("/bin/plugin"));
        assert!(!is_safe_relative_path("C:/plugin.exe"));
        assert!(!is_safe_relative_path("bin\\plugin.exe"));
        assert!(!is_safe_relative_path("bin//plugin"));
    }

    #[test]
    fn test_plugin_id_rules() {
        assert!(is_valid_plugin_id("payment_ezpay"));
        assert!(is_valid_plugin_id("kyc-01"));
        assert!(!is_valid_plugin_id("Upper"));
        assert!(!is_valid_plugin_id("a/b"));
        assert!(!is_valid_plugin_id(&"x".repeat(65)));
    }

    #[test]
    fn test_manifest_without_capabilities_is_invalid() {
        let raw = br#"{"plugin_id":"x","name":"X","version":"1"}"#;
        let err = PluginManifest::from_json(raw).unwrap_err();
        assert!(matches!(
            err,
            ManifestParseError::Invalid(ManifestError::NoCapabilities)
        ));
    }
}
