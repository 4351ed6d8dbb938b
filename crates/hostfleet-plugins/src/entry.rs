// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executable resolution for the running platform.

use std::path::{Path, PathBuf};

use hostfleet_protocol::PluginManifest;
use serde::Serialize;

use crate::error::{PluginError, Result};

/// Where a plugin's executable lives on this machine, as shown in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub platform: String,
    pub entry_path: String,
    pub supported: bool,
    pub supported_platforms: Vec<String>,
}

/// `<os>_<arch>` of the running process, e.g. `linux_amd64`.
pub fn current_platform() -> String {
    platform_key(std::env::consts::OS, std::env::consts::ARCH)
}

fn platform_key(os: &str, arch: &str) -> String {
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{os}_{arch}")
}

/// Resolve the entry for `platform`. Without a `binaries` table the root
/// `plugin` (or `plugin.exe`) is used.
pub fn resolve_entry_for(dir: &Path, manifest: &PluginManifest, platform: &str) -> EntryInfo {
    let supported_platforms: Vec<String> = manifest.binaries.keys().cloned().collect();
    if manifest.binaries.is_empty() {
        let name = if platform.starts_with("windows_") {
            "plugin.exe"
        } else {
            "plugin"
        };
        let path = dir.join(name);
        return EntryInfo {
            platform: platform.to_string(),
            supported: path.is_file(),
            entry_path: path.to_string_lossy().into_owned(),
            supported_platforms,
        };
    }
    match manifest.binaries.get(platform) {
        Some(rel) => {
            let path = dir.join(rel);
            EntryInfo {
                platform: platform.to_string(),
                supported: path.is_file(),
                entry_path: path.to_string_lossy().into_owned(),
                supported_platforms,
            }
        }
        None => EntryInfo {
            platform: platform.to_string(),
            entry_path: String::new(),
            supported: false,
            supported_platforms,
        },
    }
}

pub fn resolve_entry(dir: &Path, manifest: &PluginManifest) -> EntryInfo {
    resolve_entry_for(dir, manifest, &current_platform())
}

/// Executable path for launching, or an error naming the supported platforms.
pub fn entry_path(dir: &Path, manifest: &PluginManifest) -> Result<PathBuf> {
    let entry = resolve_entry(dir, manifest);
    if entry.supported {
        return Ok(PathBuf::from(entry.entry_path));
    }
    if entry.entry_path.is_empty() {
        return Err(PluginError::UnsupportedPlatform {
            platform: entry.platform,
            supported: entry.supported_platforms,
        });
    }
    Err(PluginError::Manifest(format!(
        "plugin executable {} not found",
        entry.entry_path
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn manifest(binaries: &[(&str, &str)]) -> PluginManifest {
        PluginManifest {
            plugin_id: "demo".into(),
            name: "Demo".into(),
            version: "1.0.0".into(),
            binaries: binaries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_platform_key_normalizes_arch() {
        assert_eq!(platform_key("linux", "x86_64"), "linux_amd64");
        assert_eq!(platform_key("macos", "aarch64"), "macos_arm64");
    }

    #[test]
    fn test_resolves_declared_binary() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bin/linux_amd64")).unwrap();
        std::fs::write(dir.path().join("bin/linux_amd64/plugin"), b"#!").unwrap();
        let m = manifest(&[
            ("linux_amd64", "bin/linux_amd64/plugin"),
            ("windows_amd64", "bin/windows_amd64/plugin.exe"),
        ]);

        let entry = resolve_entry_for(dir.path(), &m, "linux_amd64");
        assert!(entry.supported);
        assert!(entry.entry_path.ends_with("bin/linux_amd64/plugin"));

        let entry = resolve_entry_for(dir.path(), &m, "linux_arm64");
        assert!(!entry.supported);
        assert_eq!(entry.supported_platforms, vec!["linux_amd64", "windows_amd64"]);
    }

    #[test]
    fn test_falls_back_to_root_plugin() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("plugin"), b"#!").unwrap();
        let entry = resolve_entry_for(dir.path(), &manifest(&[]), "linux_amd64");
        assert!(entry.supported);
        assert!(entry.entry_path.ends_with("plugin"));

        let entry = resolve_entry_for(dir.path(), &manifest(&[]), "windows_amd64");
        assert!(!entry.supported);
        assert!(entry.entry_path.ends_with("plugin.exe"));
    }
}
