// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Discovery of installed plugins under `<plugins_dir>/<category>/<plugin_id>`.

use std::fs;
use std::path::{Path, PathBuf};

use hostfleet_core::domain::{PluginCategory, SignatureStatus};
use hostfleet_protocol::PluginManifest;
use tracing::{debug, warn};

use crate::entry::{EntryInfo, resolve_entry};
use crate::signature::{MANIFEST_FILE, OfficialKeys, verify_dir};

/// A plugin directory with a readable manifest.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub category: PluginCategory,
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub dir: PathBuf,
    pub manifest: PluginManifest,
    pub manifest_json: String,
    pub signature_status: SignatureStatus,
    pub entry: EntryInfo,
}

/// Scan every category directory. Unreadable plugins are skipped with a
/// warning so one broken package does not hide the rest.
pub fn discover(plugins_dir: &Path, keys: &OfficialKeys) -> Vec<DiscoveredPlugin> {
    let mut out = Vec::new();
    for category in PluginCategory::ALL {
        out.extend(discover_category(plugins_dir, *category, keys));
    }
    out
}

/// Scan one category directory, sorted by plugin id.
pub fn discover_category(
    plugins_dir: &Path,
    category: PluginCategory,
    keys: &OfficialKeys,
) -> Vec<DiscoveredPlugin> {
    let category_dir = plugins_dir.join(category.as_str());
    let entries = match fs::read_dir(&category_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(dir = %category_dir.display(), error = %e, "Failed to read plugin directory");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        match load_dir(category, &name, &entry.path(), keys) {
            Some(plugin) => out.push(plugin),
            None => continue,
        }
    }
    out.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
    out
}

fn load_dir(
    category: PluginCategory,
    dir_name: &str,
    dir: &Path,
    keys: &OfficialKeys,
) -> Option<DiscoveredPlugin> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest_json = match fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Skipping directory without manifest");
            return None;
        }
    };
    let manifest = match PluginManifest::from_json(manifest_json.as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Skipping plugin with invalid manifest");
            return None;
        }
    };
    if manifest.plugin_id != dir_name {
        warn!(
            dir = %dir.display(),
            plugin_id = %manifest.plugin_id,
            "Skipping plugin whose directory does not match its plugin_id"
        );
        return None;
    }
    let signature_status = match verify_dir(dir, keys) {
        Ok(status) => status,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Skipping plugin with unreadable signature");
            return None;
        }
    };
    let entry = resolve_entry(dir, &manifest);
    Some(DiscoveredPlugin {
        category,
        plugin_id: manifest.plugin_id.clone(),
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        dir: dir.to_path_buf(),
        manifest,
        manifest_json,
        signature_status,
        entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(root: &Path, category: &str, dir: &str, plugin_id: &str) {
        let path = root.join(category).join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join(MANIFEST_FILE),
            format!(
                r#"{{"plugin_id":"{plugin_id}","name":"{plugin_id}","version":"0.1.0",
                "capabilities":{{"sms":{{"send":true}}}}}}"#
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_discovers_valid_plugins_only() {
        let root = tempfile::TempDir::new().unwrap();
        write_plugin(root.path(), "sms", "beta", "beta");
        write_plugin(root.path(), "sms", "alpha", "alpha");
        write_plugin(root.path(), "sms", "renamed", "other");
        write_plugin(root.path(), "sms", ".staging-x", ".staging-x");
        fs::create_dir_all(root.path().join("sms/empty")).unwrap();

        let found = discover(root.path(), &OfficialKeys::default());
        let ids: Vec<_> = found.iter().map(|p| p.plugin_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
        assert!(found.iter().all(|p| p.category == PluginCategory::Sms));
        assert_eq!(found[0].signature_status, SignatureStatus::Untrusted);
        assert!(!found[0].entry.supported);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let root = tempfile::TempDir::new().unwrap();
        assert!(discover(&root.path().join("nope"), &OfficialKeys::default()).is_empty());
    }
}
