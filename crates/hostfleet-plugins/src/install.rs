// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin archive installation.
//!
//! A zip archive is unpacked into a temp dir, its manifest and signature are
//! checked there, and the tree is copied to
//! `<plugins_dir>/<category>/.staging-<uuid>` before being renamed into
//! `<plugins_dir>/<category>/<plugin_id>`. A half-copied plugin is never
//! visible under its final name.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use hostfleet_core::domain::{PluginCategory, SignatureStatus};
use hostfleet_protocol::PluginManifest;
use tracing::{info, warn};

use crate::error::{PluginError, Result};
use crate::signature::{MANIFEST_FILE, OfficialKeys, verify_dir};

/// Outcome of a successful install.
#[derive(Debug, Clone)]
pub struct InstalledPlugin {
    pub manifest: PluginManifest,
    pub manifest_json: String,
    pub dir: PathBuf,
    pub signature_status: SignatureStatus,
}

/// Trust policy applied to uploaded archives.
#[derive(Debug, Clone, Default)]
pub struct InstallPolicy {
    pub official_keys: OfficialKeys,
    /// Accept archives without `manifest.sig`.
    pub allow_unsigned: bool,
}

/// Split an archive entry name into normal components, rejecting absolute
/// paths and traversal.
fn entry_components(name: &str) -> Result<Vec<String>> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || normalized.contains(':') {
        return Err(PluginError::Archive(format!("absolute path in archive: {name}")));
    }
    let mut out = Vec::new();
    for comp in Path::new(&normalized).components() {
        match comp {
            Component::Normal(seg) => out.push(seg.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(PluginError::Archive(format!("unsafe path in archive: {name}")));
            }
        }
    }
    Ok(out)
}

/// Find the single manifest and return the archive prefix that holds it.
fn locate_manifest(names: &[Vec<String>], category: PluginCategory) -> Result<Vec<String>> {
    let manifests: Vec<&Vec<String>> = names
        .iter()
        .filter(|c| c.last().map(String::as_str) == Some(MANIFEST_FILE))
        .collect();
    let [path] = manifests.as_slice() else {
        return Err(PluginError::Archive(format!(
            "expected exactly one {MANIFEST_FILE}, found {}",
            manifests.len()
        )));
    };
    let prefix = path[..path.len() - 1].to_vec();
    let category_in_path = match prefix.len() {
        0 | 1 => None,
        2 => Some(prefix[0].as_str()),
        3 if prefix[0] == "plugins" => Some(prefix[1].as_str()),
        _ => {
            return Err(PluginError::Archive(format!(
                "{MANIFEST_FILE} at unexpected location {}",
                path.join("/")
            )));
        }
    };
    if let Some(found) = category_in_path
        && found != category.as_str()
    {
        return Err(PluginError::Archive(format!(
            "archive is for category {found}, expected {category}"
        )));
    }
    Ok(prefix)
}

/// Unpack entries under `prefix` into `dest`.
fn extract(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, prefix: &[String], dest: &Path) -> Result<()> {
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let comps = entry_components(file.name())?;
        if comps.len() <= prefix.len() || comps[..prefix.len()] != *prefix {
            continue;
        }
        let out = comps[prefix.len()..]
            .iter()
            .fold(dest.to_path_buf(), |p, seg| p.join(seg));
        if file.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        fs::write(&out, &buf)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = file.unix_mode().unwrap_or(0o644) | 0o600;
            let is_bin = comps.get(prefix.len()).map(String::as_str) == Some("bin")
                || comps.last().map(String::as_str) == Some("plugin");
            let mode = if is_bin { (mode | 0o755) & 0o777 } else { mode & 0o777 };
            fs::set_permissions(&out, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let meta = fs::symlink_metadata(entry.path())?;
        if meta.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if meta.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Install a zip archive for `category`. Blocking; run it off the runtime.
pub fn install_archive(
    plugins_dir: &Path,
    category: PluginCategory,
    archive_bytes: &[u8],
    policy: &InstallPolicy,
) -> Result<InstalledPlugin> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        names.push(entry_components(file.name())?);
    }
    let prefix = locate_manifest(&names, category)?;

    let staging = tempfile::TempDir::new()?;
    extract(&mut archive, &prefix, staging.path())?;

    let manifest_json = fs::read_to_string(staging.path().join(MANIFEST_FILE))?;
    let manifest = PluginManifest::from_json(manifest_json.as_bytes())?;
    if let Some(dir_id) = prefix.last()
        && *dir_id != manifest.plugin_id
    {
        return Err(PluginError::Archive(format!(
            "archive directory {dir_id} does not match plugin_id {}",
            manifest.plugin_id
        )));
    }

    let signature_status = verify_dir(staging.path(), &policy.official_keys)?;
    if signature_status == SignatureStatus::Untrusted && !policy.allow_unsigned {
        return Err(PluginError::Signature(
            "unsigned plugins are not allowed".to_string(),
        ));
    }

    let category_dir = plugins_dir.join(category.as_str());
    let target = category_dir.join(&manifest.plugin_id);
    if target.exists() {
        return Err(PluginError::AlreadyInstalled(format!(
            "{category}/{}",
            manifest.plugin_id
        )));
    }
    fs::create_dir_all(&category_dir)?;
    let swap = category_dir.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    if let Err(e) = copy_tree(staging.path(), &swap).and_then(|_| Ok(fs::rename(&swap, &target)?)) {
        if let Err(cleanup) = fs::remove_dir_all(&swap) {
            warn!(path = %swap.display(), error = %cleanup, "Failed to remove staging directory");
        }
        return Err(e);
    }

    info!(
        category = %category,
        plugin_id = %manifest.plugin_id,
        version = %manifest.version,
        signature = %signature_status,
        "Plugin installed"
    );
    Ok(InstalledPlugin {
        manifest,
        manifest_json,
        dir: target,
        signature_status,
    })
}
