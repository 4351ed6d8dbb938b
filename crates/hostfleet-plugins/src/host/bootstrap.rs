// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Importing plugins that are already on disk.

use std::collections::HashSet;

use chrono::Utc;
use hostfleet_core::domain::{
    DEFAULT_INSTANCE_ID, PluginCategory, PluginInstallation, SignatureStatus,
};
use hostfleet_core::settings::keys;
use hostfleet_core::{Error, Result};
use tracing::{info, warn};

use super::PluginHost;
use super::admin::new_installation;
use crate::disk::{self, DiscoveredPlugin};

impl PluginHost {
    /// Scan `<plugins_dir>/<category>`.
    pub async fn discover_category(&self, category: PluginCategory) -> Vec<DiscoveredPlugin> {
        let dir = self.config.plugins_dir.clone();
        let keys = self.config.install_policy.official_keys.clone();
        tokio::task::spawn_blocking(move || disk::discover_category(&dir, category, &keys))
            .await
            .unwrap_or_else(|e| {
                warn!(category = %category, error = %e, "Plugin discovery task failed");
                Vec::new()
            })
    }

    async fn discover_all(&self) -> Vec<DiscoveredPlugin> {
        let mut out = Vec::new();
        for category in PluginCategory::ALL {
            out.extend(self.discover_category(*category).await);
        }
        out
    }

    async fn imported_plugins(&self) -> Result<HashSet<(PluginCategory, String)>> {
        Ok(self
            .installations()
            .list_installations()
            .await?
            .into_iter()
            .map(|i| (i.category, i.plugin_id))
            .collect())
    }

    /// Plugins present on disk that have no installation row yet.
    pub async fn discover_on_disk(&self) -> Result<Vec<DiscoveredPlugin>> {
        let imported = self.imported_plugins().await?;
        Ok(self
            .discover_all()
            .await
            .into_iter()
            .filter(|p| !imported.contains(&(p.category, p.plugin_id.clone())))
            .collect())
    }

    /// Register the default instance of a plugin found on disk, disabled.
    pub async fn import_from_disk(&self, category: PluginCategory, plugin_id: &str) -> Result<PluginInstallation> {
        let found = self
            .discover_category(category)
            .await
            .into_iter()
            .find(|p| p.plugin_id == plugin_id)
            .ok_or_else(|| Error::not_found(format!("plugin {category}/{plugin_id} on disk")))?;
        if !self
            .installations()
            .list_plugin_instances(category, plugin_id)
            .await?
            .is_empty()
        {
            return Err(Error::conflict(format!("{category}/{plugin_id} is already imported")));
        }
        self.import(&found).await
    }

    async fn import(&self, found: &DiscoveredPlugin) -> Result<PluginInstallation> {
        let inst = new_installation(
            found.category,
            DEFAULT_INSTANCE_ID,
            &found.manifest,
            &found.manifest_json,
            found.signature_status,
        );
        self.installations().upsert_installation(&inst).await?;
        info!(
            plugin = %inst.key(),
            version = %inst.version,
            signature = %inst.signature_status,
            supported = found.entry.supported,
            "Plugin imported from disk"
        );
        Ok(inst)
    }

    /// Import on-disk plugins at startup. The first run imports everything;
    /// later runs only pick up new `official` plugins. Returns how many
    /// were imported.
    pub async fn bootstrap(&self) -> Result<usize> {
        let first_run = !self
            .settings()
            .get_bool(keys::PLUGINS_BOOTSTRAPPED, false)
            .await?;
        let mut imported = 0;
        for found in self.discover_on_disk().await? {
            if !first_run && found.signature_status != SignatureStatus::Official {
                continue;
            }
            match self.import(&found).await {
                Ok(_) => imported += 1,
                Err(e) => warn!(plugin_id = %found.plugin_id, error = %e, "Failed to import plugin"),
            }
        }
        if first_run {
            self.settings().set(keys::PLUGINS_BOOTSTRAPPED, "true").await?;
        }
        info!(first_run, imported, "Plugin bootstrap finished");
        Ok(imported)
    }

    /// Reconcile one category with the disk: import new plugins the install
    /// policy accepts and refresh the manifest of imported ones. Running
    /// instances whose version changed are restarted.
    pub async fn sync_from_disk(&self, category: PluginCategory) -> Result<usize> {
        let mut changed = 0;
        for found in self.discover_category(category).await {
            let rows = self
                .installations()
                .list_plugin_instances(category, &found.plugin_id)
                .await?;
            if rows.is_empty() {
                let trusted = found.signature_status == SignatureStatus::Official
                    || self.config.install_policy.allow_unsigned;
                if trusted {
                    self.import(&found).await?;
                    changed += 1;
                }
                continue;
            }
            for mut row in rows {
                if row.manifest_json == found.manifest_json
                    && row.signature_status == found.signature_status
                {
                    continue;
                }
                let version_changed = row.version != found.version;
                row.name = found.name.clone();
                row.version = found.version.clone();
                row.manifest_json = found.manifest_json.clone();
                row.signature_status = found.signature_status;
                row.updated_at = Utc::now();
                self.installations().upsert_installation(&row).await?;
                changed += 1;
                let key = row.key();
                info!(plugin = %key, version = %row.version, "Plugin manifest refreshed from disk");
                if version_changed
                    && self.is_loaded(&key)
                    && let Err(e) = self.load(&key).await
                {
                    warn!(plugin = %key, error = %e, "Failed to restart plugin after upgrade");
                }
            }
        }
        Ok(changed)
    }
}
