// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator-facing plugin management: install, instances, enable/disable
//! and config.

use std::sync::Arc;

use chrono::Utc;
use hostfleet_core::domain::{
    DEFAULT_INSTANCE_ID, InstanceKey, PluginCategory, PluginHealth, PluginInstallation,
    SignatureStatus,
};
use hostfleet_core::secrets::totp::base32_encode;
use hostfleet_core::{Error, Result};
use hostfleet_protocol::messages::{Ack, ConfigRequest, ConfigSchema};
use hostfleet_protocol::{PluginManifest, Service, methods};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::PluginHost;
use super::config::{
    INVALID_PLUGIN_CONFIG, MISSING_REQUIRED_CONFIG, fields_from_message, merge_secrets,
    missing_required, redact, secret_paths,
};
use crate::connection::PluginConnection;
use crate::entry::{EntryInfo, resolve_entry};
use crate::error::PluginError;
use crate::install::install_archive;

const AUTOMATION_CONFIG_SCHEMA: &str = r#"{"type":"object","properties":{"base_url":{"type":"string","title":"Base URL"},"api_key":{"type":"string","title":"API Key","format":"password"},"timeout_sec":{"type":"integer","title":"Timeout (sec)","minimum":1},"retry":{"type":"integer","title":"Retry","minimum":0},"dry_run":{"type":"boolean","title":"Dry Run"}}}"#;

/// An installation row with its runtime view.
#[derive(Debug, Clone, Serialize)]
pub struct PluginListing {
    #[serde(flatten)]
    pub installation: PluginInstallation,
    /// A process is currently serving this instance.
    pub running: bool,
    pub entry: Option<EntryInfo>,
}

pub(super) fn new_installation(
    category: PluginCategory,
    instance_id: &str,
    manifest: &PluginManifest,
    manifest_json: &str,
    signature_status: SignatureStatus,
) -> PluginInstallation {
    let now = Utc::now();
    PluginInstallation {
        category,
        plugin_id: manifest.plugin_id.clone(),
        instance_id: instance_id.to_string(),
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        enabled: false,
        loaded: false,
        manifest_json: manifest_json.to_string(),
        config_encrypted: String::new(),
        signature_status,
        health_status: PluginHealth::Unknown,
        health_message: String::new(),
        last_health_at: None,
        installed_at: now,
        updated_at: now,
    }
}

/// `<category>-<plugin_id>-<8 base32 chars>`.
fn generate_instance_id(category: PluginCategory, plugin_id: &str) -> String {
    let bytes: [u8; 5] = rand::random();
    format!(
        "{category}-{plugin_id}-{}",
        base32_encode(&bytes).to_ascii_lowercase()
    )
}

impl PluginHost {
    pub async fn list(&self) -> Result<Vec<PluginListing>> {
        let mut installs = self.installations().list_installations().await?;
        installs.sort_by_key(|i| i.key());
        Ok(installs
            .into_iter()
            .map(|inst| {
                let entry = PluginManifest::from_json(inst.manifest_json.as_bytes())
                    .ok()
                    .map(|m| resolve_entry(&self.plugin_dir(inst.category, &inst.plugin_id), &m));
                PluginListing {
                    running: self.is_loaded(&inst.key()),
                    entry,
                    installation: inst,
                }
            })
            .collect())
    }

    /// Install an uploaded zip and register its default instance, disabled.
    pub async fn install(&self, category: PluginCategory, archive: Vec<u8>) -> Result<PluginInstallation> {
        let plugins_dir = self.config.plugins_dir.clone();
        let policy = self.config.install_policy.clone();
        let installed = tokio::task::spawn_blocking(move || {
            install_archive(&plugins_dir, category, &archive, &policy)
        })
        .await
        .map_err(|e| Error::Internal(format!("install task failed: {e}")))?
        .map_err(Error::from)?;

        let inst = new_installation(
            category,
            DEFAULT_INSTANCE_ID,
            &installed.manifest,
            &installed.manifest_json,
            installed.signature_status,
        );
        self.installations().upsert_installation(&inst).await?;
        Ok(inst)
    }

    /// Remove a plugin's files. Its instances must be deleted first.
    pub async fn uninstall(&self, category: PluginCategory, plugin_id: &str) -> Result<()> {
        let instances = self
            .installations()
            .list_plugin_instances(category, plugin_id)
            .await?;
        if !instances.is_empty() {
            return Err(Error::conflict(format!(
                "{category}/{plugin_id} still has {} instance(s)",
                instances.len()
            )));
        }
        let dir = self.plugin_dir(category, plugin_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("plugin {category}/{plugin_id}")));
            }
            Err(e) => return Err(e.into()),
        }
        info!(category = %category, plugin_id, "Plugin uninstalled");
        Ok(())
    }

    /// Add a new, disabled instance of an installed plugin.
    pub async fn create_instance(&self, category: PluginCategory, plugin_id: &str) -> Result<PluginInstallation> {
        let existing = self
            .installations()
            .list_plugin_instances(category, plugin_id)
            .await?;
        let template = match existing.into_iter().next() {
            Some(t) => t,
            None => {
                let found = self
                    .discover_category(category)
                    .await
                    .into_iter()
                    .find(|p| p.plugin_id == plugin_id)
                    .ok_or_else(|| Error::not_found(format!("plugin {category}/{plugin_id}")))?;
                new_installation(
                    category,
                    DEFAULT_INSTANCE_ID,
                    &found.manifest,
                    &found.manifest_json,
                    found.signature_status,
                )
            }
        };
        let manifest = PluginManifest::from_json(template.manifest_json.as_bytes())
            .map_err(|e| PluginError::from(e).into_core(plugin_id))?;
        let instance_id = generate_instance_id(category, plugin_id);
        let inst = new_installation(
            category,
            &instance_id,
            &manifest,
            &template.manifest_json,
            template.signature_status,
        );
        self.installations().upsert_installation(&inst).await?;
        info!(plugin = %inst.key(), "Plugin instance created");
        Ok(inst)
    }

    pub async fn delete_instance(&self, key: &InstanceKey) -> Result<()> {
        self.installations().get_installation(key).await?;
        self.unload(key).await;
        self.installations().delete_installation(key).await?;
        self.reset_supervision(key);
        info!(plugin = %key, "Plugin instance deleted");
        Ok(())
    }

    /// Validate config (automation excepted), load, then mark enabled. On
    /// failure the instance stays disabled.
    pub async fn enable_instance(&self, key: &InstanceKey) -> Result<()> {
        let inst = self.installations().get_installation(key).await?;
        self.reset_supervision(key);
        if key.category != PluginCategory::Automation {
            let config = self.decrypt_config(&inst)?;
            self.validate_config(key, &config).await?;
        }
        self.load(key).await?;

        let mut inst = self.installations().get_installation(key).await?;
        inst.enabled = true;
        inst.loaded = true;
        inst.updated_at = Utc::now();
        self.installations().upsert_installation(&inst).await?;
        info!(plugin = %key, "Plugin instance enabled");
        Ok(())
    }

    pub async fn disable_instance(&self, key: &InstanceKey) -> Result<()> {
        let mut inst = self.installations().get_installation(key).await?;
        self.unload(key).await;
        inst.enabled = false;
        inst.loaded = false;
        inst.updated_at = Utc::now();
        self.installations().upsert_installation(&inst).await?;
        info!(plugin = %key, "Plugin instance disabled");
        Ok(())
    }

    /// Decrypted config as stored.
    pub async fn get_config_plain(&self, key: &InstanceKey) -> Result<String> {
        let inst = self.installations().get_installation(key).await?;
        self.decrypt_config(&inst)
    }

    /// Decrypted config with every secret field blanked.
    pub async fn get_config_redacted(&self, key: &InstanceKey) -> Result<String> {
        let plain = self.get_config_plain(key).await?;
        let mut value: Value = serde_json::from_str(&plain).unwrap_or_else(|_| json!({}));
        let schema = self.schema_value(key).await?;
        redact(&mut value, &secret_paths(&schema));
        Ok(value.to_string())
    }

    /// Store a new config. Blank secrets keep their stored value. A running
    /// instance gets `ReloadConfig`; if that fails the old config stays
    /// active and the instance is marked degraded.
    pub async fn update_config(&self, key: &InstanceKey, config_json: &str) -> Result<()> {
        let mut inst = self.installations().get_installation(key).await?;
        let mut new_value: Value = serde_json::from_str(config_json)
            .map_err(|e| Error::invalid(format!("config is not valid JSON: {e}")))?;
        if !new_value.is_object() {
            return Err(Error::invalid("config must be a JSON object"));
        }
        let old_value: Value =
            serde_json::from_str(&self.decrypt_config(&inst)?).unwrap_or_else(|_| json!({}));
        let schema = self.schema_value(key).await?;
        merge_secrets(&mut new_value, &old_value, &secret_paths(&schema));
        let merged = new_value.to_string();

        if inst.enabled && key.category != PluginCategory::Automation {
            self.validate_config(key, &merged).await?;
        }
        // Stored only once the running process accepted it, so a respawn
        // never picks up a rejected config.
        if self.is_loaded(key)
            && let Err(e) = self.reload_config(key, &merged).await
        {
            warn!(plugin = %key, error = %e, "Config reload failed, keeping previous config");
            self.persist_health(key, PluginHealth::Degraded, &format!("config reload failed: {e}"))
                .await;
            return Err(e);
        }

        inst.config_encrypted = self.encrypt_config(&merged)?;
        inst.updated_at = Utc::now();
        self.installations().upsert_installation(&inst).await?;
        info!(plugin = %key, "Plugin config updated");
        Ok(())
    }

    /// Config schema of `key`'s plugin. Asks the running process, or a
    /// short-lived one when the instance is not loaded.
    pub async fn config_schema(&self, key: &InstanceKey) -> Result<ConfigSchema> {
        if key.category == PluginCategory::Automation {
            return Ok(ConfigSchema {
                json_schema: AUTOMATION_CONFIG_SCHEMA.to_string(),
                ui_schema: "{}".to_string(),
            });
        }
        let (conn, temporary) = self.core_connection(key).await?;
        let result = conn
            .call::<_, ConfigSchema>(Service::Core, methods::GET_CONFIG_SCHEMA, &json!({}))
            .await;
        if temporary {
            conn.shutdown();
        }
        result.map_err(|e| e.into_core(&key.to_string()))
    }

    async fn schema_value(&self, key: &InstanceKey) -> Result<Value> {
        let schema = self.config_schema(key).await?;
        if schema.json_schema.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&schema.json_schema).map_err(|e| {
            Error::Unavailable(format!("{key} returned an invalid config schema: {e}"))
        })
    }

    /// Required fields from the schema, then the plugin's own check.
    pub async fn validate_config(&self, key: &InstanceKey, config_json: &str) -> Result<()> {
        let config: Value = serde_json::from_str(if config_json.trim().is_empty() {
            "{}"
        } else {
            config_json
        })
        .unwrap_or_else(|_| json!({}));
        let schema = self.schema_value(key).await?;
        let missing = missing_required(&schema, &config);
        if !missing.is_empty() {
            return Err(Error::ConfigValidation {
                code: MISSING_REQUIRED_CONFIG.to_string(),
                missing_fields: missing,
            });
        }

        let (conn, temporary) = self.core_connection(key).await?;
        let result = conn
            .call::<_, Ack>(
                Service::Core,
                methods::VALIDATE_CONFIG,
                &ConfigRequest {
                    config_json: config_json.to_string(),
                },
            )
            .await;
        if temporary {
            conn.shutdown();
        }
        let ack = result.map_err(|e| e.into_core(&key.to_string()))?;
        if ack.ok {
            return Ok(());
        }
        let message = ack.error.unwrap_or_else(|| "invalid config".to_string());
        let missing_fields = fields_from_message(&message);
        let code = if missing_fields.is_empty() {
            INVALID_PLUGIN_CONFIG
        } else {
            MISSING_REQUIRED_CONFIG
        };
        warn!(plugin = %key, message = %message, "Plugin rejected config");
        Err(Error::ConfigValidation {
            code: code.to_string(),
            missing_fields,
        })
    }

    /// The running connection, or a freshly launched one the caller must
    /// shut down (`true`).
    async fn core_connection(&self, key: &InstanceKey) -> Result<(Arc<PluginConnection>, bool)> {
        if let Some(running) = self.running(key) {
            return Ok((running.conn.clone(), false));
        }
        let inst = self.installations().get_installation(key).await?;
        let label = key.to_string();
        let manifest = PluginManifest::from_json(inst.manifest_json.as_bytes())
            .map_err(|e| PluginError::from(e).into_core(&label))?;
        let conn = self
            .spawn_connection(key, &manifest)
            .await
            .map_err(|e| e.into_core(&label))?;
        Ok((conn, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_instance_id_shape() {
        let id = generate_instance_id(PluginCategory::Payment, "alipay");
        let suffix = id.strip_prefix("payment-alipay-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
        assert_ne!(id, generate_instance_id(PluginCategory::Payment, "alipay"));
    }

    #[test]
    fn test_builtin_automation_schema_has_secret_key() {
        let schema: Value = serde_json::from_str(AUTOMATION_CONFIG_SCHEMA).unwrap();
        assert_eq!(secret_paths(&schema), vec![vec!["api_key".to_string()]]);
    }
}
