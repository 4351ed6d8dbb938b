// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payment methods backed by payment plugin instances.
//!
//! Each payment instance contributes the methods listed in its manifest.
//! When several instances declare the same method, the first enabled one
//! (ordered by plugin id, then instance id) owns it; a disabled instance
//! owns a method only when no enabled instance declares it. A stored
//! override can switch a single method off without touching the instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hostfleet_core::domain::{InstanceKey, PaymentMethodOverride, PluginCategory, PluginInstallation};
use hostfleet_core::payment::{METHOD_BALANCE, PaymentProvider, PaymentProviderRegistry, ProviderInfo};
use hostfleet_core::{Error, Result};
use hostfleet_protocol::PluginManifest;
use tracing::{debug, info, warn};

use crate::clients::PaymentPluginProvider;
use crate::host::PluginHost;

/// The instance owning a payment method.
#[derive(Debug, Clone)]
struct MethodOwner {
    key: InstanceKey,
    name: String,
    instance_enabled: bool,
    /// Instance enabled and the method not switched off.
    enabled: bool,
}

pub struct PluginPaymentRegistry {
    host: Arc<PluginHost>,
}

impl PluginPaymentRegistry {
    pub fn new(host: Arc<PluginHost>) -> Self {
        Self { host }
    }

    async fn owners(&self) -> Result<BTreeMap<String, MethodOwner>> {
        let mut rows: Vec<PluginInstallation> = self
            .host
            .installations()
            .list_installations()
            .await?
            .into_iter()
            .filter(|i| i.category == PluginCategory::Payment)
            .collect();
        rows.sort_by(|a, b| {
            (a.plugin_id.as_str(), a.instance_id.as_str())
                .cmp(&(b.plugin_id.as_str(), b.instance_id.as_str()))
        });

        let mut owners: BTreeMap<String, MethodOwner> = BTreeMap::new();
        for inst in rows {
            let manifest = match PluginManifest::from_json(inst.manifest_json.as_bytes()) {
                Ok(m) => m,
                Err(e) => {
                    warn!(plugin = %inst.key(), error = %e, "Skipping payment plugin with invalid manifest");
                    continue;
                }
            };
            let key = inst.key();
            let disabled_methods: Vec<String> = self
                .host
                .payment_method_overrides()
                .list_payment_method_overrides(&key)
                .await?
                .into_iter()
                .filter(|o| !o.enabled)
                .map(|o| o.method)
                .collect();

            for method in manifest.capabilities.payment_methods() {
                let method = method.trim();
                if method.is_empty() || method.contains('.') || method == METHOD_BALANCE {
                    continue;
                }
                let candidate = MethodOwner {
                    key: key.clone(),
                    name: inst.name.clone(),
                    instance_enabled: inst.enabled,
                    enabled: inst.enabled && !disabled_methods.iter().any(|m| m == method),
                };
                let replace = owners
                    .get(method)
                    .is_none_or(|current| !current.instance_enabled && inst.enabled);
                if replace {
                    owners.insert(method.to_string(), candidate);
                }
            }
        }
        Ok(owners)
    }

    async fn owner(&self, method: &str) -> Result<MethodOwner> {
        self.owners()
            .await?
            .remove(method)
            .ok_or_else(|| Error::not_found(format!("payment method {method}")))
    }

    async fn schema_json(&self, key: &InstanceKey) -> String {
        if !self.host.is_loaded(key) {
            return String::new();
        }
        match self.host.config_schema(key).await {
            Ok(schema) => schema.json_schema,
            Err(e) => {
                debug!(plugin = %key, error = %e, "Config schema unavailable");
                String::new()
            }
        }
    }
}

#[async_trait]
impl PaymentProviderRegistry for PluginPaymentRegistry {
    async fn list_providers(&self, include_disabled: bool) -> Result<Vec<ProviderInfo>> {
        let mut out = Vec::new();
        for (method, owner) in self.owners().await? {
            if !owner.enabled && !include_disabled {
                continue;
            }
            let schema_json = self.schema_json(&owner.key).await;
            out.push(ProviderInfo {
                key: method,
                name: owner.name,
                enabled: owner.enabled,
                plugin_id: owner.key.plugin_id.clone(),
                instance_id: owner.key.instance_id.clone(),
                schema_json,
            });
        }
        Ok(out)
    }

    async fn get_provider(&self, key: &str) -> Result<Arc<dyn PaymentProvider>> {
        let owner = self.owner(key).await?;
        if !owner.enabled {
            return Err(Error::forbidden(format!("payment method {key} is disabled")));
        }
        let running = self.host.running(&owner.key).ok_or_else(|| {
            Error::Unavailable(format!("{} unavailable: plugin not loaded", owner.key))
        })?;
        let schema_json = self.schema_json(&owner.key).await;
        Ok(Arc::new(PaymentPluginProvider::new(
            self.host.clone(),
            running.key.clone(),
            key,
            owner.name,
            schema_json,
        )))
    }

    async fn get_provider_config(&self, key: &str) -> Result<(String, bool)> {
        let owner = self.owner(key).await?;
        let config = self.host.get_config_plain(&owner.key).await?;
        Ok((config, owner.enabled))
    }

    async fn update_provider_config(&self, key: &str, enabled: bool, config_json: &str) -> Result<()> {
        let owner = self.owner(key).await?;
        if !config_json.trim().is_empty() {
            self.host.update_config(&owner.key, config_json).await?;
        }
        self.host
            .payment_method_overrides()
            .upsert_payment_method_override(&PaymentMethodOverride {
                category: owner.key.category,
                plugin_id: owner.key.plugin_id.clone(),
                instance_id: owner.key.instance_id.clone(),
                method: key.to_string(),
                enabled,
            })
            .await?;
        info!(method = key, plugin = %owner.key, enabled, "Payment method updated");
        Ok(())
    }
}
