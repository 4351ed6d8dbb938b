// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use hostfleet_protocol::Service;
use serde::{Deserialize, Serialize};

/// Instance id used when a plugin has a single configuration.
pub const DEFAULT_INSTANCE_ID: &str = "default";

text_enum! {
    pub enum PluginCategory {
        Payment => "payment",
        Kyc => "kyc",
        Sms => "sms",
        Automation => "automation",
    }
}

impl PluginCategory {
    /// Capability service backing this category.
    pub fn service(&self) -> Service {
        match self {
            PluginCategory::Payment => Service::Payment,
            PluginCategory::Kyc => Service::Kyc,
            PluginCategory::Sms => Service::Sms,
            PluginCategory::Automation => Service::Automation,
        }
    }
}

text_enum! {
    pub enum SignatureStatus {
        Official => "official",
        Community => "community",
        Untrusted => "untrusted",
    }
}

text_enum! {
    pub enum PluginHealth {
        Unknown => "unknown",
        Ok => "ok",
        Degraded => "degraded",
        Error => "error",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PluginInstallation {
    pub category: PluginCategory,
    pub plugin_id: String,
    pub instance_id: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub loaded: bool,
    pub manifest_json: String,
    /// base64(nonce || ciphertext) of the config JSON, empty when unset.
    pub config_encrypted: String,
    pub signature_status: SignatureStatus,
    pub health_status: PluginHealth,
    pub health_message: String,
    pub last_health_at: Option<DateTime<Utc>>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginInstallation {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.category, &self.plugin_id, &self.instance_id)
    }
}

/// `(category, plugin_id, instance_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub category: PluginCategory,
    pub plugin_id: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(category: PluginCategory, plugin_id: &str, instance_id: &str) -> Self {
        let instance_id = if instance_id.trim().is_empty() {
            DEFAULT_INSTANCE_ID
        } else {
            instance_id.trim()
        };
        Self {
            category,
            plugin_id: plugin_id.trim().to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.plugin_id, self.instance_id)
    }
}

impl PartialOrd for PluginCategory {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PluginCategory {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentMethodOverride {
    pub category: PluginCategory,
    pub plugin_id: String,
    pub instance_id: String,
    pub method: String,
    pub enabled: bool,
}
