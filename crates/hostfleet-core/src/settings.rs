// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed access to runtime settings.
//!
//! Values are stored as strings. Booleans accept `true/false/1/0/yes/no/on/off`;
//! unparseable values fall back to the supplied default with a warning.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::Result;
use crate::store::SettingsRepository;

/// Keys read by the core.
pub mod keys {
    pub const REALNAME_ENABLED: &str = "realname_enabled";
    pub const REALNAME_PROVIDER: &str = "realname_provider";
    pub const REALNAME_BLOCK_ACTIONS: &str = "realname_block_actions";
    pub const EMERGENCY_RENEW_ENABLED: &str = "emergency_renew_enabled";
    pub const EMERGENCY_RENEW_WINDOW_DAYS: &str = "emergency_renew_window_days";
    pub const EMERGENCY_RENEW_DAYS: &str = "emergency_renew_days";
    pub const EMERGENCY_RENEW_INTERVAL_HOURS: &str = "emergency_renew_interval_hours";
    pub const AUTO_DELETE_ENABLED: &str = "auto_delete_enabled";
    pub const AUTO_DELETE_DAYS: &str = "auto_delete_days";
    pub const RESIZE_ENABLED: &str = "resize_enabled";
    pub const PROVISION_WATCHDOG_MAX_MINUTES: &str = "provision_watchdog_max_minutes";
    pub const EXPIRE_REMINDER_DAYS: &str = "expire_reminder_days";
    pub const ROBOT_WEBHOOKS: &str = "robot_webhooks";
    pub const ROBOT_WEBHOOK_URL: &str = "robot_webhook_url";
    pub const ROBOT_WEBHOOK_SECRET: &str = "robot_webhook_secret";
    pub const ROBOT_WEBHOOK_ENABLED: &str = "robot_webhook_enabled";
    pub const FCM_ENABLED: &str = "fcm_enabled";
    pub const FCM_PROJECT_ID: &str = "fcm_project_id";
    pub const FCM_SERVICE_ACCOUNT_JSON: &str = "fcm_service_account_json";
    pub const FCM_SERVER_KEY: &str = "fcm_server_key";
    pub const PAYMENT_PLUGIN_DIR: &str = "payment_plugin_dir";
    pub const PAYMENT_PLUGIN_UPLOAD_PASSWORD: &str = "payment_plugin_upload_password";
    pub const PLUGINS_BOOTSTRAPPED: &str = "plugins_bootstrapped";
    pub const SMS_PLUGIN_ID: &str = "sms_plugin_id";
    pub const SMS_INSTANCE_ID: &str = "sms_instance_id";
    pub const SITE_CURRENCY: &str = "site_currency";
}

/// Reads settings with typed defaults.
#[derive(Clone)]
pub struct SettingsReader {
    repo: Arc<dyn SettingsRepository>,
}

impl SettingsReader {
    pub fn new(repo: Arc<dyn SettingsRepository>) -> Self {
        Self { repo }
    }

    /// Raw value, `None` when unset or blank.
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .repo
            .get_setting(key)
            .await?
            .map(|s| s.value.trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    pub async fn get_string(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_raw(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(default);
        };
        match parse_bool(&raw) {
            Some(v) => Ok(v),
            None => {
                warn!(key, value = %raw, "setting is not a boolean, using default");
                Ok(default)
            }
        }
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(default);
        };
        match raw.parse::<i64>() {
            Ok(v) => Ok(v),
            Err(_) => {
                warn!(key, value = %raw, "setting is not an integer, using default");
                Ok(default)
            }
        }
    }

    /// JSON value, `None` when unset; a malformed value is logged and treated as unset.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(key, error = %e, "setting is not valid JSON, ignoring");
                Ok(None)
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.repo.upsert_setting(key, value).await
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn reader() -> SettingsReader {
        SettingsReader::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_defaults_when_unset_or_blank() {
        let s = reader();
        s.set("blank", "  ").await.unwrap();
        assert!(s.get_bool("missing", true).await.unwrap());
        assert_eq!(s.get_i64("blank", 7).await.unwrap(), 7);
        assert_eq!(s.get_string("missing", "idcard_cn").await.unwrap(), "idcard_cn");
    }

    #[tokio::test]
    async fn test_typed_parsing() {
        let s = reader();
        s.set("flag", "on").await.unwrap();
        s.set("days", "30").await.unwrap();
        s.set("bad", "thirty").await.unwrap();
        s.set("list", r#"["purchase_vps","renew"]"#).await.unwrap();
        assert!(s.get_bool("flag", false).await.unwrap());
        assert_eq!(s.get_i64("days", 0).await.unwrap(), 30);
        assert_eq!(s.get_i64("bad", 5).await.unwrap(), 5);
        let list: Vec<String> = s.get_json("list").await.unwrap().unwrap();
        assert_eq!(list, vec!["purchase_vps", "renew"]);
    }
}
