// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hostfleet-server.

use std::path::PathBuf;
use std::time::Duration;

use hostfleet_core::secrets::{ConfigCipher, TotpVault};
use hostfleet_plugins::{InstallPolicy, OfficialKeys};

/// Selects the in-memory store instead of a database.
pub const MEMORY_DATABASE_URL: &str = "memory";

const DEFAULT_DATABASE_URL: &str = "sqlite:.data/hostfleet.db?mode=rwc";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL, or `memory`
    pub database_url: String,
    /// Root of the `<category>/<plugin_id>` plugin directories
    pub plugins_dir: PathBuf,
    /// Encrypts plugin instance configs at rest
    pub plugin_cipher: ConfigCipher,
    /// Encrypts TOTP secrets; the legacy fixed key when none is configured
    pub totp_vault: TotpVault,
    pub install_policy: InstallPolicy,
    /// Reload payment plugins when their directory changes
    pub watch_plugins: bool,
    pub scheduler_tick: Duration,
    pub health_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url =
            var("HOSTFLEET_DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let plugins_dir =
            PathBuf::from(var("HOSTFLEET_PLUGINS_DIR").unwrap_or_else(|| "plugins".to_string()));

        let master_key = var("HOSTFLEET_PLUGIN_MASTER_KEY")
            .ok_or(ConfigError::MissingEnvVar("HOSTFLEET_PLUGIN_MASTER_KEY"))?;
        let plugin_cipher = ConfigCipher::from_base64url(&master_key).map_err(|e| {
            ConfigError::InvalidValue {
                name: "HOSTFLEET_PLUGIN_MASTER_KEY",
                reason: e.to_string(),
            }
        })?;

        let totp_vault = match var("HOSTFLEET_TOTP_KEY") {
            Some(key) => TotpVault::new(ConfigCipher::from_base64url(&key).map_err(|e| {
                ConfigError::InvalidValue {
                    name: "HOSTFLEET_TOTP_KEY",
                    reason: e.to_string(),
                }
            })?),
            None => TotpVault::legacy(),
        };

        let install_policy = InstallPolicy {
            official_keys: OfficialKeys::parse(&var("HOSTFLEET_OFFICIAL_PUBKEYS").unwrap_or_default()),
            allow_unsigned: parse_flag(var("HOSTFLEET_ALLOW_UNSIGNED_PLUGINS"), false),
        };

        let watch_plugins = parse_flag(var("HOSTFLEET_WATCH_PLUGINS"), true);

        let scheduler_tick = parse_secs(&var, "HOSTFLEET_SCHEDULER_TICK_SECS", 10)?;
        let health_interval = parse_secs(&var, "HOSTFLEET_HEALTH_INTERVAL_SECS", 30)?;

        Ok(Self {
            database_url,
            plugins_dir,
            plugin_cipher,
            totp_vault,
            install_policy,
            watch_plugins,
            scheduler_tick,
            health_interval,
        })
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn parse_secs<F>(var: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = match var(name) {
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            name,
            reason: format!("expected whole seconds, got {raw:?}"),
        })?,
        None => default,
    };
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}
