// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The plugin host.
//!
//! [`PluginHost`] owns every running plugin process. Loading an instance
//! launches its executable, checks the handshake and `GetManifest` against
//! the installed manifest, then calls `Init` with the decrypted config. The
//! live connection is kept in a map keyed by [`InstanceKey`]; capability
//! clients look it up on every call so a respawned process is picked up
//! transparently.
//!
//! # Supervision
//!
//! - A watcher task per connection notices process exit, drops the
//!   connection from the map, marks health `error` and schedules a respawn
//!   with exponential backoff.
//! - Load failures are counted per instance; too many within the window
//!   stop respawning and clear `loaded` until the instance is re-enabled.
//! - [`PluginSupervisor`] polls `Health` on every loaded instance.

mod admin;
mod bootstrap;
pub mod config;
mod supervisor;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use hostfleet_core::domain::{InstanceKey, PluginCategory, PluginHealth, PluginInstallation};
use hostfleet_core::secrets::ConfigCipher;
use hostfleet_core::settings::SettingsReader;
use hostfleet_core::store::{PluginInstallationRepository, PluginPaymentMethodRepository};
use hostfleet_core::{Error, Result, Store};
use hostfleet_protocol::messages::{Ack, HealthState, HealthStatus, InitRequest};
use hostfleet_protocol::{PluginManifest, Service, methods};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::connection::PluginConnection;
use crate::entry;
use crate::error::PluginError;
use crate::install::InstallPolicy;
use crate::launcher::{LaunchSpec, Launcher};

pub use admin::PluginListing;
pub use supervisor::{PluginSupervisor, SupervisorConfig};

/// Configuration for the plugin host.
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    /// Root of `<category>/<plugin_id>` directories.
    pub plugins_dir: PathBuf,
    /// Default RPC deadline.
    pub rpc_timeout: Duration,
    pub handshake_timeout: Duration,
    /// A `Health` call slower than this marks the instance `error`.
    pub health_timeout: Duration,
    /// Consecutive failed checks tolerated before `error`.
    pub max_health_failures: u32,
    /// First respawn delay; doubled per attempt up to `backoff_max`.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Uptime after which the backoff starts over.
    pub stable_after: Duration,
    pub init_failure_limit: usize,
    pub init_failure_window: Duration,
    pub install_policy: InstallPolicy,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            rpc_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            max_health_failures: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            stable_after: Duration::from_secs(5 * 60),
            init_failure_limit: 5,
            init_failure_window: Duration::from_secs(10 * 60),
            install_policy: InstallPolicy::default(),
        }
    }
}

/// A loaded instance.
pub(crate) struct RunningPlugin {
    pub key: InstanceKey,
    pub manifest: PluginManifest,
    pub conn: Arc<PluginConnection>,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
struct Supervision {
    restarts: u32,
    init_failures: VecDeque<Instant>,
    health_failures: u32,
}

pub struct PluginHost {
    config: PluginHostConfig,
    installations: Arc<dyn PluginInstallationRepository>,
    payment_methods: Arc<dyn PluginPaymentMethodRepository>,
    settings: SettingsReader,
    cipher: Arc<ConfigCipher>,
    launcher: Arc<dyn Launcher>,
    running: RwLock<HashMap<InstanceKey, Arc<RunningPlugin>>>,
    /// Serializes `Init`/`ReloadConfig` (and load/unload) per instance.
    locks: DashMap<InstanceKey, Arc<tokio::sync::Mutex<()>>>,
    supervision: parking_lot::Mutex<HashMap<InstanceKey, Supervision>>,
    stopping: AtomicBool,
    shutdown: Arc<Notify>,
    this: Weak<PluginHost>,
}

impl PluginHost {
    pub fn new(
        config: PluginHostConfig,
        store: &Store,
        cipher: Arc<ConfigCipher>,
        launcher: Arc<dyn Launcher>,
    ) -> Arc<Self> {
        info!(
            plugins_dir = %config.plugins_dir.display(),
            launcher = launcher.kind(),
            official_keys = config.install_policy.official_keys.len(),
            allow_unsigned = config.install_policy.allow_unsigned,
            "Plugin host created"
        );
        Arc::new_cyclic(|this| Self {
            config,
            installations: store.plugins.clone(),
            payment_methods: store.payment_methods.clone(),
            settings: SettingsReader::new(store.settings.clone()),
            cipher,
            launcher,
            running: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
            supervision: parking_lot::Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &PluginHostConfig {
        &self.config
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.config.plugins_dir
    }

    pub(crate) fn installations(&self) -> &Arc<dyn PluginInstallationRepository> {
        &self.installations
    }

    pub(crate) fn payment_method_overrides(&self) -> &Arc<dyn PluginPaymentMethodRepository> {
        &self.payment_methods
    }

    pub(crate) fn settings(&self) -> &SettingsReader {
        &self.settings
    }

    fn plugin_dir(&self, category: PluginCategory, plugin_id: &str) -> PathBuf {
        self.config
            .plugins_dir
            .join(category.as_str())
            .join(plugin_id)
    }

    fn instance_lock(&self, key: &InstanceKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn is_loaded(&self, key: &InstanceKey) -> bool {
        self.running.read().contains_key(key)
    }

    /// Keys of every running instance.
    pub fn loaded_instances(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<_> = self.running.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn running(&self, key: &InstanceKey) -> Option<Arc<RunningPlugin>> {
        self.running.read().get(key).cloned()
    }

    /// The live connection of `key` for `service`. `Unavailable` when the
    /// instance is not loaded, `NotSupported` when it does not serve `service`.
    pub fn connection(&self, key: &InstanceKey, service: Service) -> Result<Arc<PluginConnection>> {
        let running = self
            .running(key)
            .ok_or_else(|| Error::Unavailable(format!("{key} unavailable: plugin not loaded")))?;
        if !running.conn.serves(service) {
            return Err(Error::NotSupported(format!(
                "{key} does not provide the {service} service"
            )));
        }
        Ok(running.conn.clone())
    }

    /// Call `method` on a loaded instance with the default deadline.
    pub async fn call<P, R>(&self, key: &InstanceKey, service: Service, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let conn = self.connection(key, service)?;
        conn.call(service, method, params)
            .await
            .map_err(|e| e.into_core(&key.to_string()))
    }

    fn decrypt_config(&self, inst: &PluginInstallation) -> Result<String> {
        if inst.config_encrypted.is_empty() {
            return Ok("{}".to_string());
        }
        self.cipher.decrypt_string(&inst.config_encrypted)
    }

    fn encrypt_config(&self, plaintext: &str) -> Result<String> {
        self.cipher.encrypt_string(plaintext)
    }

    /// Launch `key`'s executable and verify it is the plugin it claims to be.
    async fn spawn_connection(
        &self,
        key: &InstanceKey,
        manifest: &PluginManifest,
    ) -> std::result::Result<Arc<PluginConnection>, PluginError> {
        let plugin_dir = self.plugin_dir(key.category, &key.plugin_id);
        let entry_path = entry::entry_path(&plugin_dir, manifest)?;
        let spec = LaunchSpec {
            key: key.clone(),
            plugin_dir,
            entry_path,
            env: Vec::new(),
        };
        let process = self.launcher.launch(&spec).await?;
        let conn = PluginConnection::establish(
            key.to_string(),
            process,
            self.config.handshake_timeout,
            self.config.rpc_timeout,
        )
        .await?;
        if let Err(e) = verify_identity(&conn, manifest).await {
            conn.shutdown();
            return Err(e);
        }
        Ok(conn)
    }

    /// Load `key` unless it is already running.
    pub async fn ensure_loaded(&self, key: &InstanceKey) -> Result<()> {
        if self.is_loaded(key) {
            return Ok(());
        }
        self.load(key).await
    }

    /// (Re)start `key` and call `Init`. A running process is replaced.
    pub async fn load(&self, key: &InstanceKey) -> Result<()> {
        let lock = self.instance_lock(key);
        let _guard = lock.lock().await;
        match self.load_locked(key).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_init_failure(key);
                Err(e)
            }
        }
    }

    async fn load_locked(&self, key: &InstanceKey) -> Result<()> {
        let label = key.to_string();
        let inst = self.installations.get_installation(key).await?;
        let manifest = PluginManifest::from_json(inst.manifest_json.as_bytes())
            .map_err(|e| PluginError::from(e).into_core(&label))?;
        let config_json = self.decrypt_config(&inst)?;

        self.stop_running(key);
        let conn = self
            .spawn_connection(key, &manifest)
            .await
            .map_err(|e| e.into_core(&label))?;

        let init = InitRequest {
            instance_id: key.instance_id.clone(),
            config_json,
        };
        let ack: Ack = match conn.call(Service::Core, methods::INIT, &init).await {
            Ok(ack) => ack,
            Err(e) => {
                conn.shutdown();
                return Err(e.into_core(&label));
            }
        };
        if !ack.ok {
            conn.shutdown();
            let reason = ack.error.unwrap_or_else(|| "init rejected".to_string());
            return Err(Error::FailedPrecondition(format!("{label} init failed: {reason}")));
        }

        let running = Arc::new(RunningPlugin {
            key: key.clone(),
            manifest,
            conn,
            started_at: Instant::now(),
        });
        self.running.write().insert(key.clone(), running.clone());
        if let Some(s) = self.supervision.lock().get_mut(key) {
            s.health_failures = 0;
        }
        self.watch_exit(running.clone());

        let mut inst = inst;
        inst.loaded = true;
        inst.health_status = PluginHealth::Ok;
        inst.health_message = String::new();
        inst.last_health_at = Some(Utc::now());
        inst.updated_at = Utc::now();
        self.installations.upsert_installation(&inst).await?;

        info!(plugin = %key, pid = ?running.conn.pid(), version = %running.manifest.version, "Plugin instance loaded");
        Ok(())
    }

    /// Remove `key` from the running map and kill its process.
    fn stop_running(&self, key: &InstanceKey) -> bool {
        match self.running.write().remove(key) {
            Some(old) => {
                old.conn.shutdown();
                true
            }
            None => false,
        }
    }

    /// Stop `key`. Its exit is not treated as a crash.
    pub async fn unload(&self, key: &InstanceKey) {
        let lock = self.instance_lock(key);
        let _guard = lock.lock().await;
        if self.stop_running(key) {
            info!(plugin = %key, "Plugin instance unloaded");
        }
    }

    /// Push a new config to a running instance.
    pub(crate) async fn reload_config(&self, key: &InstanceKey, config_json: &str) -> Result<()> {
        let lock = self.instance_lock(key);
        let _guard = lock.lock().await;
        let ack: Ack = self
            .call(
                key,
                Service::Core,
                methods::RELOAD_CONFIG,
                &hostfleet_protocol::messages::ConfigRequest {
                    config_json: config_json.to_string(),
                },
            )
            .await?;
        if !ack.ok {
            let reason = ack.error.unwrap_or_else(|| "reload rejected".to_string());
            return Err(Error::FailedPrecondition(format!("{key} reload failed: {reason}")));
        }
        Ok(())
    }

    fn record_init_failure(&self, key: &InstanceKey) {
        let now = Instant::now();
        let mut sup = self.supervision.lock();
        let s = sup.entry(key.clone()).or_default();
        s.init_failures.push_back(now);
        while let Some(first) = s.init_failures.front() {
            if now.duration_since(*first) > self.config.init_failure_window {
                s.init_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn init_failures_exceeded(&self, key: &InstanceKey) -> bool {
        self.supervision
            .lock()
            .get(key)
            .is_some_and(|s| s.init_failures.len() > self.config.init_failure_limit)
    }

    /// Forget failure history, e.g. when an operator re-enables the instance.
    pub(crate) fn reset_supervision(&self, key: &InstanceKey) {
        self.supervision.lock().remove(key);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_max)
    }

    fn watch_exit(&self, running: Arc<RunningPlugin>) {
        let Some(host) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            running.conn.closed().await;
            host.on_exit(running).await;
        });
    }

    async fn on_exit(self: Arc<Self>, running: Arc<RunningPlugin>) {
        let current = {
            let mut map = self.running.write();
            match map.get(&running.key) {
                Some(cur) if Arc::ptr_eq(cur, &running) => {
                    map.remove(&running.key);
                    true
                }
                _ => false,
            }
        };
        if !current {
            debug!(plugin = %running.key, "Plugin process stopped by host");
            return;
        }
        let uptime = running.started_at.elapsed();
        warn!(plugin = %running.key, uptime_secs = uptime.as_secs(), "Plugin process exited unexpectedly");
        self.persist_health(&running.key, PluginHealth::Error, "plugin process exited")
            .await;
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        tokio::spawn(self.clone().respawn_loop(running.key.clone(), uptime));
    }

    async fn respawn_loop(self: Arc<Self>, key: InstanceKey, uptime: Duration) {
        let mut attempt = {
            let mut sup = self.supervision.lock();
            let s = sup.entry(key.clone()).or_default();
            if uptime >= self.config.stable_after {
                s.restarts = 0;
            }
            s.restarts
        };
        loop {
            let delay = self.backoff(attempt);
            debug!(plugin = %key, attempt, delay_ms = delay.as_millis() as u64, "Scheduling plugin respawn");
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.stopping.load(Ordering::SeqCst) || self.is_loaded(&key) {
                return;
            }
            match self.installations.get_installation(&key).await {
                Ok(inst) if inst.enabled && inst.loaded => {}
                Ok(_) => {
                    debug!(plugin = %key, "Instance disabled, not respawning");
                    return;
                }
                Err(e) => {
                    warn!(plugin = %key, error = %e, "Instance lookup failed, not respawning");
                    return;
                }
            }

            attempt += 1;
            if let Some(s) = self.supervision.lock().get_mut(&key) {
                s.restarts = attempt;
            }
            match self.load(&key).await {
                Ok(()) => {
                    info!(plugin = %key, attempt, "Plugin instance respawned");
                    return;
                }
                Err(e) if self.init_failures_exceeded(&key) => {
                    error!(plugin = %key, error = %e, "Plugin keeps failing to start, giving up until re-enabled");
                    self.mark_unloaded(&key, &e.to_string()).await;
                    return;
                }
                Err(e) => warn!(plugin = %key, attempt, error = %e, "Plugin respawn failed"),
            }
        }
    }

    async fn mark_unloaded(&self, key: &InstanceKey, message: &str) {
        match self.installations.get_installation(key).await {
            Ok(mut inst) => {
                inst.loaded = false;
                inst.health_status = PluginHealth::Error;
                inst.health_message = message.to_string();
                inst.last_health_at = Some(Utc::now());
                inst.updated_at = Utc::now();
                if let Err(e) = self.installations.upsert_installation(&inst).await {
                    warn!(plugin = %key, error = %e, "Failed to persist unloaded state");
                }
            }
            Err(e) => warn!(plugin = %key, error = %e, "Failed to load installation"),
        }
    }

    async fn persist_health(&self, key: &InstanceKey, status: PluginHealth, message: &str) {
        let mut inst = match self.installations.get_installation(key).await {
            Ok(inst) => inst,
            Err(e) => {
                warn!(plugin = %key, error = %e, "Failed to load installation for health update");
                return;
            }
        };
        inst.health_status = status;
        inst.health_message = message.to_string();
        inst.last_health_at = Some(Utc::now());
        inst.updated_at = Utc::now();
        if let Err(e) = self.installations.upsert_installation(&inst).await {
            warn!(plugin = %key, error = %e, "Failed to persist plugin health");
        }
    }

    /// Run one `Health` round over every loaded instance.
    pub async fn check_health(&self) {
        let running: Vec<Arc<RunningPlugin>> = self.running.read().values().cloned().collect();
        for plugin in running {
            let (status, message) = self.probe(&plugin).await;
            if status != PluginHealth::Ok {
                warn!(plugin = %plugin.key, status = %status, message = %message, "Plugin unhealthy");
            }
            self.persist_health(&plugin.key, status, &message).await;
        }
    }

    async fn probe(&self, plugin: &RunningPlugin) -> (PluginHealth, String) {
        let result = plugin
            .conn
            .call_with_timeout::<_, HealthStatus>(
                Service::Core,
                methods::HEALTH,
                &json!({}),
                self.config.health_timeout,
            )
            .await;
        let mut sup = self.supervision.lock();
        let s = sup.entry(plugin.key.clone()).or_default();
        match result {
            Ok(h) => match h.status {
                HealthState::Ok => {
                    s.health_failures = 0;
                    (PluginHealth::Ok, h.message)
                }
                HealthState::Degraded => (PluginHealth::Degraded, h.message),
                HealthState::Error => {
                    s.health_failures += 1;
                    (PluginHealth::Error, h.message)
                }
            },
            Err(PluginError::Timeout(t)) => {
                s.health_failures += 1;
                (PluginHealth::Error, format!("health check timed out after {t:?}"))
            }
            Err(e) => {
                s.health_failures += 1;
                let status = if s.health_failures > self.config.max_health_failures {
                    PluginHealth::Error
                } else {
                    PluginHealth::Degraded
                };
                (status, e.to_string())
            }
        }
    }

    /// Load every enabled instance. Failures are logged and left to the
    /// operator.
    pub async fn start_enabled(&self) -> Result<()> {
        let installs = self.installations.list_installations().await?;
        for inst in installs.into_iter().filter(|i| i.enabled) {
            let key = inst.key();
            if let Err(e) = self.load(&key).await {
                warn!(plugin = %key, error = %e, "Failed to load enabled plugin instance");
                self.persist_health(&key, PluginHealth::Error, &e.to_string())
                    .await;
            }
        }
        Ok(())
    }

    /// Stop respawning and kill every plugin process.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let drained: Vec<Arc<RunningPlugin>> = self.running.write().drain().map(|(_, r)| r).collect();
        for plugin in &drained {
            plugin.conn.shutdown();
        }
        info!(stopped = drained.len(), "Plugin host shut down");
    }
}

/// The process must serve every declared capability and report the manifest
/// it was installed with.
async fn verify_identity(
    conn: &PluginConnection,
    manifest: &PluginManifest,
) -> std::result::Result<(), PluginError> {
    for service in manifest.capabilities.services() {
        if !conn.serves(service) {
            return Err(PluginError::Handshake(format!(
                "plugin does not serve its declared {service} service"
            )));
        }
    }
    let reported: PluginManifest = conn
        .call(Service::Core, methods::GET_MANIFEST, &json!({}))
        .await?;
    if reported.plugin_id != manifest.plugin_id
        || reported.name != manifest.name
        || reported.version != manifest.version
    {
        return Err(PluginError::Manifest(format!(
            "plugin reports {} {} {}, installed manifest is {} {} {}",
            reported.plugin_id,
            reported.name,
            reported.version,
            manifest.plugin_id,
            manifest.name,
            manifest.version
        )));
    }
    Ok(())
}
