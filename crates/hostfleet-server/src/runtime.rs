// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hostfleet.
//!
//! [`HostfleetRuntime`] owns the plugin host and the background loops that
//! keep the platform moving: the plugin health supervisor, the task
//! scheduler and the payment plugin watcher. The wired services are exposed
//! through [`Services`] so an API layer can be mounted on top.
//!
//! ```rust,ignore
//! use hostfleet_core::Store;
//! use hostfleet_core::secrets::ConfigCipher;
//! use hostfleet_server::runtime::HostfleetRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = HostfleetRuntime::builder()
//!         .store(Store::in_memory())
//!         .cipher(ConfigCipher::from_base64url("...")?)
//!         .plugins_dir("plugins")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let tasks = runtime.services().scheduler.list_tasks().await;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hostfleet_core::Store;
use hostfleet_core::events::{EventBus, FcmPushSink, RobotWebhookSink};
use hostfleet_core::kyc::KycService;
use hostfleet_core::orders::OrderService;
use hostfleet_core::payment::PaymentProviderRegistry;
use hostfleet_core::provisioning::ProvisioningEngine;
use hostfleet_core::retention::LogRetention;
use hostfleet_core::scheduler::{Scheduler, SchedulerConfig, TaskFuture, TaskHandler, task_keys};
use hostfleet_core::secrets::{ConfigCipher, PasswordResetService, TotpVault};
use hostfleet_core::settings::SettingsReader;
use hostfleet_core::sms::SmsSender;
use hostfleet_core::store::SqliteStore;
use hostfleet_core::tier::TierService;
use hostfleet_plugins::{
    InstallPolicy, Launcher, PaymentPluginWatcher, PluginAutomationResolver, PluginHost,
    PluginHostConfig, PluginKycRegistry, PluginPaymentRegistry, PluginSmsSender, PluginSupervisor,
    ProcessLauncher, SupervisorConfig, WatcherConfig,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, MEMORY_DATABASE_URL};

/// Rows handled per scheduled batch.
const TASK_BATCH_SIZE: i64 = 100;

/// Open the store named by a database URL, running migrations.
pub async fn open_store(database_url: &str) -> Result<Store> {
    if database_url == MEMORY_DATABASE_URL {
        warn!("Using the in-memory store; data is lost on exit");
        return Ok(Store::in_memory());
    }
    if let Some(parent) = sqlite_file(database_url).and_then(|p| p.parent().map(Path::to_path_buf))
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(&parent)?;
    }
    let backend = SqliteStore::connect(database_url, 5).await?;
    Ok(Store::new(Arc::new(backend)))
}

/// Database file behind a `sqlite:` URL, if it names one.
fn sqlite_file(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("sqlite:")?;
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Builder for creating a [`HostfleetRuntime`].
pub struct HostfleetRuntimeBuilder {
    store: Option<Store>,
    cipher: Option<ConfigCipher>,
    totp_vault: Option<TotpVault>,
    launcher: Option<Arc<dyn Launcher>>,
    host_config: PluginHostConfig,
    supervisor_config: SupervisorConfig,
    scheduler_config: SchedulerConfig,
    watcher_config: WatcherConfig,
    watch_plugins: bool,
    run_scheduler: bool,
}

impl Default for HostfleetRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            cipher: None,
            totp_vault: None,
            launcher: None,
            host_config: PluginHostConfig::default(),
            supervisor_config: SupervisorConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            watcher_config: WatcherConfig::default(),
            watch_plugins: true,
            run_scheduler: true,
        }
    }
}

impl HostfleetRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply everything [`Config`] carries except the store.
    pub fn config(self, config: &Config) -> Self {
        self.cipher(config.plugin_cipher.clone())
            .totp_vault(config.totp_vault.clone())
            .plugins_dir(config.plugins_dir.clone())
            .install_policy(config.install_policy.clone())
            .watch_plugins(config.watch_plugins)
            .scheduler_tick(config.scheduler_tick)
            .health_interval(config.health_interval)
    }

    /// Set the store (required).
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cipher for plugin instance configs (required).
    pub fn cipher(mut self, cipher: ConfigCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Default: the legacy fixed-key vault.
    pub fn totp_vault(mut self, vault: TotpVault) -> Self {
        self.totp_vault = Some(vault);
        self
    }

    /// Default: [`ProcessLauncher`].
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Replace the whole plugin host configuration.
    pub fn host_config(mut self, config: PluginHostConfig) -> Self {
        self.host_config = config;
        self
    }

    /// Default: `plugins`
    pub fn plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.host_config.plugins_dir = dir.into();
        self
    }

    pub fn install_policy(mut self, policy: InstallPolicy) -> Self {
        self.host_config.install_policy = policy;
        self
    }

    /// Set how often loaded plugins are health-checked.
    ///
    /// Default: 30 seconds
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.supervisor_config.poll_interval = interval;
        self
    }

    /// Default: 10 seconds
    pub fn scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_config.tick = tick;
        self
    }

    /// Watch the payment plugin directory for changes.
    ///
    /// Default: `true`
    pub fn watch_plugins(mut self, watch: bool) -> Self {
        self.watch_plugins = watch;
        self
    }

    /// Run the scheduler loop. When off, tasks only run through
    /// [`Scheduler::run_now`].
    ///
    /// Default: `true`
    pub fn run_scheduler(mut self, run: bool) -> Self {
        self.run_scheduler = run;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HostfleetRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let cipher = self
            .cipher
            .ok_or_else(|| anyhow::anyhow!("cipher is required"))?;

        Ok(HostfleetRuntimeConfig {
            store,
            cipher,
            totp_vault: self.totp_vault.unwrap_or_else(TotpVault::legacy),
            launcher: self
                .launcher
                .unwrap_or_else(|| Arc::new(ProcessLauncher::new())),
            host_config: self.host_config,
            supervisor_config: self.supervisor_config,
            scheduler_config: self.scheduler_config,
            watcher_config: self.watcher_config,
            watch_plugins: self.watch_plugins,
            run_scheduler: self.run_scheduler,
        })
    }
}

/// Configuration for a [`HostfleetRuntime`].
pub struct HostfleetRuntimeConfig {
    store: Store,
    cipher: ConfigCipher,
    totp_vault: TotpVault,
    launcher: Arc<dyn Launcher>,
    host_config: PluginHostConfig,
    supervisor_config: SupervisorConfig,
    scheduler_config: SchedulerConfig,
    watcher_config: WatcherConfig,
    watch_plugins: bool,
    run_scheduler: bool,
}

/// Services wired by the runtime.
#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub settings: SettingsReader,
    pub plugins: Arc<PluginHost>,
    pub payments: Arc<dyn PaymentProviderRegistry>,
    pub sms: Arc<dyn SmsSender>,
    pub events: Arc<EventBus>,
    pub engine: Arc<ProvisioningEngine>,
    pub orders: Arc<OrderService>,
    pub kyc: Arc<KycService>,
    pub tier: Arc<TierService>,
    pub retention: Arc<LogRetention>,
    pub password_resets: Arc<PasswordResetService>,
    pub totp_vault: TotpVault,
    pub scheduler: Scheduler,
}

impl HostfleetRuntimeConfig {
    /// Wire the services, load enabled plugins and spawn the background loops.
    pub async fn start(self) -> Result<HostfleetRuntime> {
        let store = self.store;
        let settings = SettingsReader::new(store.settings.clone());

        let plugins = PluginHost::new(
            self.host_config,
            &store,
            Arc::new(self.cipher),
            self.launcher,
        );
        match plugins.bootstrap().await {
            Ok(0) => {}
            Ok(imported) => info!(imported, "Imported plugins found on disk"),
            Err(e) => warn!(error = %e, "Plugin bootstrap failed"),
        }

        let payments: Arc<dyn PaymentProviderRegistry> =
            Arc::new(PluginPaymentRegistry::new(plugins.clone()));
        let sms: Arc<dyn SmsSender> = Arc::new(PluginSmsSender::new(plugins.clone()));
        let resolver = Arc::new(PluginAutomationResolver::new(
            plugins.clone(),
            store.catalog.clone(),
        ));

        let events = Arc::new(
            EventBus::new(store.events.clone())
                .with_sink(Arc::new(RobotWebhookSink::new(settings.clone())?))
                .with_sink(Arc::new(FcmPushSink::new(
                    settings.clone(),
                    store.users.clone(),
                    store.push_tokens.clone(),
                )?)),
        );

        let engine = Arc::new(
            ProvisioningEngine::new(store.clone(), events.clone(), resolver)
                .with_payments(payments.clone()),
        );

        let tier = Arc::new(TierService::new(store.clone()));
        if let Err(e) = tier.ensure_default_group().await {
            warn!(error = %e, "Failed to ensure the default tier group");
        }

        let kyc = Arc::new(KycService::new(
            store.realname.clone(),
            Arc::new(PluginKycRegistry::new(plugins.clone())),
            settings.clone(),
        ));

        let orders = Arc::new(
            OrderService::new(store.clone(), events.clone(), engine.clone())
                .with_tier(tier.clone())
                .with_gate(kyc.clone())
                .with_payments(payments.clone()),
        );

        let retention = Arc::new(LogRetention::new(settings.clone(), store.retention.clone()));

        let scheduler = task_scheduler(
            Scheduler::new(settings.clone(), store.task_runs.clone())
                .with_config(self.scheduler_config),
            &engine,
            &kyc,
            &tier,
            &retention,
        );

        if let Err(e) = plugins.start_enabled().await {
            warn!(error = %e, "Failed to start enabled plugins");
        }

        // Health supervisor
        let supervisor = PluginSupervisor::new(plugins.clone(), self.supervisor_config);
        let supervisor_shutdown = supervisor.shutdown_handle();
        let supervisor_handle = tokio::spawn(async move {
            supervisor.run().await;
        });

        // Scheduler
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = if self.run_scheduler {
            let runner = scheduler.clone();
            Some(tokio::spawn(async move {
                runner.run().await;
            }))
        } else {
            None
        };

        // Payment plugin watcher
        let watcher = if self.watch_plugins {
            let watcher = PaymentPluginWatcher::new(plugins.clone(), self.watcher_config);
            let shutdown = watcher.shutdown_handle();
            let handle = tokio::spawn(async move {
                if let Err(e) = watcher.run().await {
                    error!(error = %e, "Payment plugin watcher stopped");
                }
            });
            Some((handle, shutdown))
        } else {
            None
        };

        info!(
            plugins_dir = %plugins.plugins_dir().display(),
            loaded_plugins = plugins.loaded_instances().len(),
            scheduler = self.run_scheduler,
            watch_plugins = watcher.is_some(),
            "HostfleetRuntime started"
        );

        let services = Arc::new(Services {
            password_resets: Arc::new(PasswordResetService::new(store.reset_tokens.clone())),
            store,
            settings,
            plugins,
            payments,
            sms,
            events,
            engine,
            orders,
            kyc,
            tier,
            retention,
            totp_vault: self.totp_vault,
            scheduler,
        });

        Ok(HostfleetRuntime {
            services,
            supervisor_handle,
            supervisor_shutdown,
            scheduler_handle,
            scheduler_shutdown,
            watcher,
        })
    }
}

/// Wrap an async closure as a scheduled task handler.
fn handler<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = hostfleet_core::Result<String>> + Send + 'static,
{
    Arc::new(move || -> TaskFuture { Box::pin(f()) })
}

/// Attach the built-in task handlers. `integration_inventory_sync` has no
/// handler and never runs.
fn task_scheduler(
    scheduler: Scheduler,
    engine: &Arc<ProvisioningEngine>,
    kyc: &Arc<KycService>,
    tier: &Arc<TierService>,
    retention: &Arc<LogRetention>,
) -> Scheduler {
    let e = engine.clone();
    let vps_refresh = handler(move || {
        let e = e.clone();
        async move {
            let refreshed = e.refresh_all(TASK_BATCH_SIZE).await?;
            Ok(format!("refreshed {refreshed} instances"))
        }
    });

    let e = engine.clone();
    let watchdog = handler(move || {
        let e = e.clone();
        async move {
            let jobs = e.run_provision_jobs().await?;
            let redispatched = e.redispatch_approved().await?;
            let reconciled = e.reconcile_provisioning().await?;
            Ok(format!(
                "jobs {jobs}, redispatched {redispatched}, reconciled {reconciled}"
            ))
        }
    });

    let e = engine.clone();
    let resize = handler(move || {
        let e = e.clone();
        async move {
            let done = e.run_resize_tasks().await?;
            Ok(format!("processed {done} resize tasks"))
        }
    });

    let e = engine.clone();
    let reminders = handler(move || {
        let e = e.clone();
        async move {
            let sent = e.send_expire_reminders().await?;
            Ok(format!("sent {sent} reminders"))
        }
    });

    let e = engine.clone();
    let cleanup = handler(move || {
        let e = e.clone();
        async move {
            let deleted = e.auto_delete().await?;
            Ok(format!("deleted {deleted} instances"))
        }
    });

    let e = engine.clone();
    let lock = handler(move || {
        let e = e.clone();
        async move {
            let locked = e.expire_lock().await?;
            Ok(format!("locked {locked} instances"))
        }
    });

    let k = kyc.clone();
    let kyc_poll = handler(move || {
        let k = k.clone();
        async move {
            let resolved = k.poll_pending(TASK_BATCH_SIZE).await?;
            Ok(format!("resolved {resolved} verifications"))
        }
    });

    let t = tier.clone();
    let tier_reconcile = handler(move || {
        let t = t.clone();
        async move {
            let processed = t.reconcile_expired(TASK_BATCH_SIZE).await?;
            Ok(format!("reconciled {processed} memberships"))
        }
    });

    let r = retention.clone();
    let log_retention = handler(move || {
        let r = r.clone();
        async move { r.cleanup().await }
    });

    scheduler
        .with_handler(task_keys::VPS_REFRESH, vps_refresh)
        .with_handler(task_keys::ORDER_PROVISION_WATCHDOG, watchdog)
        .with_handler(task_keys::RESIZE_TASK_RUNNER, resize)
        .with_handler(task_keys::EXPIRE_REMINDER, reminders)
        .with_handler(task_keys::VPS_EXPIRE_CLEANUP, cleanup)
        .with_handler(task_keys::VPS_EXPIRE_LOCK, lock)
        .with_handler(task_keys::PLUGIN_SCHEDULE, kyc_poll)
        .with_handler(task_keys::USER_TIER_EXPIRE_RECONCILE, tier_reconcile)
        .with_handler(task_keys::LOG_RETENTION_CLEANUP, log_retention)
}

/// A running hostfleet instance.
///
/// The runtime manages:
/// - The plugin host and its health supervisor
/// - The task scheduler
/// - The payment plugin watcher (optional)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct HostfleetRuntime {
    services: Arc<Services>,
    supervisor_handle: JoinHandle<()>,
    supervisor_shutdown: Arc<Notify>,
    scheduler_handle: Option<JoinHandle<()>>,
    scheduler_shutdown: Arc<Notify>,
    watcher: Option<(JoinHandle<()>, Arc<Notify>)>,
}

impl HostfleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HostfleetRuntimeBuilder {
        HostfleetRuntimeBuilder::new()
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the background loops, waits for them, then stops every plugin
    /// process.
    pub async fn shutdown(self) -> Result<()> {
        info!("HostfleetRuntime shutting down...");

        self.scheduler_shutdown.notify_one();
        self.supervisor_shutdown.notify_one();
        if let Some((_, shutdown)) = &self.watcher {
            shutdown.notify_one();
        }

        if let Some(handle) = self.scheduler_handle
            && let Err(e) = handle.await
        {
            error!("Scheduler task panicked: {}", e);
        }

        if let Err(e) = self.supervisor_handle.await {
            error!("Plugin supervisor task panicked: {}", e);
        }

        if let Some((handle, _)) = self.watcher
            && let Err(e) = handle.await
        {
            error!("Payment plugin watcher task panicked: {}", e);
        }

        self.services.plugins.shutdown().await;

        info!("HostfleetRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background loops are still running.
    pub fn is_running(&self) -> bool {
        let scheduler_running = self
            .scheduler_handle
            .as_ref()
            .is_none_or(|h| !h.is_finished());
        let watcher_running = self
            .watcher
            .as_ref()
            .is_none_or(|(h, _)| !h.is_finished());
        !self.supervisor_handle.is_finished() && scheduler_running && watcher_running
    }
}
