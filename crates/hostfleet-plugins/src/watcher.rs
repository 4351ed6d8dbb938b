// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watches `<plugins_dir>/payment` and re-syncs payment plugins when files
//! change there.

use std::sync::Arc;
use std::time::Duration;

use hostfleet_core::domain::PluginCategory;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::{PluginError, Result};
use crate::host::PluginHost;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period after the last change before syncing.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

pub struct PaymentPluginWatcher {
    host: Arc<PluginHost>,
    config: WatcherConfig,
    shutdown: Arc<Notify>,
}

impl PaymentPluginWatcher {
    pub fn new(host: Arc<PluginHost>, config: WatcherConfig) -> Self {
        Self {
            host,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Start watching. Fails only if the directory cannot be watched.
    pub async fn run(&self) -> Result<()> {
        let dir = self.host.plugins_dir().join(PluginCategory::Payment.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let _ = tx.send(());
                }
                Err(e) => error!(error = %e, "Payment plugin watch error"),
            },
            Config::default(),
        )
        .map_err(|e| PluginError::Watch(e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|e| PluginError::Watch(e.to_string()))?;
        info!(dir = %dir.display(), "Payment plugin watcher started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Payment plugin watcher received shutdown signal");
                    break;
                }
                received = rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    // Let an upload or unzip settle before scanning.
                    loop {
                        match tokio::time::timeout(self.config.debounce, rx.recv()).await {
                            Ok(Some(())) => continue,
                            Ok(None) | Err(_) => break,
                        }
                    }
                    match self.host.sync_from_disk(PluginCategory::Payment).await {
                        Ok(0) => debug!("Payment plugin directory changed, nothing to sync"),
                        Ok(changed) => info!(changed, "Payment plugins synced from disk"),
                        Err(e) => warn!(error = %e, "Payment plugin sync failed"),
                    }
                }
            }
        }
        drop(watcher);
        info!("Payment plugin watcher stopped");
        Ok(())
    }
}
