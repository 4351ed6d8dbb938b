// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that polls plugin health.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use super::PluginHost;

/// Configuration for the health supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often every loaded instance is asked for `Health`.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

pub struct PluginSupervisor {
    host: Arc<PluginHost>,
    config: SupervisorConfig,
    shutdown: Arc<Notify>,
}

impl PluginSupervisor {
    pub fn new(host: Arc<PluginHost>, config: SupervisorConfig) -> Self {
        Self {
            host,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the health loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Plugin supervisor started"
        );
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Plugin supervisor received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    debug!(loaded = self.host.loaded_instances().len(), "Running plugin health checks");
                    self.host.check_health().await;
                }
            }
        }
        info!("Plugin supervisor stopped");
    }
}
