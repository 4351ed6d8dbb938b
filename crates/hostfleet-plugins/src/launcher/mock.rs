// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock launcher for testing.
//!
//! Plugins are [`PluginHandler`]s registered by plugin id and served over an
//! in-memory duplex pipe, so the host exercises the same framing, handshake
//! and multiplexing code as with real child processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use hostfleet_protocol::{Handshake, PluginHandler, RpcError, Service, serve};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use super::{KillSwitch, LaunchSpec, Launcher, PluginProcess};
use crate::error::{PluginError, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone)]
struct MockPlugin {
    handler: Arc<dyn PluginHandler>,
    services: Vec<Service>,
}

/// `serve` wants a sized handler.
struct SharedHandler(Arc<dyn PluginHandler>);

#[async_trait]
impl PluginHandler for SharedHandler {
    async fn handle(
        &self,
        service: Service,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        self.0.handle(service, method, params).await
    }
}

/// Mock launcher for testing.
pub struct MockLauncher {
    plugins: Mutex<HashMap<String, MockPlugin>>,
    crashes: Mutex<HashMap<String, watch::Sender<u64>>>,
    handshake_override: Mutex<Option<Handshake>>,
    /// If true, every launch fails.
    pub fail_launches: AtomicBool,
    launches: AtomicUsize,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            crashes: Mutex::new(HashMap::new()),
            handshake_override: Mutex::new(None),
            fail_launches: AtomicBool::new(false),
            launches: AtomicUsize::new(0),
        }
    }

    /// Serve `handler` for every launch of `plugin_id`. `Core` is added to
    /// `services` if missing.
    pub fn register(
        &self,
        plugin_id: &str,
        handler: Arc<dyn PluginHandler>,
        mut services: Vec<Service>,
    ) {
        if !services.contains(&Service::Core) {
            services.insert(0, Service::Core);
        }
        self.plugins
            .lock()
            .insert(plugin_id.to_string(), MockPlugin { handler, services });
    }

    /// Send this handshake instead of the correct one.
    pub fn set_handshake(&self, handshake: Option<Handshake>) {
        *self.handshake_override.lock() = handshake;
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make every running process of `plugin_id` exit abruptly.
    pub fn crash(&self, plugin_id: &str) {
        if let Some(tx) = self.crashes.lock().get(plugin_id) {
            tx.send_modify(|n| *n += 1);
        }
    }

    fn crash_signal(&self, plugin_id: &str) -> watch::Receiver<u64> {
        self.crashes
            .lock()
            .entry(plugin_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<PluginProcess> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(PluginError::LaunchFailed("mock launch failure".into()));
        }
        let plugin = self
            .plugins
            .lock()
            .get(&spec.key.plugin_id)
            .cloned()
            .ok_or_else(|| {
                PluginError::LaunchFailed(format!("no mock registered for {}", spec.key.plugin_id))
            })?;
        self.launches.fetch_add(1, Ordering::SeqCst);

        let handshake = self
            .handshake_override
            .lock()
            .clone()
            .unwrap_or_else(|| Handshake::current(plugin.services.clone()));
        let mut crash = self.crash_signal(&spec.key.plugin_id);

        // host <-> relay <-> plugin. Dropping the relay severs both pipes at
        // once, even while the handler still has calls in flight.
        let (host_side, mut relay_host) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut relay_plugin, plugin_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let handler = Arc::new(SharedHandler(plugin.handler));
        let served = tokio::spawn(async move {
            serve(handler, plugin_read, plugin_write, &handshake).await
        });
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut relay_host, &mut relay_plugin) => {
                    "exited with status 0".to_string()
                }
                _ = kill_rx => "killed by host".to_string(),
                Ok(()) = crash.changed() => "crashed".to_string(),
            };
            served.abort();
            drop(relay_host);
            drop(relay_plugin);
            let _ = exit_tx.send(reason);
        });

        Ok(PluginProcess {
            reader: Box::new(host_read),
            writer: Box::new(host_write),
            exited: exit_rx,
            kill: KillSwitch::new(kill_tx),
            pid: None,
        })
    }
}
