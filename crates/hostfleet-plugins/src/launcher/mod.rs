// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launchers start plugin processes and hand back their stdio pipes.
//!
//! [`ProcessLauncher`] spawns the real executable. [`MockLauncher`] serves
//! in-process handlers over an in-memory duplex pipe for tests.

pub mod mock;
mod process;

use std::path::PathBuf;

use async_trait::async_trait;
use hostfleet_core::domain::InstanceKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::error::Result;

pub use mock::MockLauncher;
pub use process::ProcessLauncher;

/// What to start.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: InstanceKey,
    pub plugin_dir: PathBuf,
    pub entry_path: PathBuf,
    /// Extra environment on top of the handshake variables.
    pub env: Vec<(String, String)>,
}

/// Terminates the plugin when fired or dropped.
#[derive(Debug)]
pub struct KillSwitch(Option<oneshot::Sender<()>>);

impl KillSwitch {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Some(tx))
    }

    pub fn kill(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// A started plugin.
pub struct PluginProcess {
    /// Plugin's stdout.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Plugin's stdin.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Resolves with a description of how the process ended.
    pub exited: oneshot::Receiver<String>,
    pub kill: KillSwitch,
    pub pid: Option<u32>,
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Short name for logs (`process`, `mock`).
    fn kind(&self) -> &'static str;

    async fn launch(&self, spec: &LaunchSpec) -> Result<PluginProcess>;
}
