// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child-process launcher.

use std::process::Stdio;

use async_trait::async_trait;
use hostfleet_protocol::handshake::child_env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{KillSwitch, LaunchSpec, Launcher, PluginProcess};
use crate::error::{PluginError, Result};

/// Spawns the plugin executable with piped stdio. The plugin's stderr is
/// forwarded to the host log line by line.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<PluginProcess> {
        let mut cmd = Command::new(&spec.entry_path);
        cmd.current_dir(&spec.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in child_env() {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            PluginError::LaunchFailed(format!("{}: {e}", spec.entry_path.display()))
        })?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::LaunchFailed("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::LaunchFailed("stdout not captured".into()))?;

        let label = spec.key.to_string();
        if let Some(stderr) = child.stderr.take() {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(plugin = %label, "{}", line);
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let reason = match waited {
                Some(Ok(status)) => format!("exited with {status}"),
                Some(Err(e)) => format!("wait failed: {e}"),
                None => {
                    if let Err(e) = child.kill().await {
                        warn!(plugin = %label, error = %e, "Failed to kill plugin process");
                    }
                    "killed by host".to_string()
                }
            };
            debug!(plugin = %label, reason = %reason, "Plugin process ended");
            let _ = exit_tx.send(reason);
        });

        info!(plugin = %spec.key, pid = ?pid, entry = %spec.entry_path.display(), "Plugin process started");
        Ok(PluginProcess {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            exited: exit_rx,
            kill: KillSwitch::new(kill_tx),
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostfleet_core::domain::{InstanceKey, PluginCategory};

    #[tokio::test]
    async fn test_missing_executable_fails_to_launch() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = LaunchSpec {
            key: InstanceKey::new(PluginCategory::Sms, "ghost", ""),
            plugin_dir: dir.path().to_path_buf(),
            entry_path: dir.path().join("plugin"),
            env: Vec::new(),
        };
        let err = ProcessLauncher::new().launch(&spec).await.unwrap_err();
        assert!(matches!(err, PluginError::LaunchFailed(_)));
    }
}
