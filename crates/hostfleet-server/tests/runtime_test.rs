// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime wiring tests: in-memory store, mock launcher, temp plugin dir.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hostfleet_core::Error;
use hostfleet_core::Store;
use hostfleet_core::domain::{PluginCategory, TaskRunStatus};
use hostfleet_core::scheduler::task_keys;
use hostfleet_core::secrets::ConfigCipher;
use hostfleet_plugins::{InstallPolicy, MockLauncher};
use hostfleet_protocol::PluginManifest;
use hostfleet_protocol::manifest::{Capabilities, PaymentCapability};
use hostfleet_server::runtime::HostfleetRuntime;
use tempfile::TempDir;

fn payment_plugin(root: &Path, plugin_id: &str) {
    let manifest = PluginManifest {
        plugin_id: plugin_id.to_string(),
        name: format!("{plugin_id} gateway"),
        version: "1.0.0".to_string(),
        description: String::new(),
        binaries: BTreeMap::new(),
        capabilities: Capabilities {
            payment: Some(PaymentCapability {
                methods: vec![format!("{plugin_id}_qr")],
            }),
            ..Default::default()
        },
    };
    let dir = root.join(PluginCategory::Payment.as_str()).join(plugin_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    std::fs::write(dir.join("plugin"), b"#!/bin/sh\n").unwrap();
    std::fs::write(dir.join("plugin.exe"), b"MZ").unwrap();
}

async fn start(dir: &TempDir, watch: bool) -> HostfleetRuntime {
    HostfleetRuntime::builder()
        .store(Store::in_memory())
        .cipher(ConfigCipher::new([3; 32]))
        .launcher(Arc::new(MockLauncher::new()))
        .plugins_dir(dir.path())
        .install_policy(InstallPolicy {
            allow_unsigned: true,
            ..Default::default()
        })
        .watch_plugins(watch)
        .run_scheduler(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn installed(runtime: &HostfleetRuntime) -> Vec<String> {
    runtime
        .services()
        .plugins
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.installation.plugin_id)
        .collect()
}

#[tokio::test]
async fn test_start_wires_services() {
    let dir = TempDir::new().unwrap();
    let runtime = start(&dir, false).await;
    assert!(runtime.is_running());

    let services = runtime.services();
    let tasks = services.scheduler.list_tasks().await;
    assert_eq!(tasks.len(), 10);

    // The default tier group exists after start.
    assert!(!services.tier.list_groups().await.unwrap().is_empty());

    // No payment plugins, no providers.
    assert!(services.payments.list_providers(true).await.unwrap().is_empty());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_builtin_tasks_run() {
    let dir = TempDir::new().unwrap();
    let runtime = start(&dir, false).await;
    let scheduler = &runtime.services().scheduler;

    for key in [
        task_keys::VPS_REFRESH,
        task_keys::ORDER_PROVISION_WATCHDOG,
        task_keys::RESIZE_TASK_RUNNER,
        task_keys::EXPIRE_REMINDER,
        task_keys::VPS_EXPIRE_CLEANUP,
        task_keys::VPS_EXPIRE_LOCK,
        task_keys::PLUGIN_SCHEDULE,
        task_keys::USER_TIER_EXPIRE_RECONCILE,
        task_keys::LOG_RETENTION_CLEANUP,
    ] {
        let run = scheduler.run_now(key).await.unwrap();
        assert_eq!(run.status, TaskRunStatus::Success, "{key}: {}", run.message);
    }

    let run = scheduler.run_now(task_keys::PLUGIN_SCHEDULE).await.unwrap();
    assert_eq!(run.message, "resolved 0 verifications");
    assert_eq!(
        scheduler
            .list_runs(task_keys::PLUGIN_SCHEDULE, 10)
            .await
            .unwrap()
            .len(),
        2
    );

    let err = scheduler
        .run_now(task_keys::INTEGRATION_INVENTORY_SYNC)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_imports_plugins_on_disk() {
    let dir = TempDir::new().unwrap();
    payment_plugin(dir.path(), "alpay");

    let runtime = start(&dir, false).await;
    assert_eq!(installed(&runtime).await, ["alpay"]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watcher_picks_up_new_payment_plugin() {
    let dir = TempDir::new().unwrap();
    let runtime = start(&dir, true).await;
    assert!(installed(&runtime).await.is_empty());

    // Rewrite until the watcher has registered and seen the change. Each
    // pause outlasts the debounce window.
    let mut found = false;
    for _ in 0..10 {
        payment_plugin(dir.path(), "bpay");
        tokio::time::sleep(Duration::from_secs(1)).await;
        if installed(&runtime).await == ["bpay"] {
            found = true;
            break;
        }
    }
    assert!(found, "payment plugin was not imported");

    runtime.shutdown().await.unwrap();
}
