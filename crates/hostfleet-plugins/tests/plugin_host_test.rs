// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for plugin loading, config handling and supervision.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use hostfleet_core::Error;
use hostfleet_core::domain::{PluginCategory, PluginHealth, SignatureStatus};
use hostfleet_core::store::PluginInstallationRepository;
use hostfleet_protocol::messages::HealthState;
use hostfleet_protocol::{Handshake, Service};
use serde_json::{Value, json};

fn payment_plugin(id: &str) -> std::sync::Arc<FakePlugin> {
    FakePlugin::with_schema(payment_manifest(id, &["mock_qr"]), PAYMENT_SCHEMA)
}

#[tokio::test]
async fn test_enable_loads_and_inits_with_config() {
    let th = test_host();
    let plugin = payment_plugin("mockpay");
    let key = th
        .enable_plugin(
            PluginCategory::Payment,
            plugin.clone(),
            json!({"merchant_id": "m-1", "secret_key": "s3cret"}),
        )
        .await;

    assert!(th.host.is_loaded(&key));
    assert_eq!(th.host.loaded_instances(), vec![key.clone()]);
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert!(inst.enabled);
    assert!(inst.loaded);
    assert_eq!(inst.health_status, PluginHealth::Ok);
    assert_eq!(inst.signature_status, SignatureStatus::Untrusted);
    assert!(plugin.active_config.lock().contains("m-1"));
    assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);

    // Stored encrypted, never as plaintext.
    assert!(!inst.config_encrypted.contains("s3cret"));
}

#[tokio::test]
async fn test_enable_rejects_missing_required_fields() {
    let th = test_host();
    let key = th.add_plugin(PluginCategory::Payment, payment_plugin("mockpay")).await;

    let err = th.host.enable_instance(&key).await.unwrap_err();
    match err {
        Error::ConfigValidation {
            code,
            missing_fields,
        } => {
            assert_eq!(code, "missing_required_config");
            assert_eq!(missing_fields, vec!["merchant_id".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!th.host.is_loaded(&key));
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert!(!inst.enabled);
}

#[tokio::test]
async fn test_enable_reports_plugin_side_validation() {
    let th = test_host();
    let key = th.add_plugin(PluginCategory::Payment, payment_plugin("mockpay")).await;
    th.host
        .update_config(&key, &json!({"merchant_id": "rejected"}).to_string())
        .await
        .unwrap();

    let err = th.host.enable_instance(&key).await.unwrap_err();
    assert!(
        matches!(&err, Error::ConfigValidation { code, missing_fields }
            if code == "invalid_plugin_config" && missing_fields.is_empty()),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_config_secrets_are_redacted_and_kept() {
    let th = test_host();
    let key = th
        .enable_plugin(
            PluginCategory::Payment,
            payment_plugin("mockpay"),
            json!({"merchant_id": "m-1", "secret_key": "s3cret"}),
        )
        .await;

    let redacted: Value = serde_json::from_str(&th.host.get_config_redacted(&key).await.unwrap()).unwrap();
    assert_eq!(redacted["merchant_id"], "m-1");
    assert_eq!(redacted["secret_key"], "");

    // A blank secret keeps the stored value.
    th.host
        .update_config(&key, &json!({"merchant_id": "m-2", "secret_key": ""}).to_string())
        .await
        .unwrap();
    let plain: Value = serde_json::from_str(&th.host.get_config_plain(&key).await.unwrap()).unwrap();
    assert_eq!(plain["merchant_id"], "m-2");
    assert_eq!(plain["secret_key"], "s3cret");
}

#[tokio::test]
async fn test_update_config_rejects_non_objects() {
    let th = test_host();
    let key = th.add_plugin(PluginCategory::Payment, payment_plugin("mockpay")).await;

    let err = th.host.update_config(&key, "not json").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    let err = th.host.update_config(&key, "[1, 2]").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_reload_failure_keeps_old_config_and_degrades() {
    let th = test_host();
    let plugin = payment_plugin("mockpay");
    let key = th
        .enable_plugin(PluginCategory::Payment, plugin.clone(), json!({"merchant_id": "m-1"}))
        .await;

    plugin.reload_ok.store(false, Ordering::SeqCst);
    let err = th
        .host
        .update_config(&key, &json!({"merchant_id": "m-2"}).to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)), "{err:?}");

    assert!(plugin.active_config.lock().contains("m-1"));
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert_eq!(inst.health_status, PluginHealth::Degraded);
    assert!(th.host.is_loaded(&key));

    // The rejected config is not stored, so a respawn keeps the old one.
    let stored: Value = serde_json::from_str(&th.host.get_config_plain(&key).await.unwrap()).unwrap();
    assert_eq!(stored["merchant_id"], "m-1");
}

#[tokio::test]
async fn test_reload_success_reaches_running_plugin() {
    let th = test_host();
    let plugin = payment_plugin("mockpay");
    let key = th
        .enable_plugin(PluginCategory::Payment, plugin.clone(), json!({"merchant_id": "m-1"}))
        .await;

    th.host
        .update_config(&key, &json!({"merchant_id": "m-2"}).to_string())
        .await
        .unwrap();
    assert!(plugin.active_config.lock().contains("m-2"));
    assert_eq!(plugin.called("ReloadConfig"), 1);
    assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_crashed_plugin_is_respawned() {
    let th = test_host();
    let plugin = payment_plugin("mockpay");
    let key = th
        .enable_plugin(PluginCategory::Payment, plugin.clone(), json!({"merchant_id": "m-1"}))
        .await;
    // Schema and validation calls use short-lived processes of their own.
    let launches = th.launcher.launch_count();

    th.launcher.crash("mockpay");

    let host = th.host.clone();
    let launcher = th.launcher.clone();
    let k = key.clone();
    assert!(
        wait_until(|| {
            let host = host.clone();
            let launcher = launcher.clone();
            let k = k.clone();
            async move { launcher.launch_count() == launches + 1 && host.is_loaded(&k) }
        })
        .await
    );
    assert_eq!(plugin.inits.load(Ordering::SeqCst), 2);
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert_eq!(inst.health_status, PluginHealth::Ok);
    assert!(inst.loaded);
}

#[tokio::test]
async fn test_repeated_init_failures_stop_respawning() {
    let th = test_host();
    let plugin = payment_plugin("mockpay");
    let key = th
        .enable_plugin(PluginCategory::Payment, plugin.clone(), json!({"merchant_id": "m-1"}))
        .await;

    plugin.init_ok.store(false, Ordering::SeqCst);
    th.launcher.crash("mockpay");

    let store = th.store.clone();
    let k = key.clone();
    assert!(
        wait_until(|| {
            let store = store.clone();
            let k = k.clone();
            async move { !store.plugins.get_installation(&k).await.unwrap().loaded }
        })
        .await
    );
    assert!(!th.host.is_loaded(&key));
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert_eq!(inst.health_status, PluginHealth::Error);
    assert!(inst.health_message.contains("bad credentials"), "{}", inst.health_message);
    // Still enabled: the operator decides what happens next.
    assert!(inst.enabled);

    // Nothing respawns after giving up.
    let launches = th.launcher.launch_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(th.launcher.launch_count(), launches);

    // Re-enabling resets the failure history.
    plugin.init_ok.store(true, Ordering::SeqCst);
    th.host.enable_instance(&key).await.unwrap();
    assert!(th.host.is_loaded(&key));
}

#[tokio::test]
async fn test_disabled_instance_is_not_respawned() {
    let th = test_host();
    let key = th
        .enable_plugin(PluginCategory::Payment, payment_plugin("mockpay"), json!({"merchant_id": "m-1"}))
        .await;

    let launches = th.launcher.launch_count();
    th.host.disable_instance(&key).await.unwrap();
    assert!(!th.host.is_loaded(&key));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(th.launcher.launch_count(), launches);

    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert!(!inst.enabled);
    assert!(!inst.loaded);

    let err = th
        .host
        .call::<_, Value>(&key, Service::Payment, "CreatePayment", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(ref m) if m.contains("plugin not loaded")), "{err:?}");
}

#[tokio::test]
async fn test_health_states() {
    let th = test_host();
    let plugin = payment_plugin("mockpay");
    let key = th
        .enable_plugin(PluginCategory::Payment, plugin.clone(), json!({"merchant_id": "m-1"}))
        .await;

    *plugin.health.lock() = HealthState::Degraded;
    th.host.check_health().await;
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert_eq!(inst.health_status, PluginHealth::Degraded);
    assert_eq!(inst.health_message, "degraded");

    *plugin.health.lock() = HealthState::Ok;
    *plugin.health_delay.lock() = Duration::from_millis(500);
    th.host.check_health().await;
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert_eq!(inst.health_status, PluginHealth::Error);
    assert!(inst.health_message.contains("timed out"), "{}", inst.health_message);

    *plugin.health_delay.lock() = Duration::ZERO;
    th.host.check_health().await;
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert_eq!(inst.health_status, PluginHealth::Ok);
    assert!(inst.last_health_at.is_some());
}

#[tokio::test]
async fn test_launch_failure_leaves_instance_disabled() {
    let th = test_host();
    let key = th.add_plugin(PluginCategory::Payment, payment_plugin("mockpay")).await;
    th.host
        .update_config(&key, &json!({"merchant_id": "m-1"}).to_string())
        .await
        .unwrap();

    th.launcher.set_fail_launches(true);
    // Validation needs a temporary process too.
    let err = th.host.enable_instance(&key).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert!(!inst.enabled);
}

#[tokio::test]
async fn test_handshake_mismatch_fails_load() {
    let th = test_host();
    let key = th
        .add_plugin(PluginCategory::Automation, FakePlugin::new(automation_manifest("lightboat")))
        .await;

    let mut handshake = Handshake::current(vec![Service::Core, Service::Automation]);
    handshake.magic_cookie = "someone-else".to_string();
    th.launcher.set_handshake(Some(handshake));

    let err = th.host.enable_instance(&key).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(ref m) if m.contains("Handshake")), "{err:?}");
    assert!(!th.host.is_loaded(&key));
}

#[tokio::test]
async fn test_plugin_must_report_installed_manifest() {
    let th = test_host();
    let on_disk = automation_manifest("lightboat");
    let mut reported = on_disk.clone();
    reported.version = "9.9.9".to_string();

    write_plugin_dir(th.dir.path(), PluginCategory::Automation, &on_disk);
    th.launcher
        .register("lightboat", FakePlugin::new(reported), vec![Service::Automation]);
    let inst = th
        .host
        .import_from_disk(PluginCategory::Automation, "lightboat")
        .await
        .unwrap();

    let err = th.host.enable_instance(&inst.key()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("9.9.9")), "{err:?}");
}

#[tokio::test]
async fn test_instances_lifecycle() {
    let th = test_host();
    let key = th.add_plugin(PluginCategory::Payment, payment_plugin("mockpay")).await;

    let extra = th
        .host
        .create_instance(PluginCategory::Payment, "mockpay")
        .await
        .unwrap();
    assert!(extra.instance_id.starts_with("payment-mockpay-"), "{}", extra.instance_id);
    assert_eq!(extra.instance_id.len(), "payment-mockpay-".len() + 8);
    assert!(!extra.enabled);

    let listing = th.host.list().await.unwrap();
    assert_eq!(listing.len(), 2);
    assert!(listing.iter().all(|l| !l.running));
    assert!(listing.iter().all(|l| l.entry.as_ref().is_some_and(|e| e.supported)));

    // Files stay while instances exist.
    let err = th
        .host
        .uninstall(PluginCategory::Payment, "mockpay")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    th.host.delete_instance(&extra.key()).await.unwrap();
    th.host.delete_instance(&key).await.unwrap();
    th.host
        .uninstall(PluginCategory::Payment, "mockpay")
        .await
        .unwrap();
    assert!(!th.dir.path().join("payment").join("mockpay").exists());

    let err = th
        .host
        .uninstall(PluginCategory::Payment, "mockpay")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_bootstrap_imports_once() {
    let th = test_host();
    write_plugin_dir(th.dir.path(), PluginCategory::Payment, &payment_manifest("mockpay", &["mock_qr"]));
    write_plugin_dir(th.dir.path(), PluginCategory::Sms, &sms_manifest("smsx"));

    assert_eq!(th.host.discover_on_disk().await.unwrap().len(), 2);
    assert_eq!(th.host.bootstrap().await.unwrap(), 2);
    assert!(th.host.discover_on_disk().await.unwrap().is_empty());

    // Later runs only pick up official plugins.
    write_plugin_dir(th.dir.path(), PluginCategory::Kyc, &kyc_manifest("faceid"));
    assert_eq!(th.host.bootstrap().await.unwrap(), 0);
    let pending = th.host.discover_on_disk().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].plugin_id, "faceid");

    th.host
        .import_from_disk(PluginCategory::Kyc, "faceid")
        .await
        .unwrap();
    let err = th
        .host
        .import_from_disk(PluginCategory::Kyc, "faceid")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_sync_from_disk_refreshes_manifests() {
    let th = test_host();
    let key = th.add_plugin(PluginCategory::Payment, payment_plugin("mockpay")).await;

    let mut upgraded = payment_manifest("mockpay", &["mock_qr", "mock_h5"]);
    upgraded.version = "1.1.0".to_string();
    write_plugin_dir(th.dir.path(), PluginCategory::Payment, &upgraded);
    write_plugin_dir(th.dir.path(), PluginCategory::Payment, &payment_manifest("otherpay", &["other"]));

    assert_eq!(th.host.sync_from_disk(PluginCategory::Payment).await.unwrap(), 2);
    let inst = th.store.plugins.get_installation(&key).await.unwrap();
    assert_eq!(inst.version, "1.1.0");
    assert!(inst.manifest_json.contains("mock_h5"));

    // Nothing changed on disk since.
    assert_eq!(th.host.sync_from_disk(PluginCategory::Payment).await.unwrap(), 0);
}

#[tokio::test]
async fn test_config_schema_for_automation_is_builtin() {
    let th = test_host();
    let plugin = FakePlugin::new(automation_manifest("lightboat"));
    let key = th.add_plugin(PluginCategory::Automation, plugin.clone()).await;

    let schema = th.host.config_schema(&key).await.unwrap();
    assert!(schema.json_schema.contains("api_key"));
    assert_eq!(plugin.called("GetConfigSchema"), 0);
    assert_eq!(th.launcher.launch_count(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_all_plugins() {
    let th = test_host();
    let pay = th
        .enable_plugin(PluginCategory::Payment, payment_plugin("mockpay"), json!({"merchant_id": "m-1"}))
        .await;
    let sms = th
        .enable_plugin(PluginCategory::Sms, FakePlugin::new(sms_manifest("smsx")), json!({}))
        .await;

    let launches = th.launcher.launch_count();
    th.host.shutdown().await;
    assert!(!th.host.is_loaded(&pay));
    assert!(!th.host.is_loaded(&sms));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(th.launcher.launch_count(), launches);
}

#[tokio::test]
async fn test_start_enabled_loads_enabled_rows() {
    let th = test_host();
    let key = th
        .enable_plugin(PluginCategory::Payment, payment_plugin("mockpay"), json!({"merchant_id": "m-1"}))
        .await;
    th.host.unload(&key).await;
    assert!(!th.host.is_loaded(&key));

    th.host.start_enabled().await.unwrap();
    assert!(th.host.is_loaded(&key));
}
