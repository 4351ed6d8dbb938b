// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for plugin host integration tests.
//!
//! Plugins are [`FakePlugin`] handlers served by [`MockLauncher`]; their
//! directories (manifest plus a placeholder executable) live in a temp dir.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hostfleet_core::Store;
use hostfleet_core::domain::{DEFAULT_INSTANCE_ID, InstanceKey, PluginCategory};
use hostfleet_core::secrets::ConfigCipher;
use hostfleet_plugins::{InstallPolicy, MockLauncher, PluginHost, PluginHostConfig};
use hostfleet_protocol::manifest::{
    AutomationCapability, Capabilities, KycCapability, PaymentCapability, SmsCapability,
};
use hostfleet_protocol::messages::{
    Ack, ConfigRequest, ConfigSchema, HealthState, HealthStatus, HostInfo, HostRef, InitRequest,
    KycQueryResult, KycResultStatus, KycStartRequest, KycStartResult, NotifyResult,
    PaymentCreateRequest, PaymentCreateResult, PaymentQueryResult, SmsSendRequest, SmsSendResult,
    VerifyNotifyRequest,
};
use hostfleet_protocol::{
    PluginHandler, PluginManifest, RpcError, Service, decode_params, encode_result, methods,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Schema with one required field and one secret.
pub const PAYMENT_SCHEMA: &str = r#"{"type":"object","required":["merchant_id"],"properties":{"merchant_id":{"type":"string"},"secret_key":{"type":"string","format":"password"}}}"#;

pub fn manifest(plugin_id: &str, capabilities: Capabilities) -> PluginManifest {
    PluginManifest {
        plugin_id: plugin_id.to_string(),
        name: format!("{plugin_id} plugin"),
        version: "1.0.0".to_string(),
        description: String::new(),
        binaries: BTreeMap::new(),
        capabilities,
    }
}

pub fn payment_manifest(plugin_id: &str, payment_methods: &[&str]) -> PluginManifest {
    manifest(plugin_id, Capabilities {
        payment: Some(PaymentCapability {
            methods: payment_methods.iter().map(|m| m.to_string()).collect(),
        }),
        ..Default::default()
    })
}

pub fn kyc_manifest(plugin_id: &str) -> PluginManifest {
    manifest(plugin_id, Capabilities {
        kyc: Some(KycCapability {
            start: true,
            query_result: true,
        }),
        ..Default::default()
    })
}

pub fn sms_manifest(plugin_id: &str) -> PluginManifest {
    manifest(plugin_id, Capabilities {
        sms: Some(SmsCapability { send: true }),
        ..Default::default()
    })
}

pub fn automation_manifest(plugin_id: &str) -> PluginManifest {
    manifest(plugin_id, Capabilities {
        automation: Some(AutomationCapability {
            features: vec!["lifecycle".to_string()],
            not_supported_reasons: BTreeMap::new(),
        }),
        ..Default::default()
    })
}

/// Configurable in-process plugin.
pub struct FakePlugin {
    pub manifest: PluginManifest,
    pub schema: String,
    pub init_ok: AtomicBool,
    pub reload_ok: AtomicBool,
    pub health: Mutex<HealthState>,
    pub health_delay: Mutex<Duration>,
    pub kyc_start: Mutex<KycStartResult>,
    pub kyc_status: Mutex<KycResultStatus>,
    pub sms_ok: AtomicBool,
    /// Config seen by the last `Init` or `ReloadConfig`.
    pub active_config: Mutex<String>,
    pub calls: Mutex<Vec<String>>,
    pub inits: AtomicUsize,
}

impl FakePlugin {
    pub fn new(manifest: PluginManifest) -> Arc<Self> {
        Arc::new(Self {
            manifest,
            schema: r#"{"type":"object","properties":{}}"#.to_string(),
            init_ok: AtomicBool::new(true),
            reload_ok: AtomicBool::new(true),
            health: Mutex::new(HealthState::Ok),
            health_delay: Mutex::new(Duration::ZERO),
            kyc_start: Mutex::new(KycStartResult {
                ok: true,
                ..Default::default()
            }),
            kyc_status: Mutex::new(KycResultStatus::Verified),
            sms_ok: AtomicBool::new(true),
            active_config: Mutex::new(String::new()),
            calls: Mutex::new(Vec::new()),
            inits: AtomicUsize::new(0),
        })
    }

    pub fn with_schema(manifest: PluginManifest, schema: &str) -> Arc<Self> {
        let mut plugin = Self::new(manifest);
        if let Some(p) = Arc::get_mut(&mut plugin) {
            p.schema = schema.to_string();
        }
        plugin
    }

    pub fn called(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| *m == method).count()
    }
}

#[async_trait]
impl PluginHandler for FakePlugin {
    async fn handle(&self, service: Service, method: &str, params: Value) -> Result<Value, RpcError> {
        self.calls.lock().push(method.to_string());
        match (service, method) {
            (Service::Core, methods::GET_MANIFEST) => encode_result(&self.manifest),
            (Service::Core, methods::GET_CONFIG_SCHEMA) => encode_result(&ConfigSchema {
                json_schema: self.schema.clone(),
                ui_schema: "{}".to_string(),
            }),
            (Service::Core, methods::VALIDATE_CONFIG) => {
                let req: ConfigRequest = decode_params(params)?;
                if req.config_json.contains("\"rejected\"") {
                    return encode_result(&Ack::fail("merchant_id rejected by gateway"));
                }
                encode_result(&Ack::ok())
            }
            (Service::Core, methods::INIT) => {
                let req: InitRequest = decode_params(params)?;
                self.inits.fetch_add(1, Ordering::SeqCst);
                if !self.init_ok.load(Ordering::SeqCst) {
                    return encode_result(&Ack::fail("bad credentials"));
                }
                *self.active_config.lock() = req.config_json;
                encode_result(&Ack::ok())
            }
            (Service::Core, methods::RELOAD_CONFIG) => {
                let req: ConfigRequest = decode_params(params)?;
                if !self.reload_ok.load(Ordering::SeqCst) {
                    return encode_result(&Ack::fail("reload refused"));
                }
                *self.active_config.lock() = req.config_json;
                encode_result(&Ack::ok())
            }
            (Service::Core, methods::HEALTH) => {
                let delay = *self.health_delay.lock();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let status = *self.health.lock();
                encode_result(&HealthStatus {
                    status,
                    message: format!("{status:?}").to_lowercase(),
                    unix_millis: 0,
                })
            }
            (Service::Payment, methods::CREATE_PAYMENT) => {
                let req: PaymentCreateRequest = decode_params(params)?;
                encode_result(&PaymentCreateResult {
                    trade_no: format!("T-{}", req.order_no),
                    pay_url: format!("https://pay.example/{}/{}", req.method, req.order_no),
                    extra: BTreeMap::new(),
                })
            }
            (Service::Payment, methods::VERIFY_NOTIFY) => {
                let req: VerifyNotifyRequest = decode_params(params)?;
                let body: Value = serde_json::from_str(&req.request.body)
                    .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
                encode_result(&NotifyResult {
                    order_no: body["order_no"].as_str().unwrap_or_default().to_string(),
                    trade_no: body["trade_no"].as_str().unwrap_or_default().to_string(),
                    amount: body["amount"].as_i64().unwrap_or_default(),
                    status: "paid".to_string(),
                    ack_body: "success".to_string(),
                    raw_json: req.request.body,
                })
            }
            (Service::Payment, methods::QUERY_PAYMENT) => encode_result(&PaymentQueryResult {
                status: "paid".to_string(),
                amount: 0,
                raw_json: String::new(),
            }),
            (Service::Kyc, methods::KYC_START) => {
                let _req: KycStartRequest = decode_params(params)?;
                encode_result(&*self.kyc_start.lock())
            }
            (Service::Kyc, methods::KYC_QUERY_RESULT) => {
                let status = *self.kyc_status.lock();
                encode_result(&KycQueryResult {
                    ok: true,
                    status,
                    reason: if status == KycResultStatus::Failed {
                        "face mismatch".to_string()
                    } else {
                        String::new()
                    },
                    raw_json: String::new(),
                })
            }
            (Service::Sms, methods::SMS_SEND) => {
                let req: SmsSendRequest = decode_params(params)?;
                if !self.sms_ok.load(Ordering::SeqCst) {
                    return encode_result(&SmsSendResult {
                        ok: false,
                        message_id: String::new(),
                        error: "quota exceeded".to_string(),
                    });
                }
                encode_result(&SmsSendResult {
                    ok: true,
                    message_id: format!("msg-{}", req.phones.len()),
                    error: String::new(),
                })
            }
            (Service::Automation, methods::automation::GET_HOST_INFO) => {
                let req: HostRef = decode_params(params)?;
                encode_result(&HostInfo {
                    host_id: req.host_id,
                    host_name: format!("vps-{}", req.host_id),
                    state: 2,
                    ..Default::default()
                })
            }
            (Service::Automation, methods::automation::LOCK_HOST) => encode_result(&json!({})),
            (Service::Automation, methods::automation::UNLOCK_HOST) => {
                encode_result(&json!({"ok": false, "error": "host busy"}))
            }
            _ => Err(RpcError::unimplemented(method)),
        }
    }
}

/// Write `<root>/<category>/<plugin_id>` with a manifest and a placeholder
/// executable.
pub fn write_plugin_dir(root: &Path, category: PluginCategory, manifest: &PluginManifest) {
    let dir = root.join(category.as_str()).join(&manifest.plugin_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(manifest).unwrap()).unwrap();
    std::fs::write(dir.join("plugin"), b"#!/bin/sh\n").unwrap();
    std::fs::write(dir.join("plugin.exe"), b"MZ").unwrap();
}

pub struct TestHost {
    pub host: Arc<PluginHost>,
    pub launcher: Arc<MockLauncher>,
    pub store: Store,
    pub dir: TempDir,
}

pub fn test_config(plugins_dir: &Path) -> PluginHostConfig {
    PluginHostConfig {
        plugins_dir: plugins_dir.to_path_buf(),
        rpc_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        health_timeout: Duration::from_millis(200),
        max_health_failures: 2,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        stable_after: Duration::from_secs(60),
        init_failure_limit: 2,
        init_failure_window: Duration::from_secs(60),
        install_policy: InstallPolicy {
            allow_unsigned: true,
            ..Default::default()
        },
    }
}

pub fn test_host() -> TestHost {
    let dir = TempDir::new().unwrap();
    let store = Store::in_memory();
    let launcher = Arc::new(MockLauncher::new());
    let host = PluginHost::new(
        test_config(dir.path()),
        &store,
        Arc::new(ConfigCipher::new([7u8; 32])),
        launcher.clone(),
    );
    TestHost {
        host,
        launcher,
        store,
        dir,
    }
}

impl TestHost {
    /// Put `plugin` on disk, register it with the launcher and import its
    /// default instance (disabled).
    pub async fn add_plugin(&self, category: PluginCategory, plugin: Arc<FakePlugin>) -> InstanceKey {
        write_plugin_dir(self.dir.path(), category, &plugin.manifest);
        let services = plugin.manifest.capabilities.services();
        let plugin_id = plugin.manifest.plugin_id.clone();
        self.launcher.register(&plugin_id, plugin, services);
        self.host.import_from_disk(category, &plugin_id).await.unwrap();
        InstanceKey::new(category, &plugin_id, DEFAULT_INSTANCE_ID)
    }

    /// [`TestHost::add_plugin`], then store `config` and enable.
    pub async fn enable_plugin(
        &self,
        category: PluginCategory,
        plugin: Arc<FakePlugin>,
        config: Value,
    ) -> InstanceKey {
        let key = self.add_plugin(category, plugin).await;
        self.host.update_config(&key, &config.to_string()).await.unwrap();
        self.host.enable_instance(&key).await.unwrap();
        key
    }
}

/// Poll `check` every 10ms until it returns true or 5s pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
