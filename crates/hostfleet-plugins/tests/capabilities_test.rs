// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the payment registry and the KYC, SMS and automation clients.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::*;
use hostfleet_core::Error;
use hostfleet_core::automation::AutomationResolver;
use hostfleet_core::domain::{GoodsType, InstanceKey, PluginCategory};
use hostfleet_core::kyc::{KycProviderRegistry, PendingOutcome, PendingReason, VerifyInput};
use hostfleet_core::payment::PaymentProviderRegistry;
use hostfleet_core::settings::{SettingsReader, keys};
use hostfleet_core::sms::SmsSender;
use hostfleet_core::store::CatalogRepository;
use hostfleet_plugins::{
    PluginAutomationResolver, PluginKycRegistry, PluginPaymentRegistry, PluginSmsSender,
};
use hostfleet_protocol::messages::{
    KycResultStatus, KycStartResult, PaymentCreateRequest, RawHttpRequest, SmsSendRequest,
};
use serde_json::json;

async fn two_gateways(th: &TestHost) -> (Arc<FakePlugin>, Arc<FakePlugin>) {
    let a = FakePlugin::new(payment_manifest("alpay", &["alipay_qr", "shared"]));
    let b = FakePlugin::new(payment_manifest("bpay", &["shared", "wechat", "bad.method", "balance"]));
    th.enable_plugin(PluginCategory::Payment, a.clone(), json!({"k": "a"})).await;
    th.enable_plugin(PluginCategory::Payment, b.clone(), json!({"k": "b"})).await;
    (a, b)
}

#[tokio::test]
async fn test_payment_methods_listed_by_key() {
    let th = test_host();
    two_gateways(&th).await;
    let registry = PluginPaymentRegistry::new(th.host.clone());

    let providers = registry.list_providers(false).await.unwrap();
    let keys: Vec<_> = providers.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, ["alipay_qr", "shared", "wechat"]);

    // The first instance by plugin id owns a shared method.
    let shared = providers.iter().find(|p| p.key == "shared").unwrap();
    assert_eq!(shared.plugin_id, "alpay");
    assert_eq!(shared.instance_id, "default");
    assert!(shared.enabled);
}

#[tokio::test]
async fn test_payment_provider_calls_plugin() {
    let th = test_host();
    let (_, b) = two_gateways(&th).await;
    let registry = PluginPaymentRegistry::new(th.host.clone());

    let provider = registry.get_provider("wechat").await.unwrap();
    assert_eq!(provider.key(), "wechat");
    assert_eq!(provider.name(), "bpay plugin");

    let created = provider
        .create_payment(PaymentCreateRequest {
            order_no: "ORD-1".into(),
            amount: 1000,
            currency: "CNY".into(),
            subject: "VPS".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.trade_no, "T-ORD-1");
    assert_eq!(created.pay_url, "https://pay.example/wechat/ORD-1");
    assert_eq!(b.called("CreatePayment"), 1);

    let notify = provider
        .verify_notify(RawHttpRequest {
            method: "POST".into(),
            path: "/api/v1/payments/notify/wechat".into(),
            body: json!({"order_no": "ORD-1", "trade_no": "T-ORD-1", "amount": 1000}).to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(notify.is_paid());
    assert_eq!(notify.order_no, "ORD-1");
    assert_eq!(notify.amount, 1000);

    let queried = provider.query_payment("ORD-1", "T-ORD-1").await.unwrap();
    assert_eq!(queried.status, "paid");

    // Refund is not implemented by the fake gateway.
    let err = provider.refund(Default::default()).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)), "{err:?}");
}

#[tokio::test]
async fn test_payment_method_lookup_errors() {
    let th = test_host();
    let (a, _) = two_gateways(&th).await;
    let registry = PluginPaymentRegistry::new(th.host.clone());

    let err = registry.get_provider("paypal").await.err().unwrap();
    assert!(matches!(err, Error::NotFound(_)));
    let err = registry.get_provider("bad.method").await.err().unwrap();
    assert!(matches!(err, Error::NotFound(_)));
    let err = registry.get_provider("balance").await.err().unwrap();
    assert!(matches!(err, Error::NotFound(_)));

    // Switched off per method.
    registry.update_provider_config("wechat", false, "").await.unwrap();
    let err = registry.get_provider("wechat").await.err().unwrap();
    assert!(matches!(err, Error::Forbidden(_)), "{err:?}");
    assert!(
        !registry
            .list_providers(false)
            .await
            .unwrap()
            .iter()
            .any(|p| p.key == "wechat")
    );
    let all = registry.list_providers(true).await.unwrap();
    assert!(all.iter().any(|p| p.key == "wechat" && !p.enabled));

    // Enabled but not running.
    let key = InstanceKey::new(PluginCategory::Payment, "alpay", "default");
    th.host.unload(&key).await;
    let err = registry.get_provider("alipay_qr").await.err().unwrap();
    assert!(err.is_transient(), "{err:?}");
    assert_eq!(a.called("CreatePayment"), 0);
}

#[tokio::test]
async fn test_disabled_instance_owns_method_only_as_fallback() {
    let th = test_host();
    let (_, _) = two_gateways(&th).await;
    let alpay = InstanceKey::new(PluginCategory::Payment, "alpay", "default");
    th.host.disable_instance(&alpay).await.unwrap();
    let registry = PluginPaymentRegistry::new(th.host.clone());

    // bpay is enabled and takes over the shared method.
    let providers = registry.list_providers(true).await.unwrap();
    let shared = providers.iter().find(|p| p.key == "shared").unwrap();
    assert_eq!(shared.plugin_id, "bpay");
    assert!(shared.enabled);

    // alipay_qr has no enabled owner.
    let err = registry.get_provider("alipay_qr").await.err().unwrap();
    assert!(matches!(err, Error::Forbidden(_)), "{err:?}");
}

#[tokio::test]
async fn test_payment_provider_config_round_trip() {
    let th = test_host();
    two_gateways(&th).await;
    let registry = PluginPaymentRegistry::new(th.host.clone());

    let (config, enabled) = registry.get_provider_config("wechat").await.unwrap();
    assert!(enabled);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&config).unwrap(), json!({"k": "b"}));

    registry
        .update_provider_config("wechat", true, &json!({"k": "b2"}).to_string())
        .await
        .unwrap();
    let (config, enabled) = registry.get_provider_config("wechat").await.unwrap();
    assert!(enabled);
    assert!(config.contains("b2"));
}

fn verify_input() -> VerifyInput {
    let mut extra = BTreeMap::new();
    extra.insert("user_id".to_string(), "42".to_string());
    VerifyInput {
        real_name: "Zhang San".into(),
        id_number: "11010519491231002X".into(),
        phone: "13800000000".into(),
        callback_url: String::new(),
        extra,
    }
}

#[tokio::test]
async fn test_kyc_registry_lists_builtin_and_plugins() {
    let th = test_host();
    th.enable_plugin(PluginCategory::Kyc, FakePlugin::new(kyc_manifest("faceid")), json!({}))
        .await;
    let registry = PluginKycRegistry::new(th.host.clone());

    let keys: Vec<String> = registry
        .list_providers()
        .await
        .iter()
        .map(|p| p.key().to_string())
        .collect();
    assert_eq!(keys, ["idcard_cn", "plugin/faceid/default"]);

    assert!(registry.get_provider("idcard_cn").await.is_ok());
    assert!(matches!(
        registry.get_provider("plugin/missing/default").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(registry.get_provider("faceid").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_kyc_redirect_becomes_pending_face() {
    let th = test_host();
    let plugin = FakePlugin::new(kyc_manifest("faceid"));
    th.enable_plugin(PluginCategory::Kyc, plugin.clone(), json!({})).await;
    *plugin.kyc_start.lock() = KycStartResult {
        ok: true,
        token: "tk-1".into(),
        url: "https://face.example/check/tk-1".into(),
        next_step: "redirect".into(),
        error: String::new(),
    };
    let registry = PluginKycRegistry::new(th.host.clone());
    let provider = registry.get_provider("plugin/faceid/default").await.unwrap();

    let verdict = provider.verify(&verify_input()).await.unwrap();
    assert!(!verdict.ok);
    assert_eq!(
        PendingReason::parse(&verdict.reason),
        Some(PendingReason::PendingFace {
            channel: "plugin/faceid/default".into(),
            token: "tk-1".into(),
            url: Some("https://face.example/check/tk-1".into()),
        })
    );
    assert_eq!(plugin.called("QueryResult"), 0);

    *plugin.kyc_status.lock() = KycResultStatus::Verified;
    let (outcome, _) = provider.query_pending("tk-1", "plugin/faceid/default").await.unwrap();
    assert_eq!(outcome, PendingOutcome::Verified);
}

#[tokio::test]
async fn test_kyc_token_is_queried_once() {
    let th = test_host();
    let plugin = FakePlugin::new(kyc_manifest("faceid"));
    th.enable_plugin(PluginCategory::Kyc, plugin.clone(), json!({})).await;
    *plugin.kyc_start.lock() = KycStartResult {
        ok: true,
        token: "tk-2".into(),
        next_step: "query_result".into(),
        ..Default::default()
    };
    let registry = PluginKycRegistry::new(th.host.clone());
    let provider = registry.get_provider("plugin/faceid/default").await.unwrap();

    *plugin.kyc_status.lock() = KycResultStatus::Pending;
    let verdict = provider.verify(&verify_input()).await.unwrap();
    assert_eq!(
        PendingReason::parse(&verdict.reason),
        Some(PendingReason::Pending { token: "tk-2".into() })
    );

    *plugin.kyc_status.lock() = KycResultStatus::Failed;
    let verdict = provider.verify(&verify_input()).await.unwrap();
    assert!(!verdict.ok);
    assert_eq!(verdict.reason, "face mismatch");

    *plugin.kyc_status.lock() = KycResultStatus::Verified;
    assert!(provider.verify(&verify_input()).await.unwrap().ok);

    *plugin.kyc_start.lock() = KycStartResult {
        ok: false,
        error: "id number blacklisted".into(),
        ..Default::default()
    };
    let verdict = provider.verify(&verify_input()).await.unwrap();
    assert!(!verdict.ok);
    assert_eq!(verdict.reason, "id number blacklisted");
}

#[tokio::test]
async fn test_sms_uses_selected_plugin() {
    let th = test_host();
    let plugin = FakePlugin::new(sms_manifest("smsx"));
    th.add_plugin(PluginCategory::Sms, plugin.clone()).await;
    let sender = PluginSmsSender::new(th.host.clone());
    let message = SmsSendRequest {
        content: Some("code 1234".into()),
        phones: vec!["13800000000".into(), "13900000000".into()],
        ..Default::default()
    };

    let err = sender.send(message.clone()).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)), "{err:?}");

    let settings = SettingsReader::new(th.store.settings.clone());
    settings.set(keys::SMS_PLUGIN_ID, "smsx").await.unwrap();

    // Loaded on first use.
    assert_eq!(sender.send(message.clone()).await.unwrap(), "msg-2");
    assert_eq!(plugin.called("Send"), 1);

    plugin.sms_ok.store(false, Ordering::SeqCst);
    let err = sender.send(message).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(ref m) if m.contains("quota exceeded")), "{err:?}");

    let err = sender.send(SmsSendRequest::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_automation_resolver_binds_goods_type() {
    let th = test_host();
    th.store
        .catalog
        .create_goods_type(GoodsType {
            id: 0,
            code: "vps".into(),
            name: "Cloud VPS".into(),
            active: true,
            sort_order: 1,
            automation_category: String::new(),
            automation_plugin_id: "lightboat".into(),
            automation_instance_id: String::new(),
        })
        .await
        .unwrap();
    let resolver = PluginAutomationResolver::new(th.host.clone(), th.store.catalog.clone());

    // Not loaded yet.
    let err = resolver.client_for_goods_type(0).await.err().unwrap();
    assert!(matches!(err, Error::InvalidInput(_)), "{err:?}");

    th.enable_plugin(
        PluginCategory::Automation,
        FakePlugin::new(automation_manifest("lightboat")),
        json!({"base_url": "https://panel.example", "api_key": "k"}),
    )
    .await;

    let client = resolver.client_for_goods_type(0).await.unwrap();
    let info = client.get_host_info(7).await.unwrap();
    assert_eq!(info.host_name, "vps-7");
    assert_eq!(info.state, 2);

    client.lock_host(7).await.unwrap();
    let err = client.unlock_host(7).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(ref m) if m.contains("host busy")), "{err:?}");
    let err = client.reboot_host(7).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)), "{err:?}");
}
