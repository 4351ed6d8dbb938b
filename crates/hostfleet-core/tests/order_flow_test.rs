// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end order flows across pricing, payment, provisioning and events.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::TestContext;
use hostfleet_core::Error;
use hostfleet_core::domain::{
    CartSpec, DiscountScope, OrderStatus, TierDiscountRule, TierGroup,
    VerificationStatus, VpsInstance, VpsStatus, event_types,
};
use hostfleet_core::kyc::{
    KycProvider, KycVerdict, PendingOutcome, PendingReason, StaticKycRegistry, VerifyInput,
};
use hostfleet_core::orders::ResizeTarget;
use hostfleet_core::settings::keys;

async fn running_vps(ctx: &TestContext, user_id: i64) -> VpsInstance {
    ctx.fund(user_id, 1000).await;
    let created = ctx
        .orders
        .instant_create(user_id, &[ctx.line()], "", "")
        .await
        .expect("instant create");
    ctx.orders.approve(1, created.order.id).await.expect("approve");
    assert_eq!(ctx.engine.run_provision_jobs().await.unwrap(), 1);
    let items = ctx.store.orders.list_order_items(created.order.id).await.unwrap();
    let vps = ctx
        .store
        .vps
        .get_instance(items[0].vps_id.expect("vps linked"))
        .await
        .unwrap();
    assert_eq!(vps.status, VpsStatus::Running);
    vps
}

#[tokio::test]
async fn test_free_tier_package_is_created_without_payment() {
    let ctx = TestContext::new().await;
    let user = ctx.user("freebie").await;

    let now = Utc::now();
    let group = ctx
        .tier
        .create_group(
            1,
            TierGroup {
                id: 0,
                name: "Partners".into(),
                color: String::new(),
                icon: String::new(),
                priority: 10,
                auto_approve_enabled: true,
                is_default: false,
                created_at: now,
                updated_at: now,
            },
        )
        .await
        .unwrap();
    ctx.tier
        .create_discount_rule(
            1,
            TierDiscountRule {
                id: 0,
                group_id: group.id,
                scope: DiscountScope::Package,
                goods_type_id: 0,
                region_id: 0,
                plan_group_id: 0,
                package_id: ctx.package.id,
                discount_permille: 0,
                fixed_price: Some(0),
                add_core_permille: 0,
                add_mem_permille: 0,
                add_disk_permille: 0,
                add_bw_permille: 0,
                created_at: now,
                updated_at: now,
            },
        )
        .await
        .unwrap();
    ctx.tier.set_user_group(1, user.id, group.id, None).await.unwrap();
    ctx.tier.rebuild_group_cache(group.id).await.unwrap();

    let created = ctx
        .orders
        .instant_create(user.id, &[ctx.line()], "free-1", "")
        .await
        .unwrap();
    assert_eq!(created.order.total_amount, 0);
    assert!(created.payment.paid);
    assert_eq!(ctx.wallet.balance(user.id).await.unwrap(), 0);

    let order = ctx.store.orders.get_order(created.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Provisioning);
    assert_eq!(ctx.engine.run_provision_jobs().await.unwrap(), 1);
    let order = ctx.store.orders.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Active);
    assert_eq!(ctx.automation.called("create_host"), 1);
}

#[tokio::test]
async fn test_insufficient_balance_rolls_back_order() {
    let ctx = TestContext::sqlite().await;
    let user = ctx.user("broke").await;
    ctx.fund(user.id, 300).await;

    let result = ctx.orders.instant_create(user.id, &[ctx.line()], "k-1", "").await;
    assert!(matches!(result, Err(Error::InsufficientBalance)));
    assert_eq!(ctx.store.orders.count_user_orders(user.id).await.unwrap(), 0);
    assert_eq!(ctx.wallet.balance(user.id).await.unwrap(), 300);

    // The idempotency key is free again after the rollback.
    ctx.fund(user.id, 700).await;
    let created = ctx
        .orders
        .instant_create(user.id, &[ctx.line()], "k-1", "")
        .await
        .unwrap();
    assert!(created.payment.paid);
    assert_eq!(ctx.wallet.balance(user.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_resize_requests_are_exclusive() {
    let ctx = TestContext::new().await;
    let user = ctx.user("grower").await;
    let vps = running_vps(&ctx, user.id).await;

    let target = ResizeTarget {
        package_id: None,
        spec: CartSpec {
            add_cores: 1,
            ..Default::default()
        },
    };
    let (a, b) = tokio::join!(
        ctx.orders.create_resize_order(user.id, vps.id, &target),
        ctx.orders.create_resize_order(user.id, vps.id, &target),
    );
    let results = [a, b];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(Error::ResizeInProgress)))
        .count();
    assert_eq!((ok, busy), (1, 1));

    // Still blocked while the first order is open.
    assert!(matches!(
        ctx.orders.create_resize_order(user.id, vps.id, &target).await,
        Err(Error::ResizeInProgress)
    ));
}

#[tokio::test]
async fn test_resize_disabled_by_setting() {
    let ctx = TestContext::new().await;
    let user = ctx.user("grower").await;
    let vps = running_vps(&ctx, user.id).await;
    ctx.settings.set(keys::RESIZE_ENABLED, "false").await.unwrap();

    let target = ResizeTarget {
        package_id: None,
        spec: CartSpec {
            add_cores: 1,
            ..Default::default()
        },
    };
    assert!(matches!(
        ctx.orders.quote_resize(user.id, vps.id, &target).await,
        Err(Error::ResizeDisabled)
    ));
}

#[tokio::test]
async fn test_sse_replays_missed_events_then_streams_live() {
    let ctx = TestContext::new().await;
    let user = ctx.user("watcher").await;
    ctx.fund(user.id, 1000).await;
    let created = ctx
        .orders
        .instant_create(user.id, &[ctx.line()], "", "")
        .await
        .unwrap();
    let order_id = created.order.id;

    let history = ctx.events.events_after(order_id, 0, 100).await.unwrap();
    assert!(history.len() >= 2, "{history:?}");
    assert_eq!(history[0].seq, 1);
    assert_eq!(history[0].event_type, event_types::ORDER_CREATED);

    let mut out = Vec::new();
    let cancel = CancellationToken::new();
    let live = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.events
            .publish(order_id, "order.note", &json!({ "text": "line one\nline two" }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (streamed, _) = tokio::join!(
        ctx.events.stream(order_id, 1, &mut out, cancel.clone()),
        live
    );
    streamed.unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(!text.contains("id: 1\n"), "{text}");
    assert!(text.contains("id: 2\n"), "{text}");
    let live_seq = history.len() + 1;
    assert!(text.contains(&format!("id: {live_seq}\nevent: order.note\n")), "{text}");
    assert_eq!(ctx.events.subscriber_count(order_id), 0);
}

/// Parks every attempt, then reports whatever `answer` holds.
struct FaceCheck {
    answer: Mutex<PendingOutcome>,
}

#[async_trait]
impl KycProvider for FaceCheck {
    fn key(&self) -> &str {
        "face"
    }

    fn name(&self) -> &str {
        "Face check"
    }

    async fn verify(&self, input: &VerifyInput) -> hostfleet_core::Result<KycVerdict> {
        Ok(KycVerdict::pending(PendingReason::PendingFace {
            channel: "h5".into(),
            token: format!("face-{}", input.id_number),
            url: Some("https://kyc.test/face".into()),
        }))
    }

    async fn query_pending(
        &self,
        token: &str,
        channel: &str,
    ) -> hostfleet_core::Result<(PendingOutcome, String)> {
        assert_eq!(channel, "h5");
        assert!(token.starts_with("face-"));
        Ok((*self.answer.lock(), String::new()))
    }
}

#[tokio::test]
async fn test_pending_kyc_unblocks_purchase_once_verified() {
    let provider = Arc::new(FaceCheck {
        answer: Mutex::new(PendingOutcome::Pending),
    });
    let registry = StaticKycRegistry::new();
    registry.register(provider.clone());
    let ctx = TestContext::with_kyc(Arc::new(registry)).await;
    ctx.settings.set(keys::REALNAME_ENABLED, "true").await.unwrap();
    ctx.settings.set(keys::REALNAME_PROVIDER, "face").await.unwrap();
    let kyc = ctx.kyc.clone().expect("kyc wired");
    let user = ctx.user("applicant").await;
    ctx.fund(user.id, 1000).await;

    assert!(matches!(
        ctx.orders.instant_create(user.id, &[ctx.line()], "", "").await,
        Err(Error::RealNameRequired)
    ));

    let record = kyc
        .verify(
            user.id,
            VerifyInput {
                real_name: "Wang Wu".into(),
                id_number: "11010519491231002X".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(record.status, VerificationStatus::Pending);
    assert_eq!(kyc.poll_pending(0).await.unwrap(), 0);
    assert!(matches!(
        ctx.orders.instant_create(user.id, &[ctx.line()], "", "").await,
        Err(Error::RealNameRequired)
    ));

    *provider.answer.lock() = PendingOutcome::Verified;
    assert_eq!(kyc.poll_pending(0).await.unwrap(), 1);
    let latest = kyc.latest(user.id).await.unwrap().unwrap();
    assert_eq!(latest.status, VerificationStatus::Verified);

    let created = ctx
        .orders
        .instant_create(user.id, &[ctx.line()], "", "")
        .await
        .unwrap();
    assert!(created.payment.paid);
    assert_eq!(created.order.status, OrderStatus::PendingReview);
}
