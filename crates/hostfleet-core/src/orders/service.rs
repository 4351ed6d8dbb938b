// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order lifecycle: creation, review, payment and the VPS follow-up orders
//! (renew, emergency renew, resize, refund).
//!
//! ```text
//! create ──► pending_review ──approve──► pending_payment ──pay──► approved ──► provisioning ──► active
//!    │              │                                                 ▲                  └──► failed
//!    │              └──reject──► rejected                             │
//!    └── total 0 + tier auto-approve ─────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostfleet_protocol::messages::{NotifyResult, PaymentCreateRequest, RawHttpRequest};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::domain::{
    CartSpec, CreateOrderOptions, ItemAction, Order, OrderItem, OrderStatus, Payment,
    PaymentStatus, RefundSpec, RenewSpec, ResizeSpec, VpsInstance, event_types,
};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::locks::KeyedLocks;
use crate::money::prorate;
use crate::payment::{METHOD_BALANCE, PaymentProviderRegistry};
use crate::provisioning::{EmergencyRenewPolicy, ProvisioningEngine};
use crate::settings::{SettingsReader, keys};
use crate::store::Store;
use crate::wallet::{WalletService, refs};

use super::coupon::CouponEvaluator;
use super::hooks::{ActionGate, NoopTierHooks, OpenGate, TierHooks, actions};
use super::pricing::{OrderLine, Pricer, validate_addons};

/// Order number prefixes by origin.
pub mod prefixes {
    pub const PURCHASE: &str = "ORD";
    pub const RENEW: &str = "REN";
    pub const EMERGENCY_RENEW: &str = "EMR";
    pub const RESIZE: &str = "UPG";
    pub const REFUND: &str = "REF";
}

/// Days granted per renewed month.
pub const DAYS_PER_MONTH: i32 = 30;

const DEFAULT_CURRENCY: &str = "CNY";

fn new_order_no(prefix: &str, user_id: i64) -> String {
    let suffix: u16 = rand::thread_rng().r#gen();
    format!("{prefix}-{user_id}-{}-{suffix:04x}", Utc::now().timestamp())
}

#[derive(Debug, Clone)]
pub struct OrderConfig {
    /// Public base URL gateway callbacks are sent to.
    pub notify_base_url: String,
    /// Where the payer lands after paying.
    pub return_url: String,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            notify_base_url: "http://localhost:8080".to_string(),
            return_url: String::new(),
        }
    }
}

/// Outcome of a payment selection or instant purchase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSelection {
    pub method: String,
    pub paid: bool,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trade_no: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pay_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl PaymentSelection {
    fn settled(method: &str, status: OrderStatus) -> Self {
        Self {
            method: method.to_string(),
            paid: true,
            status,
            trade_no: String::new(),
            pay_url: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectPaymentInput {
    pub method: String,
    #[serde(default)]
    pub return_url: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Order created and settled in one call.
#[derive(Debug, Clone)]
pub struct InstantOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payment: PaymentSelection,
}

/// Requested shape of a resized instance.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResizeTarget {
    /// Package to move to. Defaults to the current one.
    #[serde(default)]
    pub package_id: Option<i64>,
    #[serde(default)]
    pub spec: CartSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResizeQuote {
    pub current_monthly: i64,
    pub target_monthly: i64,
    pub charge_amount: i64,
    pub refund_amount: i64,
    pub spec: ResizeSpec,
}

pub struct OrderService {
    store: Store,
    events: Arc<EventBus>,
    engine: Arc<ProvisioningEngine>,
    wallet: WalletService,
    settings: SettingsReader,
    pricer: Pricer,
    coupons: CouponEvaluator,
    payments: Option<Arc<dyn PaymentProviderRegistry>>,
    tier: Arc<dyn TierHooks>,
    gate: Arc<dyn ActionGate>,
    config: OrderConfig,
    notify_locks: KeyedLocks<(String, String)>,
    vps_locks: KeyedLocks<i64>,
}

impl OrderService {
    pub fn new(store: Store, events: Arc<EventBus>, engine: Arc<ProvisioningEngine>) -> Self {
        let tier: Arc<dyn TierHooks> = Arc::new(NoopTierHooks);
        Self {
            wallet: WalletService::new(store.wallets.clone()),
            settings: SettingsReader::new(store.settings.clone()),
            pricer: Pricer::new(store.catalog.clone(), tier.clone()),
            coupons: CouponEvaluator::new(store.coupons.clone(), store.orders.clone()),
            store,
            events,
            engine,
            payments: None,
            tier,
            gate: Arc::new(OpenGate),
            config: OrderConfig::default(),
            notify_locks: KeyedLocks::new(),
            vps_locks: KeyedLocks::new(),
        }
    }

    pub fn with_tier(mut self, tier: Arc<dyn TierHooks>) -> Self {
        self.pricer = Pricer::new(self.store.catalog.clone(), tier.clone());
        self.tier = tier;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn ActionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_payments(mut self, payments: Arc<dyn PaymentProviderRegistry>) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn with_config(mut self, config: OrderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pricer(&self) -> &Pricer {
        &self.pricer
    }

    async fn publish(&self, order: &Order, event_type: &str, extra: serde_json::Value) {
        let mut payload = json!({
            "order_no": order.order_no,
            "status": order.status,
            "total": order.total_amount,
            "currency": order.currency,
        });
        if let (Some(obj), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            obj.extend(extra);
        }
        if let Err(e) = self.events.publish(order.id, event_type, &payload).await {
            warn!(order_id = order.id, event_type, error = %e, "Failed to publish order event");
        }
    }

    async fn site_currency(&self) -> String {
        self.settings
            .get_string(keys::SITE_CURRENCY, DEFAULT_CURRENCY)
            .await
            .unwrap_or_else(|_| DEFAULT_CURRENCY.to_string())
    }

    /// Order of `user_id`. Other users' orders look missing.
    pub async fn get_user_order(&self, user_id: i64, order_id: i64) -> Result<(Order, Vec<OrderItem>)> {
        let order = self.store.orders.get_order(order_id).await?;
        if order.user_id != user_id {
            return Err(Error::not_found(format!("order {order_id}")));
        }
        let items = self.store.orders.list_order_items(order.id).await?;
        Ok((order, items))
    }

    async fn user_instance(&self, user_id: i64, vps_id: i64) -> Result<VpsInstance> {
        let vps = self.store.vps.get_instance(vps_id).await?;
        if vps.user_id != user_id {
            return Err(Error::not_found(format!("vps {vps_id}")));
        }
        Ok(vps)
    }

    async fn has_approved_payment(&self, order_id: i64) -> Result<bool> {
        Ok(self
            .store
            .payments
            .list_payments_by_order(order_id)
            .await?
            .iter()
            .any(|p| p.status == PaymentStatus::Approved))
    }

    async fn dispatch(&self, order: &Order) {
        if let Err(e) = self.engine.dispatch_order(order.id).await {
            error!(order_id = order.id, order_no = %order.order_no, error = %e, "Dispatch failed");
        }
    }

    // ------------------------------------------------------------------
    // Purchase
    // ------------------------------------------------------------------

    /// Order the contents of the user's cart and empty it.
    pub async fn create_order_from_cart(
        &self,
        user_id: i64,
        currency: &str,
        idem_key: &str,
        coupon_code: &str,
    ) -> Result<(Order, Vec<OrderItem>)> {
        let cart = self.store.carts.list_cart_items(user_id).await?;
        if cart.is_empty() {
            return Err(Error::invalid("cart is empty"));
        }
        let lines: Vec<OrderLine> = cart
            .into_iter()
            .map(|c| OrderLine::new(c.package_id, c.system_id, c.spec, c.qty))
            .collect();
        self.create_purchase(user_id, "cart", currency, &lines, idem_key, coupon_code, true)
            .await
    }

    pub async fn create_order_from_items(
        &self,
        user_id: i64,
        currency: &str,
        lines: &[OrderLine],
        idem_key: &str,
        coupon_code: &str,
    ) -> Result<(Order, Vec<OrderItem>)> {
        self.create_purchase(user_id, "items", currency, lines, idem_key, coupon_code, false)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_purchase(
        &self,
        user_id: i64,
        source: &str,
        currency: &str,
        lines: &[OrderLine],
        idem_key: &str,
        coupon_code: &str,
        clear_cart: bool,
    ) -> Result<(Order, Vec<OrderItem>)> {
        self.gate.require_action(user_id, actions::PURCHASE_VPS).await?;

        let idem_key = idem_key.trim();
        if !idem_key.is_empty() {
            if let Some(existing) = self
                .store
                .orders
                .get_order_by_idempotency_key(user_id, idem_key)
                .await?
            {
                debug!(user_id, order_id = existing.id, "Idempotent order replay");
                let items = self.store.orders.list_order_items(existing.id).await?;
                return Ok((existing, items));
            }
        }
        if lines.is_empty() {
            return Err(Error::invalid("order has no items"));
        }

        let mut priced = Vec::with_capacity(lines.len());
        for line in lines {
            priced.push(self.pricer.price_line(user_id, line).await?);
        }
        let subtotal: i64 = priced.iter().map(|p| p.total()).sum();
        let coupon = match coupon_code.trim() {
            "" => None,
            code => Some(self.coupons.evaluate(user_id, code, &priced).await?),
        };
        let discount = coupon.as_ref().map_or(0, |c| c.discount);
        let total = (subtotal - discount).max(0);

        let currency = match currency.trim() {
            "" => self.site_currency().await,
            c => c.to_ascii_uppercase(),
        };
        let mut order = Order::new(user_id, new_order_no(prefixes::PURCHASE, user_id), source, &currency);
        order.total_amount = total;
        order.idempotency_key = idem_key.to_string();
        if let Some(c) = &coupon {
            order.coupon_id = Some(c.coupon_id);
            order.coupon_code = c.code.clone();
            order.coupon_discount = c.discount;
        }
        let auto = total == 0 && self.tier.auto_approve(user_id).await.unwrap_or(false);
        if auto {
            order.status = OrderStatus::Approved;
            order.approved_at = Some(Utc::now());
        }

        let mut items = Vec::new();
        for p in &priced {
            for _ in 0..p.line.qty {
                let mut item = OrderItem::new(
                    ItemAction::Create,
                    p.package.id,
                    p.package.goods_type_id,
                    p.unit_total,
                );
                item.system_id = p.line.system_id;
                item.spec_json = serde_json::to_string(&p.line.spec)?;
                item.duration_months = p.months;
                items.push(item);
            }
        }

        let opts = CreateOrderOptions {
            clear_cart_of: clear_cart.then_some(user_id),
            coupon_id: coupon.as_ref().map(|c| c.coupon_id),
        };
        let (order, items) = match self.store.orders.create_order_with_items(order, items, opts).await {
            Ok(created) => created,
            Err(Error::Conflict(msg)) if !idem_key.is_empty() => {
                // Lost a race against the same key.
                let Some(existing) = self
                    .store
                    .orders
                    .get_order_by_idempotency_key(user_id, idem_key)
                    .await?
                else {
                    return Err(Error::Conflict(msg));
                };
                let items = self.store.orders.list_order_items(existing.id).await?;
                return Ok((existing, items));
            }
            Err(e) => return Err(e),
        };
        info!(
            user_id,
            order_id = order.id,
            order_no = %order.order_no,
            total = order.total_amount,
            items = items.len(),
            status = %order.status,
            "Order created"
        );

        self.publish(&order, event_types::ORDER_CREATED, json!({ "items": items.len() }))
            .await;
        if order.status == OrderStatus::Approved {
            self.publish(&order, event_types::ORDER_APPROVED, json!({ "auto": true }))
                .await;
            self.dispatch(&order).await;
        } else {
            self.publish(&order, event_types::ORDER_PENDING_REVIEW, json!({}))
                .await;
        }
        Ok((order, items))
    }

    /// Create an order and settle it from the wallet right away. When the
    /// wallet is short the order is removed again.
    pub async fn instant_create(
        &self,
        user_id: i64,
        lines: &[OrderLine],
        idem_key: &str,
        coupon_code: &str,
    ) -> Result<InstantOrder> {
        let (order, items) = self
            .create_order_from_items(user_id, "", lines, idem_key, coupon_code)
            .await?;

        if order.total_amount <= 0 {
            return Ok(InstantOrder {
                payment: PaymentSelection::settled(METHOD_BALANCE, order.status),
                order,
                items,
            });
        }
        let paid = self.has_approved_payment(order.id).await?;
        if paid || !order.status.is_open() {
            // Replayed key of an order that is already settled.
            let payment = PaymentSelection {
                paid,
                ..PaymentSelection::settled(METHOD_BALANCE, order.status)
            };
            return Ok(InstantOrder {
                order,
                items,
                payment,
            });
        }

        match self.pay_with_balance(&order).await {
            Ok(order) => Ok(InstantOrder {
                payment: PaymentSelection::settled(METHOD_BALANCE, order.status),
                order,
                items,
            }),
            Err(Error::InsufficientBalance) => {
                if let Err(e) = self.store.orders.delete_order(order.id).await {
                    error!(order_id = order.id, error = %e, "Failed to roll back unpaid order");
                }
                info!(user_id, order_no = %order.order_no, "Order rolled back, balance too low");
                Err(Error::InsufficientBalance)
            }
            Err(e) => Err(e),
        }
    }

    /// Debit the wallet for `order` and record the payment.
    async fn pay_with_balance(&self, order: &Order) -> Result<Order> {
        self.wallet
            .debit(
                order.user_id,
                order.total_amount,
                refs::ORDER,
                order.id,
                &format!("order {}", order.order_no),
            )
            .await?;
        let now = Utc::now();
        let payment = Payment {
            id: 0,
            order_id: order.id,
            user_id: order.user_id,
            method: METHOD_BALANCE.to_string(),
            amount: order.total_amount,
            currency: order.currency.clone(),
            trade_no: format!("BAL-{}", order.order_no),
            status: PaymentStatus::Approved,
            idempotency_key: format!("{}:{METHOD_BALANCE}", order.order_no),
            raw_notify_json: String::new(),
            reviewed_by: None,
            reason: String::new(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.payments.create_payment(payment).await {
            error!(order_id = order.id, error = %e, "Balance debited but payment row failed");
        }
        self.mark_paid(order.id, METHOD_BALANCE).await
    }

    /// Move a paid order forward: pending_payment orders are approved and
    /// dispatched, orders still under review wait for the reviewer.
    async fn mark_paid(&self, order_id: i64, method: &str) -> Result<Order> {
        let mut order = self.store.orders.get_order(order_id).await?;
        self.publish(&order, event_types::ORDER_PAID, json!({ "method": method }))
            .await;
        self.tier.on_order_paid(order.user_id).await;

        if order.status == OrderStatus::PendingPayment {
            order.status = OrderStatus::Approved;
            order.approved_at = Some(Utc::now());
            self.store.orders.update_order(&order).await?;
            info!(order_id = order.id, order_no = %order.order_no, method, "Order paid and approved");
            self.publish(&order, event_types::ORDER_APPROVED, json!({})).await;
            self.dispatch(&order).await;
        }
        Ok(order)
    }

    // ------------------------------------------------------------------
    // Review
    // ------------------------------------------------------------------

    /// Reviewer approval. Paid and zero-amount orders are dispatched,
    /// others wait for payment.
    pub async fn approve(&self, admin_id: i64, order_id: i64) -> Result<Order> {
        let mut order = self.store.orders.get_order(order_id).await?;
        if !matches!(
            order.status,
            OrderStatus::PendingReview | OrderStatus::PendingPayment | OrderStatus::Rejected
        ) {
            return Err(Error::conflict(format!(
                "order {} cannot be approved while {}",
                order.order_no, order.status
            )));
        }
        let paid = order.total_amount <= 0 || self.has_approved_payment(order.id).await?;
        order.approved_by = Some(admin_id);
        order.approved_at = Some(Utc::now());
        order.rejected_reason.clear();
        order.status = if paid {
            OrderStatus::Approved
        } else {
            OrderStatus::PendingPayment
        };
        self.store.orders.update_order(&order).await?;
        info!(admin_id, order_id = order.id, status = %order.status, "Order approved");
        self.publish(&order, event_types::ORDER_APPROVED, json!({ "admin_id": admin_id }))
            .await;
        if paid {
            self.dispatch(&order).await;
            return self.store.orders.get_order(order.id).await;
        }
        Ok(order)
    }

    pub async fn reject(&self, admin_id: i64, order_id: i64, reason: &str) -> Result<Order> {
        let mut order = self.store.orders.get_order(order_id).await?;
        if !order.status.is_open() {
            return Err(Error::conflict(format!(
                "order {} cannot be rejected while {}",
                order.order_no, order.status
            )));
        }
        order.status = OrderStatus::Rejected;
        order.rejected_reason = reason.trim().to_string();
        self.store.orders.update_order(&order).await?;
        self.return_balance_payments(&order).await?;
        info!(admin_id, order_id = order.id, reason = %order.rejected_reason, "Order rejected");
        self.publish(&order, event_types::ORDER_REJECTED, json!({ "reason": order.rejected_reason }))
            .await;
        Ok(order)
    }

    /// Owner cancels an order that was not paid yet.
    pub async fn cancel(&self, user_id: i64, order_id: i64) -> Result<Order> {
        let (mut order, _) = self.get_user_order(user_id, order_id).await?;
        if !order.status.is_open() {
            return Err(Error::conflict(format!(
                "order {} cannot be canceled while {}",
                order.order_no, order.status
            )));
        }
        if self.has_approved_payment(order.id).await? {
            return Err(Error::conflict(format!("order {} is already paid", order.order_no)));
        }
        order.status = OrderStatus::Canceled;
        self.store.orders.update_order(&order).await?;
        info!(user_id, order_id = order.id, "Order canceled");
        self.publish(&order, event_types::ORDER_CANCELED, json!({})).await;
        Ok(order)
    }

    async fn return_balance_payments(&self, order: &Order) -> Result<()> {
        for mut payment in self.store.payments.list_payments_by_order(order.id).await? {
            if payment.method != METHOD_BALANCE || payment.status != PaymentStatus::Approved {
                continue;
            }
            self.wallet
                .credit_once(
                    order.user_id,
                    payment.amount,
                    refs::REFUND_ORDER,
                    order.id,
                    &format!("rejected order {}", order.order_no),
                )
                .await?;
            payment.status = PaymentStatus::Refunded;
            self.store.payments.update_payment(&payment).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payment
    // ------------------------------------------------------------------

    pub async fn select_payment(
        &self,
        user_id: i64,
        order_id: i64,
        input: SelectPaymentInput,
    ) -> Result<PaymentSelection> {
        let (order, _) = self.get_user_order(user_id, order_id).await?;
        if order.status != OrderStatus::PendingPayment {
            return Err(Error::conflict(format!(
                "order {} is {}, not awaiting payment",
                order.order_no, order.status
            )));
        }
        let method = input.method.trim();
        if method.is_empty() {
            return Err(Error::invalid("payment method is required"));
        }

        if method == METHOD_BALANCE {
            let order = self.pay_with_balance(&order).await?;
            return Ok(PaymentSelection::settled(METHOD_BALANCE, order.status));
        }

        let registry = self
            .payments
            .as_ref()
            .ok_or_else(|| Error::Unavailable("no payment providers configured".into()))?;
        let provider = registry.get_provider(method).await?;
        let return_url = if input.return_url.is_empty() {
            self.config.return_url.clone()
        } else {
            input.return_url
        };
        let req = PaymentCreateRequest {
            method: method.to_string(),
            order_id: order.id,
            order_no: order.order_no.clone(),
            user_id,
            amount: order.total_amount,
            currency: order.currency.clone(),
            subject: format!("Order {}", order.order_no),
            return_url,
            notify_url: format!(
                "{}/api/v1/payments/notify/{}",
                self.config.notify_base_url.trim_end_matches('/'),
                urlencoding::encode(method)
            ),
            extra: input.extra,
        };
        let created = provider.create_payment(req).await?;

        let now = Utc::now();
        let payment = Payment {
            id: 0,
            order_id: order.id,
            user_id,
            method: method.to_string(),
            amount: order.total_amount,
            currency: order.currency.clone(),
            trade_no: created.trade_no.clone(),
            status: PaymentStatus::Pending,
            idempotency_key: format!("{}:{method}:{}", order.order_no, now.timestamp_millis()),
            raw_notify_json: String::new(),
            reviewed_by: None,
            reason: String::new(),
            created_at: now,
            updated_at: now,
        };
        match self.store.payments.create_payment(payment).await {
            Ok(p) => debug!(order_id = order.id, payment_id = p.id, method, "Payment pending"),
            // Provider handed out a trade number we already track.
            Err(Error::Conflict(_)) => debug!(order_id = order.id, method, "Payment already tracked"),
            Err(e) => return Err(e),
        }
        Ok(PaymentSelection {
            method: method.to_string(),
            paid: false,
            status: order.status,
            trade_no: created.trade_no,
            pay_url: created.pay_url,
            extra: created.extra,
        })
    }

    /// Handle a gateway callback. Repeated notifications of one
    /// `(method, trade_no)` are applied once. A notify without a trade number
    /// matches the order's existing payment for `method`.
    pub async fn handle_notify(&self, method: &str, raw: RawHttpRequest) -> Result<NotifyResult> {
        let registry = self
            .payments
            .as_ref()
            .ok_or_else(|| Error::Unavailable("no payment providers configured".into()))?;
        let provider = registry.get_provider(method).await?;
        let result = provider.verify_notify(raw).await?;
        if !result.is_paid() {
            debug!(method, order_no = %result.order_no, status = %result.status, "Notify without payment");
            return Ok(result);
        }
        if result.trade_no.is_empty() && result.order_no.is_empty() {
            return Err(Error::invalid("notify carries neither trade_no nor order_no"));
        }

        let lock_key = if result.trade_no.is_empty() {
            format!("order:{}", result.order_no)
        } else {
            result.trade_no.clone()
        };
        let _guard = self.notify_locks.lock((method.to_string(), lock_key)).await;

        let existing = if result.trade_no.is_empty() {
            let order = self.store.orders.get_order_by_no(&result.order_no).await?;
            let mut payments: Vec<Payment> = self
                .store
                .payments
                .list_payments_by_order(order.id)
                .await?
                .into_iter()
                .filter(|p| p.method == method)
                .collect();
            // Approved first, then newest.
            payments.sort_by_key(|p| {
                (p.status != PaymentStatus::Approved, std::cmp::Reverse(p.id))
            });
            payments.into_iter().next()
        } else {
            self.store
                .payments
                .get_payment_by_trade_no(method, &result.trade_no)
                .await?
        };
        let mut payment = match existing {
            Some(p) => p,
            None => {
                let order = self.store.orders.get_order_by_no(&result.order_no).await?;
                let now = Utc::now();
                self.store
                    .payments
                    .create_payment(Payment {
                        id: 0,
                        order_id: order.id,
                        user_id: order.user_id,
                        method: method.to_string(),
                        amount: if result.amount > 0 { result.amount } else { order.total_amount },
                        currency: order.currency.clone(),
                        trade_no: result.trade_no.clone(),
                        status: PaymentStatus::Pending,
                        idempotency_key: format!("{}:{method}:{}", order.order_no, result.trade_no),
                        raw_notify_json: String::new(),
                        reviewed_by: None,
                        reason: String::new(),
                        created_at: now,
                        updated_at: now,
                    })
                    .await?
            }
        };
        if payment.status == PaymentStatus::Approved {
            debug!(method, trade_no = %result.trade_no, "Duplicate notify ignored");
            return Ok(result);
        }

        let order = self.store.orders.get_order(payment.order_id).await?;
        if result.amount > 0 && result.amount != order.total_amount {
            warn!(
                order_id = order.id,
                expected = order.total_amount,
                notified = result.amount,
                "Notified amount differs from order total"
            );
            return Err(Error::conflict(format!(
                "notified amount {} does not match order {}",
                result.amount, order.order_no
            )));
        }

        payment.status = PaymentStatus::Approved;
        payment.raw_notify_json = result.raw_json.clone();
        self.store.payments.update_payment(&payment).await?;
        info!(order_id = order.id, method, trade_no = %payment.trade_no, "Payment confirmed");
        self.mark_paid(order.id, method).await?;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Renew
    // ------------------------------------------------------------------

    pub async fn create_renew_order(
        &self,
        user_id: i64,
        vps_id: i64,
        months: i32,
    ) -> Result<(Order, Vec<OrderItem>)> {
        self.gate.require_action(user_id, actions::RENEW_VPS).await?;
        let vps = self.user_instance(user_id, vps_id).await?;
        let months = if months <= 0 { 1 } else { months };
        let amount = vps.monthly_price * months as i64;
        if amount <= 0 {
            return Err(Error::invalid("instance has no renewal price"));
        }
        if self
            .store
            .orders
            .has_open_item_for_vps(vps.id, ItemAction::Renew)
            .await?
        {
            return Err(Error::conflict(format!("vps {} already has an open renewal", vps.id)));
        }

        let spec = RenewSpec {
            vps_id: vps.id,
            renew_days: months * DAYS_PER_MONTH,
            duration_months: months,
            emergency: false,
        };
        let currency = self.site_currency().await;
        let mut order = Order::new(user_id, new_order_no(prefixes::RENEW, user_id), "renew", &currency);
        order.total_amount = amount;
        let item = self.vps_item(ItemAction::Renew, &vps, amount, months, serde_json::to_string(&spec)?);
        self.create_follow_up(order, item).await
    }

    /// Free short renewal shortly before expiry, at most once per interval.
    pub async fn emergency_renew(&self, user_id: i64, vps_id: i64) -> Result<Order> {
        let _guard = self.vps_locks.lock(vps_id).await;
        let vps = self.user_instance(user_id, vps_id).await?;
        let policy = EmergencyRenewPolicy::load(&self.settings).await?;
        policy.check(&vps, Utc::now())?;

        let spec = RenewSpec {
            vps_id: vps.id,
            renew_days: policy.renew_days as i32,
            duration_months: 0,
            emergency: true,
        };
        let currency = self.site_currency().await;
        let order = Order::new(
            user_id,
            new_order_no(prefixes::EMERGENCY_RENEW, user_id),
            "emergency_renew",
            &currency,
        );
        let item = self.vps_item(ItemAction::Renew, &vps, 0, 0, serde_json::to_string(&spec)?);
        let (order, _) = self.create_follow_up(order, item).await?;
        info!(user_id, vps_id, days = policy.renew_days, "Emergency renewal requested");
        self.approve(0, order.id).await
    }

    // ------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------

    pub async fn quote_resize(&self, user_id: i64, vps_id: i64, target: &ResizeTarget) -> Result<ResizeQuote> {
        self.quote_resize_at(user_id, vps_id, target, Utc::now()).await
    }

    pub async fn quote_resize_at(
        &self,
        user_id: i64,
        vps_id: i64,
        target: &ResizeTarget,
        now: DateTime<Utc>,
    ) -> Result<ResizeQuote> {
        if !self.settings.get_bool(keys::RESIZE_ENABLED, true).await? {
            return Err(Error::ResizeDisabled);
        }
        let vps = self.user_instance(user_id, vps_id).await?;
        if vps.expire_at.is_some_and(|at| at <= now) {
            return Err(Error::forbidden("instance has expired"));
        }
        let (start, end) = vps
            .current_period(now)
            .ok_or_else(|| Error::forbidden("instance has no active billing period"))?;

        let current_pkg = self.store.catalog.get_package(vps.package_id).await?;
        let package_id = target.package_id.filter(|id| *id > 0).unwrap_or(vps.package_id);
        let pkg = if package_id == current_pkg.id {
            current_pkg.clone()
        } else {
            let pkg = self.store.catalog.get_package(package_id).await?;
            if pkg.plan_group_id != current_pkg.plan_group_id || !pkg.active {
                return Err(Error::invalid(format!("package {package_id} is not a resize target")));
            }
            pkg
        };
        let plan = self.store.catalog.get_plan_group(pkg.plan_group_id).await?;
        validate_addons(&plan, &target.spec)?;

        let prices = self.pricer.prices_for(user_id, &pkg, &plan).await;
        let target_monthly = prices.monthly_for(&target.spec);
        let spec = ResizeSpec {
            vps_id: vps.id,
            cpu: pkg.cores + target.spec.add_cores,
            memory_gb: pkg.memory_gb + target.spec.add_mem_gb,
            disk_gb: pkg.disk_gb + target.spec.add_disk_gb,
            bandwidth_mbps: pkg.bandwidth_mbps + target.spec.add_bw_mbps,
            target_package_id: Some(pkg.id),
            monthly_price: target_monthly,
            spec: Some(target.spec.clone()),
            charge_amount: 0,
            refund_amount: 0,
        };
        if spec.disk_gb < vps.disk_gb {
            return Err(Error::invalid("disk cannot shrink"));
        }
        let unchanged = pkg.id == vps.package_id
            && spec.cpu == vps.cpu
            && spec.memory_gb == vps.memory_gb
            && spec.disk_gb == vps.disk_gb
            && spec.bandwidth_mbps == vps.bandwidth_mbps;
        if unchanged {
            return Err(Error::invalid("target equals the current configuration"));
        }

        let remaining = (end - now).num_seconds().max(0);
        let period = (end - start).num_seconds().max(1);
        let diff = prorate(target_monthly - vps.monthly_price, remaining, period);
        Ok(ResizeQuote {
            current_monthly: vps.monthly_price,
            target_monthly,
            charge_amount: diff.max(0),
            refund_amount: (-diff).max(0),
            spec: ResizeSpec {
                charge_amount: diff.max(0),
                refund_amount: (-diff).max(0),
                ..spec
            },
        })
    }

    /// One resize per instance at a time; a competing request gets
    /// `ResizeInProgress`.
    pub async fn create_resize_order(
        &self,
        user_id: i64,
        vps_id: i64,
        target: &ResizeTarget,
    ) -> Result<(Order, Vec<OrderItem>)> {
        self.gate.require_action(user_id, actions::RESIZE_VPS).await?;
        let Some(_guard) = self.vps_locks.try_lock(vps_id) else {
            return Err(Error::ResizeInProgress);
        };
        if self
            .store
            .orders
            .has_open_item_for_vps(vps_id, ItemAction::Resize)
            .await?
            || self.store.resize_tasks.has_pending_resize_task(vps_id).await?
        {
            return Err(Error::ResizeInProgress);
        }
        let quote = self.quote_resize(user_id, vps_id, target).await?;
        let vps = self.user_instance(user_id, vps_id).await?;

        let currency = self.site_currency().await;
        let mut order = Order::new(user_id, new_order_no(prefixes::RESIZE, user_id), "resize", &currency);
        order.total_amount = quote.charge_amount;
        let mut item = self.vps_item(
            ItemAction::Resize,
            &vps,
            quote.charge_amount,
            0,
            serde_json::to_string(&quote.spec)?,
        );
        if let Some(pkg) = quote.spec.target_package_id {
            item.package_id = pkg;
        }
        let (order, items) = self.create_follow_up(order, item).await?;
        info!(
            user_id,
            vps_id,
            order_no = %order.order_no,
            charge = quote.charge_amount,
            refund = quote.refund_amount,
            "Resize order created"
        );
        if quote.charge_amount == 0 {
            let order = self.approve(0, order.id).await?;
            let items = self.store.orders.list_order_items(order.id).await?;
            return Ok((order, items));
        }
        Ok((order, items))
    }

    // ------------------------------------------------------------------
    // Refund
    // ------------------------------------------------------------------

    /// Refund the unused part of the current period. The order carries a
    /// negative total and waits for review.
    pub async fn create_refund_order(
        &self,
        user_id: i64,
        vps_id: i64,
        reason: &str,
    ) -> Result<(Order, Vec<OrderItem>)> {
        self.create_refund_order_at(user_id, vps_id, reason, Utc::now()).await
    }

    pub async fn create_refund_order_at(
        &self,
        user_id: i64,
        vps_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Order, Vec<OrderItem>)> {
        let _guard = self.vps_locks.lock(vps_id).await;
        let vps = self.user_instance(user_id, vps_id).await?;
        if self
            .store
            .orders
            .has_open_item_for_vps(vps.id, ItemAction::Resize)
            .await?
            || self.store.resize_tasks.has_pending_resize_task(vps.id).await?
        {
            return Err(Error::conflict("instance has a resize in progress"));
        }
        if self
            .store
            .orders
            .has_open_item_for_vps(vps.id, ItemAction::Refund)
            .await?
        {
            return Err(Error::conflict("instance already has an open refund"));
        }

        let base = if vps.monthly_price > 0 {
            vps.monthly_price
        } else {
            self.store
                .orders
                .get_order_item(vps.order_item_id)
                .await
                .map(|i| i.amount)
                .unwrap_or(0)
        };
        let (start, end) = vps
            .current_period(now)
            .ok_or_else(|| Error::forbidden("instance has no refundable period"))?;
        let remaining = (end - now).num_seconds().max(0);
        let period = (end - start).num_seconds().max(1);
        let amount = prorate(base, remaining, period);
        if amount <= 0 {
            return Err(Error::forbidden("nothing left to refund"));
        }

        let spec = RefundSpec {
            vps_id: vps.id,
            refund_amount: amount,
            reason: reason.trim().to_string(),
        };
        let currency = self.site_currency().await;
        let mut order = Order::new(user_id, new_order_no(prefixes::REFUND, user_id), "refund", &currency);
        order.total_amount = -amount;
        let item = self.vps_item(ItemAction::Refund, &vps, -amount, 0, serde_json::to_string(&spec)?);
        self.create_follow_up(order, item).await
    }

    fn vps_item(&self, action: ItemAction, vps: &VpsInstance, amount: i64, months: i32, spec_json: String) -> OrderItem {
        let mut item = OrderItem::new(action, vps.package_id, vps.goods_type_id, amount);
        item.system_id = vps.system_id;
        item.spec_json = spec_json;
        item.duration_months = months;
        item.automation_instance_id = vps.automation_instance_id.clone();
        item.vps_id = Some(vps.id);
        item
    }

    async fn create_follow_up(&self, order: Order, item: OrderItem) -> Result<(Order, Vec<OrderItem>)> {
        let (order, items) = self
            .store
            .orders
            .create_order_with_items(order, vec![item], CreateOrderOptions::default())
            .await?;
        info!(user_id = order.user_id, order_no = %order.order_no, total = order.total_amount, "Order created");
        self.publish(&order, event_types::ORDER_CREATED, json!({ "items": items.len() }))
            .await;
        self.publish(&order, event_types::ORDER_PENDING_REVIEW, json!({}))
            .await;
        Ok((order, items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemStatus, Package, PlanGroup, VpsStatus};
    use crate::payment::{PaymentProvider, ProviderInfo};
    use crate::provisioning::fake::{FakeAutomation, FixedResolver};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use hostfleet_protocol::messages::PaymentCreateResult;

    struct MockPay;

    #[async_trait]
    impl PaymentProvider for MockPay {
        fn key(&self) -> &str {
            "mockpay"
        }

        fn name(&self) -> &str {
            "Mock Pay"
        }

        async fn create_payment(&self, req: PaymentCreateRequest) -> Result<PaymentCreateResult> {
            Ok(PaymentCreateResult {
                trade_no: format!("T-{}", req.order_no),
                pay_url: format!("https://pay.test/{}", req.order_no),
                extra: BTreeMap::new(),
            })
        }

        async fn verify_notify(&self, req: RawHttpRequest) -> Result<NotifyResult> {
            if req.headers.get("x-sign").is_none() {
                return Err(Error::Unauthorized("bad signature".into()));
            }
            Ok(serde_json::from_str(&req.body)?)
        }
    }

    struct MockRegistry;

    #[async_trait]
    impl PaymentProviderRegistry for MockRegistry {
        async fn list_providers(&self, _include_disabled: bool) -> Result<Vec<ProviderInfo>> {
            Ok(vec![])
        }

        async fn get_provider(&self, key: &str) -> Result<Arc<dyn PaymentProvider>> {
            match key {
                "mockpay" => Ok(Arc::new(MockPay)),
                _ => Err(Error::not_found(key.to_string())),
            }
        }

        async fn get_provider_config(&self, _key: &str) -> Result<(String, bool)> {
            Ok((String::new(), true))
        }

        async fn update_provider_config(&self, _key: &str, _enabled: bool, _config: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        store: Store,
        fake: Arc<FakeAutomation>,
        engine: Arc<ProvisioningEngine>,
        svc: OrderService,
        package: Package,
    }

    async fn fixture() -> Fixture {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let fake = FakeAutomation::new();
        let events = Arc::new(EventBus::new(store.events.clone()));
        let engine = Arc::new(ProvisioningEngine::new(
            store.clone(),
            events.clone(),
            Arc::new(FixedResolver(fake.clone())),
        ));
        let plan = store
            .catalog
            .create_plan_group(PlanGroup {
                id: 0,
                goods_type_id: 1,
                region_id: 1,
                name: "hk".into(),
                line_id: 3,
                unit_core: 300,
                unit_mem: 200,
                unit_disk: 10,
                unit_bw: 50,
                add_core_min: 0,
                add_core_max: 8,
                add_core_step: 1,
                add_mem_min: 0,
                add_mem_max: 8,
                add_mem_step: 1,
                add_disk_min: 0,
                add_disk_max: 100,
                add_disk_step: 10,
                add_bw_min: 0,
                add_bw_max: 100,
                add_bw_step: 1,
                active: true,
            })
            .await
            .unwrap();
        let package = store
            .catalog
            .create_package(Package {
                id: 0,
                plan_group_id: plan.id,
                goods_type_id: 1,
                product_id: 0,
                name: "small".into(),
                cores: 1,
                memory_gb: 1,
                disk_gb: 20,
                bandwidth_mbps: 5,
                port_num: 30,
                monthly_price: 1000,
                active: true,
            })
            .await
            .unwrap();
        let svc = OrderService::new(store.clone(), events, engine.clone())
            .with_payments(Arc::new(MockRegistry));
        Fixture {
            store,
            fake,
            engine,
            svc,
            package,
        }
    }

    fn line(package_id: i64) -> OrderLine {
        OrderLine::new(package_id, 0, CartSpec::default(), 1)
    }

    async fn fund(store: &Store, user_id: i64, amount: i64) {
        WalletService::new(store.wallets.clone())
            .credit_once(user_id, amount, "topup", user_id * 1000 + amount, "test")
            .await
            .unwrap();
    }

    /// A provisioned instance owned by user 1.
    async fn running_vps(f: &Fixture) -> VpsInstance {
        fund(&f.store, 1, 1000).await;
        let created = f.svc.instant_create(1, &[line(f.package.id)], "", "").await.unwrap();
        f.svc.approve(9, created.order.id).await.unwrap();
        f.engine.run_provision_jobs().await.unwrap();
        let items = f.store.orders.list_order_items(created.order.id).await.unwrap();
        f.store.vps.get_instance(items[0].vps_id.unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_review_then_balance_payment_dispatches() {
        let f = fixture().await;
        let (order, items) = f
            .svc
            .create_order_from_items(1, "cny", &[OrderLine::new(f.package.id, 0, CartSpec::default(), 2)], "", "")
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingReview);
        assert_eq!(order.total_amount, 2000);
        assert_eq!(order.currency, "CNY");
        assert_eq!(items.len(), 2);

        let order = f.svc.approve(9, order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);

        let input = SelectPaymentInput {
            method: METHOD_BALANCE.into(),
            ..Default::default()
        };
        assert!(matches!(
            f.svc.select_payment(1, order.id, input.clone()).await,
            Err(Error::InsufficientBalance)
        ));
        fund(&f.store, 1, 5000).await;
        let paid = f.svc.select_payment(1, order.id, input).await.unwrap();
        assert!(paid.paid);
        assert_eq!(paid.status, OrderStatus::Approved);

        let order = f.store.orders.get_order(order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Provisioning);
        assert_eq!(f.svc.wallet.balance(1).await.unwrap(), 3000);
        let payments = f.store.payments.list_payments_by_order(order.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].trade_no, format!("BAL-{}", order.order_no));
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_same_order() {
        let f = fixture().await;
        let (a, _) = f
            .svc
            .create_order_from_items(1, "", &[line(f.package.id)], "k1", "")
            .await
            .unwrap();
        let (b, items) = f
            .svc
            .create_order_from_items(1, "", &[line(f.package.id), line(f.package.id)], "k1", "")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(items.len(), 1);
        let (c, _) = f
            .svc
            .create_order_from_items(2, "", &[line(f.package.id)], "k1", "")
            .await
            .unwrap();
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_cart_order_clears_cart() {
        let f = fixture().await;
        assert!(matches!(
            f.svc.create_order_from_cart(1, "", "", "").await,
            Err(Error::InvalidInput(_))
        ));
        f.store
            .carts
            .add_cart_item(crate::domain::CartItem {
                id: 0,
                user_id: 1,
                package_id: f.package.id,
                system_id: 0,
                spec: CartSpec::default(),
                qty: 1,
                amount: 1000,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let (order, _) = f.svc.create_order_from_cart(1, "", "", "").await.unwrap();
        assert_eq!(order.source, "cart");
        assert!(f.store.carts.list_cart_items(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_payment_and_duplicate_notify() {
        let f = fixture().await;
        let (order, _) = f
            .svc
            .create_order_from_items(1, "", &[line(f.package.id)], "", "")
            .await
            .unwrap();
        f.svc.approve(9, order.id).await.unwrap();
        let sel = f
            .svc
            .select_payment(
                1,
                order.id,
                SelectPaymentInput {
                    method: "mockpay".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!sel.paid);
        assert_eq!(sel.trade_no, format!("T-{}", order.order_no));

        let body = json!({
            "order_no": order.order_no,
            "trade_no": sel.trade_no,
            "amount": 1000,
            "status": "paid",
            "ack_body": "success",
        })
        .to_string();
        let mut raw = RawHttpRequest {
            method: "POST".into(),
            path: "/notify/mockpay".into(),
            body,
            ..Default::default()
        };
        assert!(matches!(
            f.svc.handle_notify("mockpay", raw.clone()).await,
            Err(Error::Unauthorized(_))
        ));
        raw.headers.insert("x-sign".into(), vec!["ok".into()]);
        let ack = f.svc.handle_notify("mockpay", raw.clone()).await.unwrap();
        assert_eq!(ack.ack_body, "success");
        f.svc.handle_notify("mockpay", raw).await.unwrap();

        let order = f.store.orders.get_order(order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Provisioning);
        let payments = f.store.payments.list_payments_by_order(order.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Approved);
        assert_eq!(paid_events(&f.store, order.id).await, 1);
        let jobs = f.engine.run_provision_jobs().await.unwrap();
        assert_eq!(jobs, 1);
    }

    async fn paid_events(store: &Store, order_id: i64) -> usize {
        store
            .events
            .list_events_after(order_id, 0, 1000)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_types::ORDER_PAID)
            .count()
    }

    #[tokio::test]
    async fn test_notify_without_trade_no_is_applied_once() {
        let f = fixture().await;
        let (order, _) = f
            .svc
            .create_order_from_items(1, "", &[line(f.package.id)], "", "")
            .await
            .unwrap();
        f.svc.approve(9, order.id).await.unwrap();

        let mut raw = RawHttpRequest {
            method: "POST".into(),
            path: "/notify/mockpay".into(),
            body: json!({
                "order_no": order.order_no,
                "trade_no": "",
                "amount": 1000,
                "status": "paid",
            })
            .to_string(),
            ..Default::default()
        };
        raw.headers.insert("x-sign".into(), vec!["ok".into()]);
        f.svc.handle_notify("mockpay", raw.clone()).await.unwrap();
        f.svc.handle_notify("mockpay", raw).await.unwrap();

        let payments = f.store.payments.list_payments_by_order(order.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Approved);
        assert_eq!(paid_events(&f.store, order.id).await, 1);
        assert_eq!(f.engine.run_provision_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reject_and_cancel() {
        let f = fixture().await;
        let (order, _) = f
            .svc
            .create_order_from_items(1, "", &[line(f.package.id)], "", "")
            .await
            .unwrap();
        let rejected = f.svc.reject(9, order.id, " out of stock ").await.unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert_eq!(rejected.rejected_reason, "out of stock");
        assert!(f.svc.cancel(1, order.id).await.is_err());

        let (other, _) = f
            .svc
            .create_order_from_items(1, "", &[line(f.package.id)], "", "")
            .await
            .unwrap();
        assert!(matches!(f.svc.cancel(2, other.id).await, Err(Error::NotFound(_))));
        let canceled = f.svc.cancel(1, other.id).await.unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn test_renew_order_blocks_second_open_renewal() {
        let f = fixture().await;
        let vps = running_vps(&f).await;
        let (order, items) = f.svc.create_renew_order(1, vps.id, 3).await.unwrap();
        assert_eq!(order.total_amount, 3000);
        assert_eq!(items[0].action, ItemAction::Renew);
        assert!(order.order_no.starts_with("REN-"));
        assert!(matches!(
            f.svc.create_renew_order(1, vps.id, 1).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            f.svc.create_renew_order(2, vps.id, 1).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_emergency_renew_once_per_interval() {
        let f = fixture().await;
        let mut vps = running_vps(&f).await;
        assert!(matches!(
            f.svc.emergency_renew(1, vps.id).await,
            Err(Error::Forbidden(_))
        ));
        vps.expire_at = Some(Utc::now() + chrono::Duration::days(2));
        f.store.vps.update_instance(&vps).await.unwrap();

        let order = f.svc.emergency_renew(1, vps.id).await.unwrap();
        assert!(order.order_no.starts_with("EMR-"));
        assert_eq!(order.status, OrderStatus::Active);
        let renewed = f.store.vps.get_instance(vps.id).await.unwrap();
        assert!(renewed.last_emergency_renew_at.is_some());
        assert!(renewed.expire_at.unwrap() > vps.expire_at.unwrap());
        assert!(matches!(
            f.svc.emergency_renew(1, vps.id).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_resize_quote_and_order() {
        let f = fixture().await;
        let vps = running_vps(&f).await;
        let target = ResizeTarget {
            package_id: None,
            spec: CartSpec {
                add_cores: 1,
                ..Default::default()
            },
        };
        let quote = f.svc.quote_resize(1, vps.id, &target).await.unwrap();
        assert_eq!(quote.current_monthly, 1000);
        assert_eq!(quote.target_monthly, 1300);
        assert!(quote.charge_amount > 0 && quote.charge_amount <= 300);
        assert_eq!(quote.spec.cpu, 2);

        assert!(matches!(
            f.svc.quote_resize(1, vps.id, &ResizeTarget::default()).await,
            Err(Error::InvalidInput(_))
        ));

        let (order, items) = f.svc.create_resize_order(1, vps.id, &target).await.unwrap();
        assert_eq!(order.status, OrderStatus::PendingReview);
        assert_eq!(items[0].action, ItemAction::Resize);
        assert!(matches!(
            f.svc.create_resize_order(1, vps.id, &target).await,
            Err(Error::ResizeInProgress)
        ));

        f.svc.settings.set(keys::RESIZE_ENABLED, "false").await.unwrap();
        assert!(matches!(
            f.svc.quote_resize(1, vps.id, &target).await,
            Err(Error::ResizeDisabled)
        ));
    }

    #[tokio::test]
    async fn test_refund_order_destroys_and_credits() {
        let f = fixture().await;
        let vps = running_vps(&f).await;
        let balance_before = f.svc.wallet.balance(1).await.unwrap();

        let (order, items) = f.svc.create_refund_order(1, vps.id, "not needed").await.unwrap();
        assert!(order.total_amount < 0);
        assert!(-order.total_amount <= 1000);
        assert_eq!(items[0].amount, order.total_amount);
        assert!(matches!(
            f.svc.create_refund_order(1, vps.id, "again").await,
            Err(Error::Conflict(_))
        ));

        let order = f.svc.approve(9, order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert!(f.store.vps.get_instance(vps.id).await.is_err());
        assert_eq!(f.fake.called("delete_host"), 1);
        assert_eq!(
            f.svc.wallet.balance(1).await.unwrap(),
            balance_before - order.total_amount
        );
        let items = f.store.orders.list_order_items(order.id).await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Active);
    }

    #[tokio::test]
    async fn test_running_vps_fixture() {
        let f = fixture().await;
        let vps = running_vps(&f).await;
        assert_eq!(vps.status, VpsStatus::Running);
        assert_eq!(vps.monthly_price, 1000);
        assert!(vps.current_period(Utc::now()).is_some());
    }
}
