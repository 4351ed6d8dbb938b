// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Purchase parameters of a cart or order item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSpec {
    #[serde(default)]
    pub add_cores: i32,
    #[serde(default)]
    pub add_mem_gb: i32,
    #[serde(default)]
    pub add_disk_gb: i32,
    #[serde(default)]
    pub add_bw_mbps: i32,
    #[serde(default)]
    pub billing_cycle_id: Option<i64>,
    #[serde(default = "one")]
    pub cycle_qty: i32,
    #[serde(default = "one")]
    pub duration_months: i32,
}

fn one() -> i32 {
    1
}

impl CartSpec {
    /// Requested units of an add-on.
    pub fn addon(&self, addon: super::Addon) -> i32 {
        match addon {
            super::Addon::Cores => self.add_cores,
            super::Addon::MemGb => self.add_mem_gb,
            super::Addon::DiskGb => self.add_disk_gb,
            super::Addon::BwMbps => self.add_bw_mbps,
        }
    }
}

impl Default for CartSpec {
    fn default() -> Self {
        Self {
            add_cores: 0,
            add_mem_gb: 0,
            add_disk_gb: 0,
            add_bw_mbps: 0,
            billing_cycle_id: None,
            cycle_qty: 1,
            duration_months: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CartItem {
    pub id: i64,
    pub user_id: i64,
    pub package_id: i64,
    pub system_id: i64,
    #[sqlx(json)]
    pub spec: CartSpec,
    pub qty: i32,
    /// Unit amount quoted when the item was added.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

text_enum! {
    pub enum OrderStatus {
        PendingReview => "pending_review",
        PendingPayment => "pending_payment",
        Approved => "approved",
        Provisioning => "provisioning",
        Active => "active",
        Failed => "failed",
        Refunded => "refunded",
        Canceled => "canceled",
        Rejected => "rejected",
    }
}

impl OrderStatus {
    /// Still waiting on staff or the buyer.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::PendingReview | OrderStatus::PendingPayment)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub order_no: String,
    /// `cart`, `instant`, `renew`, `resize` or `refund`.
    pub source: String,
    pub status: OrderStatus,
    pub total_amount: i64,
    pub currency: String,
    pub idempotency_key: String,
    pub coupon_id: Option<i64>,
    pub coupon_code: String,
    pub coupon_discount: i64,
    pub pending_reason: String,
    pub approved_by: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(user_id: i64, order_no: String, source: &str, currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            order_no,
            source: source.to_string(),
            status: OrderStatus::PendingReview,
            total_amount: 0,
            currency: currency.to_string(),
            idempotency_key: String::new(),
            coupon_id: None,
            coupon_code: String::new(),
            coupon_discount: 0,
            pending_reason: String::new(),
            approved_by: None,
            approved_at: None,
            rejected_reason: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

text_enum! {
    pub enum ItemAction {
        Create => "create",
        Renew => "renew",
        Resize => "resize",
        Refund => "refund",
    }
}

text_enum! {
    pub enum ItemStatus {
        PendingPayment => "pending_payment",
        Approved => "approved",
        Provisioning => "provisioning",
        Active => "active",
        Failed => "failed",
        Canceled => "canceled",
        Rejected => "rejected",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub package_id: i64,
    pub system_id: i64,
    pub goods_type_id: i64,
    /// Spec snapshot as JSON (a [`CartSpec`] or a resize target).
    pub spec_json: String,
    pub qty: i32,
    pub amount: i64,
    pub status: ItemStatus,
    pub action: ItemAction,
    pub duration_months: i32,
    pub automation_instance_id: String,
    pub vps_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderItem {
    pub fn new(action: ItemAction, package_id: i64, goods_type_id: i64, amount: i64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            order_id: 0,
            package_id,
            system_id: 0,
            goods_type_id,
            spec_json: "{}".to_string(),
            qty: 1,
            amount,
            status: ItemStatus::PendingPayment,
            action,
            duration_months: 1,
            automation_instance_id: String::new(),
            vps_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

text_enum! {
    pub enum PaymentStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Refunded => "refunded",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub user_id: i64,
    pub method: String,
    pub amount: i64,
    pub currency: String,
    pub trade_no: String,
    pub status: PaymentStatus,
    pub idempotency_key: String,
    pub raw_notify_json: String,
    pub reviewed_by: Option<i64>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of an order's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderEvent {
    pub id: i64,
    pub order_id: i64,
    pub seq: i64,
    pub event_type: String,
    pub data_json: String,
    pub created_at: DateTime<Utc>,
}

/// Event type names published by the order pipeline and provisioning.
pub mod event_types {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_PENDING_REVIEW: &str = "order.pending_review";
    pub const ORDER_APPROVED: &str = "order.approved";
    pub const ORDER_REJECTED: &str = "order.rejected";
    pub const ORDER_CANCELED: &str = "order.canceled";
    pub const ORDER_PAID: &str = "order.paid";
    pub const ORDER_REFUNDED: &str = "order.refunded";
    pub const ITEM_PROVISIONING: &str = "item.provisioning";
    pub const ITEM_PROVISIONED: &str = "item.provisioned";
    pub const ITEM_FAILED: &str = "item.failed";
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub user_id: Option<i64>,
    pub status: Option<OrderStatus>,
}

/// Extra writes performed in the same transaction as order creation.
#[derive(Debug, Clone, Default)]
pub struct CreateOrderOptions {
    /// Clear this user's cart.
    pub clear_cart_of: Option<i64>,
    /// Record a redemption of this coupon.
    pub coupon_id: Option<i64>,
}
