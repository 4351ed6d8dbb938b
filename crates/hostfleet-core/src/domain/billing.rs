// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub user_id: i64,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only ledger entry. `(ref_type, ref_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: i64,
    pub user_id: i64,
    /// Signed amount: positive credits, negative debits.
    pub amount: i64,
    pub tx_type: String,
    pub ref_type: String,
    pub ref_id: i64,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// One balance change request for [`WalletRepository::adjust_wallet_balance`](crate::store::WalletRepository::adjust_wallet_balance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAdjustment {
    pub user_id: i64,
    pub amount: i64,
    pub tx_type: String,
    pub ref_type: String,
    pub ref_id: i64,
    pub note: String,
}

text_enum! {
    pub enum CouponDiscountType {
        Fixed => "fixed",
        Percent => "percent",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    pub discount_type: CouponDiscountType,
    /// Cents off for `fixed`.
    pub fixed_amount: i64,
    /// 0..=10000 for `percent`.
    pub discount_permille: i64,
    pub product_group_id: Option<i64>,
    pub min_order_amount: i64,
    /// 0 means unlimited.
    pub total_limit: i64,
    /// 0 means unlimited.
    pub per_user_limit: i64,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub new_user_only: bool,
    pub active: bool,
}

text_enum! {
    pub enum CouponRuleScope {
        All => "all",
        GoodsType => "goods_type",
        GoodsTypeRegion => "goods_type_region",
        PlanGroup => "plan_group",
        Package => "package",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponGroupRule {
    pub scope: CouponRuleScope,
    #[serde(default)]
    pub goods_type_id: i64,
    #[serde(default)]
    pub region_id: i64,
    #[serde(default)]
    pub plan_group_id: i64,
    #[serde(default)]
    pub package_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CouponProductGroup {
    pub id: i64,
    pub name: String,
    #[sqlx(json)]
    pub rules: Vec<CouponGroupRule>,
}
