// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TierGroup {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub icon: String,
    pub priority: i32,
    pub auto_approve_enabled: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

text_enum! {
    /// Selectivity of a discount rule.
    pub enum DiscountScope {
        All => "all",
        AddonAll => "addon_all",
        GoodsType => "goods_type",
        GoodsTypeArea => "goods_type_area",
        PlanGroup => "plan_group",
        AddonConfig => "addon_config",
        Package => "package",
    }
}

impl DiscountScope {
    /// Higher wins when several rules match.
    pub fn specificity(&self) -> i32 {
        match self {
            DiscountScope::Package => 60,
            DiscountScope::PlanGroup | DiscountScope::AddonConfig => 50,
            DiscountScope::GoodsTypeArea => 40,
            DiscountScope::GoodsType => 30,
            DiscountScope::AddonAll => 20,
            DiscountScope::All => 10,
        }
    }

    /// Whether rules of this scope may set the base price.
    pub fn applies_to_base(&self) -> bool {
        !matches!(self, DiscountScope::AddonAll | DiscountScope::AddonConfig)
    }

    /// Whether rules of this scope may set add-on unit prices.
    pub fn applies_to_addons(&self) -> bool {
        !matches!(self, DiscountScope::Package | DiscountScope::All)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TierDiscountRule {
    pub id: i64,
    pub group_id: i64,
    pub scope: DiscountScope,
    pub goods_type_id: i64,
    pub region_id: i64,
    pub plan_group_id: i64,
    pub package_id: i64,
    /// Base price discount, 0..=10000.
    pub discount_permille: i64,
    /// Package scope only.
    pub fixed_price: Option<i64>,
    pub add_core_permille: i64,
    pub add_mem_permille: i64,
    pub add_disk_permille: i64,
    pub add_bw_permille: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TierAutoRule {
    pub id: i64,
    pub group_id: i64,
    /// Membership length, -1 for forever.
    pub duration_days: i32,
    /// JSON array of [`AutoRuleCondition`].
    pub conditions_json: String,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

text_enum! {
    pub enum AutoRuleMetric {
        RegisterMonths => "register_months",
        WalletBalance => "wallet_balance",
    }
}

text_enum! {
    pub enum AutoRuleOperator {
        Gt => "gt",
        Lt => "lt",
        Eq => "eq",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRuleCondition {
    pub metric: AutoRuleMetric,
    pub operator: AutoRuleOperator,
    pub value: f64,
}

text_enum! {
    pub enum MembershipSource {
        Auto => "auto",
        Manual => "manual",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TierMembership {
    pub user_id: i64,
    pub group_id: i64,
    pub source: MembershipSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TierMembership {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Resolved prices of one package for one tier group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TierPriceCache {
    pub group_id: i64,
    pub package_id: i64,
    pub monthly_price: i64,
    pub unit_core: i64,
    pub unit_mem: i64,
    pub unit_disk: i64,
    pub unit_bw: i64,
    pub updated_at: DateTime<Utc>,
}
