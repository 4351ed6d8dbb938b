// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{Coupon, CouponDiscountType, CouponGroupRule, CouponRuleScope};
use crate::error::{Error, Result};
use crate::money::apply_permille_discount;
use crate::store::{CouponRepository, OrderRepository};

use super::pricing::PricedLine;

/// Coupon accepted for an order.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCoupon {
    pub coupon_id: i64,
    pub code: String,
    pub discount: i64,
}

fn rule_matches(rule: &CouponGroupRule, line: &PricedLine) -> bool {
    let pkg = &line.package;
    let plan = &line.plan;
    match rule.scope {
        CouponRuleScope::All => true,
        CouponRuleScope::GoodsType => rule.goods_type_id == pkg.goods_type_id,
        CouponRuleScope::GoodsTypeRegion => {
            rule.goods_type_id == pkg.goods_type_id && rule.region_id == plan.region_id
        }
        CouponRuleScope::PlanGroup => rule.plan_group_id == plan.id,
        CouponRuleScope::Package => rule.package_id == pkg.id,
    }
}

/// Validates coupon codes and computes their discount.
#[derive(Clone)]
pub struct CouponEvaluator {
    coupons: Arc<dyn CouponRepository>,
    orders: Arc<dyn OrderRepository>,
}

impl CouponEvaluator {
    pub fn new(coupons: Arc<dyn CouponRepository>, orders: Arc<dyn OrderRepository>) -> Self {
        Self { coupons, orders }
    }

    pub async fn evaluate(
        &self,
        user_id: i64,
        code: &str,
        lines: &[PricedLine],
    ) -> Result<AppliedCoupon> {
        self.evaluate_at(user_id, code, lines, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        user_id: i64,
        code: &str,
        lines: &[PricedLine],
        now: DateTime<Utc>,
    ) -> Result<AppliedCoupon> {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() || lines.is_empty() {
            return Err(Error::invalid("coupon code and order lines are required"));
        }
        let coupon = self.coupons.get_coupon_by_code(&code).await?;
        check_window(&coupon, now)?;
        if coupon.total_limit > 0
            && self.coupons.count_redemptions(coupon.id, None).await? >= coupon.total_limit
        {
            return Err(Error::conflict(format!("coupon {code} is used up")));
        }
        if coupon.per_user_limit > 0
            && self.coupons.count_redemptions(coupon.id, Some(user_id)).await?
                >= coupon.per_user_limit
        {
            return Err(Error::conflict(format!("coupon {code} already used")));
        }
        if coupon.new_user_only && self.orders.count_user_orders(user_id).await? > 0 {
            return Err(Error::conflict(format!("coupon {code} is for new users")));
        }

        let base: i64 = match coupon.product_group_id {
            None => lines.iter().map(PricedLine::total).sum(),
            Some(group_id) => {
                let group = self.coupons.get_product_group(group_id).await?;
                lines
                    .iter()
                    .filter(|l| group.rules.iter().any(|r| rule_matches(r, l)))
                    .map(PricedLine::total)
                    .sum()
            }
        };
        if base <= 0 {
            return Err(Error::conflict(format!("coupon {code} does not apply to this order")));
        }
        let total: i64 = lines.iter().map(PricedLine::total).sum();
        if total < coupon.min_order_amount {
            return Err(Error::conflict(format!(
                "coupon {code} needs an order of at least {}",
                crate::money::format_cents(coupon.min_order_amount)
            )));
        }

        let discount = match coupon.discount_type {
            CouponDiscountType::Fixed => coupon.fixed_amount.clamp(0, base),
            CouponDiscountType::Percent => base - apply_permille_discount(base, coupon.discount_permille),
        };
        if discount <= 0 {
            return Err(Error::conflict(format!("coupon {code} gives no discount")));
        }
        Ok(AppliedCoupon {
            coupon_id: coupon.id,
            code: coupon.code,
            discount,
        })
    }
}

fn check_window(coupon: &Coupon, now: DateTime<Utc>) -> Result<()> {
    if !coupon.active {
        return Err(Error::conflict(format!("coupon {} is inactive", coupon.code)));
    }
    if coupon.starts_at.is_some_and(|at| now < at) || coupon.ends_at.is_some_and(|at| now > at) {
        return Err(Error::conflict(format!("coupon {} is not valid now", coupon.code)));
    }
    Ok(())
}
