// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rule selection and price resolution.
//!
//! Base price and add-on unit prices are chosen independently: each takes
//! the matching rule with the highest scope specificity.

use chrono::{DateTime, Utc};

use crate::domain::{
    AutoRuleCondition, AutoRuleMetric, AutoRuleOperator, DiscountScope, Package, PlanGroup,
    TierDiscountRule, TierPriceCache,
};
use crate::money::apply_permille_discount;

/// Upper bound of every `*_permille` field.
pub const PERMILLE_MAX: i64 = 10_000;

fn base_matches(rule: &TierDiscountRule, pkg: &Package, plan: &PlanGroup) -> bool {
    if !rule.scope.applies_to_base() {
        return false;
    }
    scope_matches(rule, pkg, plan)
}

fn addon_matches(rule: &TierDiscountRule, pkg: &Package, plan: &PlanGroup) -> bool {
    if !rule.scope.applies_to_addons() {
        return false;
    }
    scope_matches(rule, pkg, plan)
}

fn scope_matches(rule: &TierDiscountRule, pkg: &Package, plan: &PlanGroup) -> bool {
    match rule.scope {
        DiscountScope::All | DiscountScope::AddonAll => true,
        DiscountScope::GoodsType => rule.goods_type_id > 0 && rule.goods_type_id == pkg.goods_type_id,
        DiscountScope::GoodsTypeArea => {
            rule.goods_type_id == pkg.goods_type_id && rule.region_id == plan.region_id
        }
        DiscountScope::PlanGroup | DiscountScope::AddonConfig => {
            rule.plan_group_id > 0 && rule.plan_group_id == plan.id
        }
        DiscountScope::Package => rule.package_id > 0 && rule.package_id == pkg.id,
    }
}

fn best<'a>(
    rules: &'a [TierDiscountRule],
    pred: impl Fn(&TierDiscountRule) -> bool,
) -> Option<&'a TierDiscountRule> {
    let mut best: Option<&TierDiscountRule> = None;
    for rule in rules.iter().filter(|r| pred(r)) {
        match best {
            Some(b) if b.scope.specificity() >= rule.scope.specificity() => {}
            _ => best = Some(rule),
        }
    }
    best
}

pub fn best_base_rule<'a>(
    rules: &'a [TierDiscountRule],
    pkg: &Package,
    plan: &PlanGroup,
) -> Option<&'a TierDiscountRule> {
    best(rules, |r| base_matches(r, pkg, plan))
}

pub fn best_addon_rule<'a>(
    rules: &'a [TierDiscountRule],
    pkg: &Package,
    plan: &PlanGroup,
) -> Option<&'a TierDiscountRule> {
    best(rules, |r| addon_matches(r, pkg, plan))
}

/// List prices of a package, before any rule.
pub fn list_prices(group_id: i64, pkg: &Package, plan: &PlanGroup, now: DateTime<Utc>) -> TierPriceCache {
    TierPriceCache {
        group_id,
        package_id: pkg.id,
        monthly_price: pkg.monthly_price,
        unit_core: plan.unit_core,
        unit_mem: plan.unit_mem,
        unit_disk: plan.unit_disk,
        unit_bw: plan.unit_bw,
        updated_at: now,
    }
}

/// Cache row of one package under `rules`.
pub fn resolve_prices(
    group_id: i64,
    rules: &[TierDiscountRule],
    pkg: &Package,
    plan: &PlanGroup,
    now: DateTime<Utc>,
) -> TierPriceCache {
    let mut row = list_prices(group_id, pkg, plan, now);
    if let Some(rule) = best_base_rule(rules, pkg, plan) {
        row.monthly_price = match rule.fixed_price {
            Some(fixed) if rule.scope == DiscountScope::Package => fixed,
            _ => apply_permille_discount(row.monthly_price, rule.discount_permille),
        };
    }
    if let Some(rule) = best_addon_rule(rules, pkg, plan) {
        row.unit_core = apply_permille_discount(row.unit_core, rule.add_core_permille);
        row.unit_mem = apply_permille_discount(row.unit_mem, rule.add_mem_permille);
        row.unit_disk = apply_permille_discount(row.unit_disk, rule.add_disk_permille);
        row.unit_bw = apply_permille_discount(row.unit_bw, rule.add_bw_permille);
    }
    row
}

/// Whether two rules target the same slice of the catalog.
pub fn same_scope(a: &TierDiscountRule, b: &TierDiscountRule) -> bool {
    a.group_id == b.group_id
        && a.scope == b.scope
        && a.goods_type_id == b.goods_type_id
        && a.region_id == b.region_id
        && a.plan_group_id == b.plan_group_id
        && a.package_id == b.package_id
}

/// Values the auto-rule conditions compare against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserMetrics {
    pub register_months: i64,
    /// Currency units, not cents.
    pub wallet_balance: f64,
}

impl UserMetrics {
    pub fn new(registered_at: DateTime<Utc>, balance_cents: i64, now: DateTime<Utc>) -> Self {
        let days = (now - registered_at).num_days().max(0);
        Self {
            register_months: days / 30,
            wallet_balance: balance_cents as f64 / 100.0,
        }
    }

    fn value(&self, metric: AutoRuleMetric) -> f64 {
        match metric {
            AutoRuleMetric::RegisterMonths => self.register_months as f64,
            AutoRuleMetric::WalletBalance => self.wallet_balance,
        }
    }
}

/// All conditions hold. An empty list always matches.
pub fn conditions_match(conditions: &[AutoRuleCondition], metrics: &UserMetrics) -> bool {
    conditions.iter().all(|c| {
        let left = metrics.value(c.metric);
        match c.operator {
            AutoRuleOperator::Gt => left > c.value,
            AutoRuleOperator::Lt => left < c.value,
            AutoRuleOperator::Eq => (left - c.value).abs() < 0.0001,
        }
    })
}

/// Parse a conditions column. Blank means no conditions.
pub fn parse_conditions(raw: &str) -> serde_json::Result<Vec<AutoRuleCondition>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pkg() -> Package {
        Package {
            id: 7,
            plan_group_id: 3,
            goods_type_id: 1,
            product_id: 0,
            name: "S".into(),
            cores: 1,
            memory_gb: 1,
            disk_gb: 20,
            bandwidth_mbps: 10,
            port_num: 0,
            monthly_price: 1000,
            active: true,
        }
    }

    fn plan() -> PlanGroup {
        PlanGroup {
            id: 3,
            goods_type_id: 1,
            region_id: 9,
            name: "HK".into(),
            line_id: 0,
            unit_core: 200,
            unit_mem: 100,
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
            add_bw_step: 10,
            active: true,
        }
    }

    fn rule(id: i64, scope: DiscountScope, discount: i64) -> TierDiscountRule {
        let now = Utc::now();
        TierDiscountRule {
            id,
            group_id: 2,
            scope,
            goods_type_id: 0,
            region_id: 0,
            plan_group_id: 0,
            package_id: 0,
            discount_permille: discount,
            fixed_price: None,
            add_core_permille: 0,
            add_mem_permille: 0,
            add_disk_permille: 0,
            add_bw_permille: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_most_specific_base_rule_wins() {
        let mut by_plan = rule(2, DiscountScope::PlanGroup, 2000);
        by_plan.plan_group_id = 3;
        let mut by_type = rule(3, DiscountScope::GoodsType, 5000);
        by_type.goods_type_id = 1;
        let rules = vec![rule(1, DiscountScope::All, 1000), by_type, by_plan];

        let row = resolve_prices(2, &rules, &pkg(), &plan(), Utc::now());
        assert_eq!(row.monthly_price, 800);
        // No add-on rule matches, list unit prices stay.
        assert_eq!(row.unit_core, 200);
    }

    #[test]
    fn test_base_and_addon_selected_independently() {
        let mut fixed = rule(1, DiscountScope::Package, 0);
        fixed.package_id = 7;
        fixed.fixed_price = Some(450);
        let mut addons = rule(2, DiscountScope::AddonAll, 0);
        addons.add_core_permille = 5000;
        addons.add_bw_permille = 10_000;
        let mut config = rule(3, DiscountScope::AddonConfig, 9000);
        config.plan_group_id = 99;
        let rules = vec![fixed, addons, config];

        let row = resolve_prices(2, &rules, &pkg(), &plan(), Utc::now());
        assert_eq!(row.monthly_price, 450);
        assert_eq!(row.unit_core, 100);
        assert_eq!(row.unit_mem, 100);
        assert_eq!(row.unit_bw, 0);
    }

    #[test]
    fn test_fixed_price_ignored_outside_package_scope() {
        let mut r = rule(1, DiscountScope::All, 1000);
        r.fixed_price = Some(1);
        let row = resolve_prices(2, &[r], &pkg(), &plan(), Utc::now());
        assert_eq!(row.monthly_price, 900);
    }

    #[test]
    fn test_goods_type_area_needs_region() {
        let mut r = rule(1, DiscountScope::GoodsTypeArea, 5000);
        r.goods_type_id = 1;
        r.region_id = 8;
        assert!(best_base_rule(std::slice::from_ref(&r), &pkg(), &plan()).is_none());
        r.region_id = 9;
        assert!(best_base_rule(std::slice::from_ref(&r), &pkg(), &plan()).is_some());
        assert!(best_addon_rule(std::slice::from_ref(&r), &pkg(), &plan()).is_some());
    }

    #[test]
    fn test_conditions() {
        let now = Utc::now();
        let m = UserMetrics::new(now - Duration::days(95), 12_345, now);
        assert_eq!(m.register_months, 3);
        assert!((m.wallet_balance - 123.45).abs() < 1e-9);

        let conds = parse_conditions(
            r#"[{"metric":"register_months","operator":"gt","value":2},
                {"metric":"wallet_balance","operator":"lt","value":200}]"#,
        )
        .unwrap();
        assert!(conditions_match(&conds, &m));
        let eq = parse_conditions(r#"[{"metric":"register_months","operator":"eq","value":4}]"#).unwrap();
        assert!(!conditions_match(&eq, &m));
        assert!(conditions_match(&parse_conditions("  ").unwrap(), &m));
        assert!(parse_conditions(r#"[{"metric":"age","operator":"gt","value":1}]"#).is_err());
    }
}
