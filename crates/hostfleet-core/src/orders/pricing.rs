// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Price resolution of order lines.
//!
//! ```text
//! unit_monthly = base + Σ add_i * unit_i      (tier prices when the user has a tier)
//! unit_total   = round_half_even(unit_monthly * multiplier)
//! line_total   = unit_total * qty
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Addon, CartSpec, Package, PlanGroup, TierPriceCache};
use crate::error::{Error, Result};
use crate::money::round_half_even;
use crate::store::CatalogRepository;

use super::hooks::TierHooks;

/// One requested line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub package_id: i64,
    #[serde(default)]
    pub system_id: i64,
    #[serde(default)]
    pub spec: CartSpec,
    #[serde(default = "one")]
    pub qty: i32,
}

fn one() -> i32 {
    1
}

impl OrderLine {
    pub fn new(package_id: i64, system_id: i64, spec: CartSpec, qty: i32) -> Self {
        Self {
            package_id,
            system_id,
            spec,
            qty,
        }
    }
}

/// Monthly base price and per-unit add-on prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitPrices {
    pub monthly: i64,
    pub core: i64,
    pub mem: i64,
    pub disk: i64,
    pub bw: i64,
}

impl UnitPrices {
    pub fn list(package: &Package, plan: &PlanGroup) -> Self {
        Self {
            monthly: package.monthly_price,
            core: plan.unit_core,
            mem: plan.unit_mem,
            disk: plan.unit_disk,
            bw: plan.unit_bw,
        }
    }

    pub fn from_cache(row: &TierPriceCache) -> Self {
        Self {
            monthly: row.monthly_price,
            core: row.unit_core,
            mem: row.unit_mem,
            disk: row.unit_disk,
            bw: row.unit_bw,
        }
    }

    pub fn unit(&self, addon: Addon) -> i64 {
        match addon {
            Addon::Cores => self.core,
            Addon::MemGb => self.mem,
            Addon::DiskGb => self.disk,
            Addon::BwMbps => self.bw,
        }
    }

    /// Monthly cost of the add-ons in `spec`.
    pub fn addon_monthly(&self, spec: &CartSpec) -> i64 {
        Addon::ALL
            .iter()
            .map(|a| spec.addon(*a) as i64 * self.unit(*a))
            .sum()
    }

    pub fn monthly_for(&self, spec: &CartSpec) -> i64 {
        self.monthly + self.addon_monthly(spec)
    }
}

/// Billing term of a line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Term {
    pub months: i32,
    pub multiplier: f64,
}

/// Add-ons must fit the plan's `{min, max, step}`; a disabled add-on must be 0.
pub fn validate_addons(plan: &PlanGroup, spec: &CartSpec) -> Result<()> {
    for addon in Addon::ALL {
        let value = spec.addon(addon);
        if !plan.range(addon).allows(value) {
            return Err(Error::invalid(format!(
                "{} add-on {value} is not allowed by plan group {}",
                addon.as_str(),
                plan.id
            )));
        }
    }
    Ok(())
}

/// A priced order line. `line.spec.duration_months` holds the resolved months.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedLine {
    pub line: OrderLine,
    pub package: Package,
    pub plan: PlanGroup,
    pub prices: UnitPrices,
    pub months: i32,
    pub unit_monthly: i64,
    pub unit_total: i64,
}

impl PricedLine {
    pub fn total(&self) -> i64 {
        self.unit_total * self.line.qty as i64
    }
}

/// Resolves catalog and tier prices of order lines.
#[derive(Clone)]
pub struct Pricer {
    catalog: Arc<dyn CatalogRepository>,
    tier: Arc<dyn TierHooks>,
}

impl Pricer {
    pub fn new(catalog: Arc<dyn CatalogRepository>, tier: Arc<dyn TierHooks>) -> Self {
        Self { catalog, tier }
    }

    /// Months and multiplier of `spec`: the billing cycle times `cycle_qty`,
    /// or `duration_months` for both when no cycle is chosen.
    pub async fn term(&self, spec: &CartSpec) -> Result<Term> {
        let Some(cycle_id) = spec.billing_cycle_id.filter(|id| *id > 0) else {
            if spec.duration_months < 1 {
                return Err(Error::invalid("duration_months must be at least 1"));
            }
            return Ok(Term {
                months: spec.duration_months,
                multiplier: spec.duration_months as f64,
            });
        };
        let cycle = self.catalog.get_billing_cycle(cycle_id).await?;
        if !cycle.active {
            return Err(Error::invalid(format!("billing cycle {cycle_id} is inactive")));
        }
        let qty = spec.cycle_qty;
        if qty < 1
            || (cycle.min_qty > 0 && qty < cycle.min_qty)
            || (cycle.max_qty > 0 && qty > cycle.max_qty)
        {
            return Err(Error::invalid(format!(
                "cycle_qty {qty} outside [{}, {}]",
                cycle.min_qty, cycle.max_qty
            )));
        }
        Ok(Term {
            months: cycle.months * qty,
            multiplier: cycle.multiplier * qty as f64,
        })
    }

    /// Prices of a package for the user, falling back to list prices when
    /// the tier engine has nothing or fails.
    pub async fn prices_for(&self, user_id: i64, package: &Package, plan: &PlanGroup) -> UnitPrices {
        match self.tier.package_pricing(user_id, package.id).await {
            Ok(Some(row)) => UnitPrices::from_cache(&row),
            Ok(None) => UnitPrices::list(package, plan),
            Err(e) => {
                warn!(user_id, package_id = package.id, error = %e, "Tier pricing failed, using list price");
                UnitPrices::list(package, plan)
            }
        }
    }

    pub async fn price_line(&self, user_id: i64, line: &OrderLine) -> Result<PricedLine> {
        if line.qty < 1 {
            return Err(Error::invalid("qty must be at least 1"));
        }
        let package = self.catalog.get_package(line.package_id).await?;
        if !package.active {
            return Err(Error::invalid(format!("package {} is not on sale", package.id)));
        }
        let plan = self.catalog.get_plan_group(package.plan_group_id).await?;
        if !plan.active {
            return Err(Error::invalid(format!("plan group {} is not on sale", plan.id)));
        }
        validate_addons(&plan, &line.spec)?;
        let term = self.term(&line.spec).await?;
        let prices = self.prices_for(user_id, &package, &plan).await;
        let unit_monthly = prices.monthly_for(&line.spec);
        let unit_total = round_half_even(unit_monthly as f64 * term.multiplier);

        let mut line = line.clone();
        line.spec.duration_months = term.months;
        Ok(PricedLine {
            line,
            package,
            plan,
            prices,
            months: term.months,
            unit_monthly,
            unit_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BillingCycle;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    fn plan(id: i64) -> PlanGroup {
        PlanGroup {
            id,
            goods_type_id: 1,
            region_id: 1,
            name: "hk".into(),
            line_id: 9,
            unit_core: 300,
            unit_mem: 200,
            unit_disk: 10,
            unit_bw: 50,
            add_core_min: 0,
            add_core_max: 8,
            add_core_step: 1,
            add_mem_min: 0,
            add_mem_max: 16,
            add_mem_step: 2,
            add_disk_min: 0,
            add_disk_max: 500,
            add_disk_step: 10,
            add_bw_min: -1,
            add_bw_max: -1,
            add_bw_step: 1,
            active: true,
        }
    }

    fn package(id: i64, plan_group_id: i64) -> Package {
        Package {
            id,
            plan_group_id,
            goods_type_id: 1,
            product_id: 100 + id,
            name: format!("pkg-{id}"),
            cores: 1,
            memory_gb: 1,
            disk_gb: 20,
            bandwidth_mbps: 5,
            port_num: 30,
            monthly_price: 1000,
            active: true,
        }
    }

    async fn pricer_with(tier: Arc<dyn TierHooks>) -> (Pricer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let p = store.create_plan_group(plan(0)).await.unwrap();
        store.create_package(package(0, p.id)).await.unwrap();
        (Pricer::new(store.clone(), tier), store)
    }

    struct HalfPrice;

    #[async_trait]
    impl TierHooks for HalfPrice {
        async fn package_pricing(&self, _user_id: i64, package_id: i64) -> Result<Option<TierPriceCache>> {
            Ok(Some(TierPriceCache {
                group_id: 2,
                package_id,
                monthly_price: 500,
                unit_core: 150,
                unit_mem: 100,
                unit_disk: 5,
                unit_bw: 25,
                updated_at: Utc::now(),
            }))
        }
    }

    #[test]
    fn test_validate_addons() {
        let p = plan(1);
        let ok = CartSpec {
            add_cores: 2,
            add_mem_gb: 4,
            ..CartSpec::default()
        };
        assert!(validate_addons(&p, &ok).is_ok());

        let odd_mem = CartSpec {
            add_mem_gb: 3,
            ..CartSpec::default()
        };
        assert!(matches!(validate_addons(&p, &odd_mem), Err(Error::InvalidInput(_))));

        let disabled_bw = CartSpec {
            add_bw_mbps: 1,
            ..CartSpec::default()
        };
        assert!(validate_addons(&p, &disabled_bw).is_err());
    }

    #[tokio::test]
    async fn test_price_line_without_cycle() {
        let (pricer, store) = pricer_with(Arc::new(super::super::hooks::NoopTierHooks)).await;
        let pkg = store.list_packages().await.unwrap().remove(0);
        let spec = CartSpec {
            add_cores: 1,
            add_disk_gb: 10,
            duration_months: 3,
            ..CartSpec::default()
        };
        let priced = pricer
            .price_line(1, &OrderLine::new(pkg.id, 0, spec, 2))
            .await
            .unwrap();
        assert_eq!(priced.unit_monthly, 1000 + 300 + 100);
        assert_eq!(priced.unit_total, 1400 * 3);
        assert_eq!(priced.total(), 1400 * 3 * 2);
        assert_eq!(priced.line.spec.duration_months, 3);
    }

    #[tokio::test]
    async fn test_billing_cycle_term() {
        let (pricer, store) = pricer_with(Arc::new(super::super::hooks::NoopTierHooks)).await;
        let pkg = store.list_packages().await.unwrap().remove(0);
        let cycle = store
            .create_billing_cycle(BillingCycle {
                id: 0,
                name: "quarter".into(),
                months: 3,
                multiplier: 2.5005,
                min_qty: 1,
                max_qty: 4,
                active: true,
            })
            .await
            .unwrap();
        let spec = CartSpec {
            billing_cycle_id: Some(cycle.id),
            cycle_qty: 2,
            ..CartSpec::default()
        };
        let priced = pricer
            .price_line(1, &OrderLine::new(pkg.id, 0, spec.clone(), 1))
            .await
            .unwrap();
        assert_eq!(priced.months, 6);
        // 1000 * 5.001 = 5001
        assert_eq!(priced.unit_total, 5001);

        let too_many = CartSpec {
            cycle_qty: 5,
            ..spec
        };
        assert!(matches!(
            pricer.price_line(1, &OrderLine::new(pkg.id, 0, too_many, 1)).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_tier_prices_override_list() {
        let (pricer, store) = pricer_with(Arc::new(HalfPrice)).await;
        let pkg = store.list_packages().await.unwrap().remove(0);
        let spec = CartSpec {
            add_cores: 2,
            ..CartSpec::default()
        };
        let priced = pricer
            .price_line(1, &OrderLine::new(pkg.id, 0, spec, 1))
            .await
            .unwrap();
        assert_eq!(priced.unit_total, 500 + 300);
    }
}
