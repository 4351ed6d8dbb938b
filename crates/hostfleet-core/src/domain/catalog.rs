// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};

/// A catalog category bound to one automation plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GoodsType {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub active: bool,
    pub sort_order: i32,
    pub automation_category: String,
    pub automation_plugin_id: String,
    pub automation_instance_id: String,
}

/// Add-on kinds a plan group prices per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addon {
    Cores,
    MemGb,
    DiskGb,
    BwMbps,
}

impl Addon {
    pub const ALL: [Addon; 4] = [Addon::Cores, Addon::MemGb, Addon::DiskGb, Addon::BwMbps];

    pub fn as_str(&self) -> &'static str {
        match self {
            Addon::Cores => "cores",
            Addon::MemGb => "memory",
            Addon::DiskGb => "disk",
            Addon::BwMbps => "bandwidth",
        }
    }
}

/// `{min, max, step}` of an add-on. A `-1` on either bound forbids the add-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddonRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
}

impl AddonRange {
    pub fn is_disabled(&self) -> bool {
        self.min == -1 || self.max == -1
    }

    pub fn allows(&self, value: i32) -> bool {
        if self.is_disabled() {
            return value == 0;
        }
        if value < self.min || value > self.max {
            return false;
        }
        self.step <= 0 || value % self.step == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanGroup {
    pub id: i64,
    pub goods_type_id: i64,
    pub region_id: i64,
    pub name: String,
    pub line_id: i64,
    pub unit_core: i64,
    pub unit_mem: i64,
    pub unit_disk: i64,
    pub unit_bw: i64,
    pub add_core_min: i32,
    pub add_core_max: i32,
    pub add_core_step: i32,
    pub add_mem_min: i32,
    pub add_mem_max: i32,
    pub add_mem_step: i32,
    pub add_disk_min: i32,
    pub add_disk_max: i32,
    pub add_disk_step: i32,
    pub add_bw_min: i32,
    pub add_bw_max: i32,
    pub add_bw_step: i32,
    pub active: bool,
}

impl PlanGroup {
    pub fn range(&self, addon: Addon) -> AddonRange {
        let (min, max, step) = match addon {
            Addon::Cores => (self.add_core_min, self.add_core_max, self.add_core_step),
            Addon::MemGb => (self.add_mem_min, self.add_mem_max, self.add_mem_step),
            Addon::DiskGb => (self.add_disk_min, self.add_disk_max, self.add_disk_step),
            Addon::BwMbps => (self.add_bw_min, self.add_bw_max, self.add_bw_step),
        };
        AddonRange { min, max, step }
    }

    pub fn unit_price(&self, addon: Addon) -> i64 {
        match addon {
            Addon::Cores => self.unit_core,
            Addon::MemGb => self.unit_mem,
            Addon::DiskGb => self.unit_disk,
            Addon::BwMbps => self.unit_bw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Package {
    pub id: i64,
    pub plan_group_id: i64,
    pub goods_type_id: i64,
    /// Automation-side product id.
    pub product_id: i64,
    pub name: String,
    pub cores: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub port_num: i32,
    pub monthly_price: i64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingCycle {
    pub id: i64,
    pub name: String,
    pub months: i32,
    pub multiplier: f64,
    /// 0 means unbounded.
    pub min_qty: i32,
    /// 0 means unbounded.
    pub max_qty: i32,
    pub active: bool,
}

/// OS image offered to buyers, mapped to the automation template id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SystemImage {
    pub id: i64,
    pub image_id: i64,
    pub name: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addon_range_rules() {
        let disabled = AddonRange {
            min: -1,
            max: 8,
            step: 1,
        };
        assert!(disabled.allows(0));
        assert!(!disabled.allows(1));

        let r = AddonRange {
            min: 0,
            max: 16,
            step: 2,
        };
        assert!(r.allows(0));
        assert!(r.allows(8));
        assert!(!r.allows(3));
        assert!(!r.allows(18));
        assert!(!r.allows(-2));
    }
}
