// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User tier groups: scoped discount rules, a per-group price cache and
//! rule-driven promotion between groups.

mod rules;
mod service;

pub use rules::{
    PERMILLE_MAX, UserMetrics, best_addon_rule, best_base_rule, conditions_match, list_prices,
    parse_conditions, resolve_prices, same_scope,
};
pub use service::{DEFAULT_GROUP_NAME, TierService};
