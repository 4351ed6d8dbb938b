// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::domain::{
    AuditLog, MembershipSource, TierAutoRule, TierDiscountRule, TierGroup, TierMembership,
    TierPriceCache, User, UserRole,
};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::orders::TierHooks;
use crate::store::Store;

use super::rules::{
    PERMILLE_MAX, UserMetrics, conditions_match, list_prices, parse_conditions, resolve_prices,
    same_scope,
};

pub const DEFAULT_GROUP_NAME: &str = "Default";
const DEFAULT_COLOR: &str = "#1677ff";
const DEFAULT_ICON: &str = "badge";

/// User tier groups, their rules and the per-group price cache.
#[derive(Clone)]
pub struct TierService {
    store: Store,
    rebuild_locks: Arc<KeyedLocks<i64>>,
}

impl TierService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            rebuild_locks: Arc::new(KeyedLocks::new()),
        }
    }

    async fn audit(&self, actor_id: i64, action: &str, target_type: &str, target_id: i64) {
        let log = AuditLog {
            id: 0,
            actor_id,
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            detail_json: "{}".to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.audit_logs.add_audit_log(log).await {
            warn!(action, error = %e, "Failed to write audit log");
        }
    }

    /// The default group, created with an always-matching auto rule on
    /// first use.
    pub async fn ensure_default_group(&self) -> Result<TierGroup> {
        let groups = self.store.tiers.list_groups().await?;
        if let Some(group) = groups.into_iter().find(|g| g.is_default) {
            return Ok(group);
        }
        let now = Utc::now();
        let group = self
            .store
            .tiers
            .create_group(TierGroup {
                id: 0,
                name: DEFAULT_GROUP_NAME.to_string(),
                color: DEFAULT_COLOR.to_string(),
                icon: DEFAULT_ICON.to_string(),
                priority: 0,
                auto_approve_enabled: true,
                is_default: true,
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.store
            .tiers
            .create_auto_rule(TierAutoRule {
                id: 0,
                group_id: group.id,
                duration_days: -1,
                conditions_json: "[]".to_string(),
                sort_order: 0,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!(group_id = group.id, "Created default tier group");
        self.rebuild_group_cache_async(group.id);
        Ok(group)
    }

    /// Put a plain user without a group into the default group.
    pub async fn ensure_user_has_group(&self, user_id: i64) -> Result<bool> {
        if user_id <= 0 {
            return Err(Error::invalid("user id is required"));
        }
        let default = self.ensure_default_group().await?;
        let mut user = self.store.users.get_user(user_id).await?;
        if user.role != UserRole::User || user.tier_group_id.is_some_and(|g| g > 0) {
            return Ok(false);
        }
        self.assign(&mut user, default.id, MembershipSource::Auto, None).await?;
        Ok(true)
    }

    async fn assign(
        &self,
        user: &mut User,
        group_id: i64,
        source: MembershipSource,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        let created_at = self
            .store
            .tiers
            .get_membership(user.id)
            .await?
            .map(|m| m.created_at)
            .unwrap_or(now);
        self.store
            .tiers
            .upsert_membership(&TierMembership {
                user_id: user.id,
                group_id,
                source,
                expires_at,
                created_at,
                updated_at: now,
            })
            .await?;
        user.tier_group_id = Some(group_id);
        user.tier_expires_at = expires_at;
        self.store.users.update_user(user).await
    }

    pub async fn list_groups(&self) -> Result<Vec<TierGroup>> {
        self.ensure_default_group().await?;
        let mut groups = self.store.tiers.list_groups().await?;
        groups.sort_by_key(|g| (std::cmp::Reverse(g.priority), g.id));
        Ok(groups)
    }

    pub async fn get_group(&self, id: i64) -> Result<TierGroup> {
        self.store.tiers.get_group(id).await
    }

    pub async fn create_group(&self, admin_id: i64, mut group: TierGroup) -> Result<TierGroup> {
        group.name = group.name.trim().to_string();
        if group.name.is_empty() {
            return Err(Error::invalid("group name is required"));
        }
        if group.icon.is_empty() {
            group.icon = DEFAULT_ICON.to_string();
        }
        if group.color.is_empty() {
            group.color = DEFAULT_COLOR.to_string();
        }
        group.is_default = false;
        let now = Utc::now();
        group.created_at = now;
        group.updated_at = now;
        let group = self.store.tiers.create_group(group).await?;
        self.rebuild_group_cache_async(group.id);
        self.audit(admin_id, "user_tier_group.create", "user_tier_group", group.id).await;
        Ok(group)
    }

    /// The default group keeps its priority and auto-approve flag.
    pub async fn update_group(&self, admin_id: i64, mut group: TierGroup) -> Result<()> {
        let old = self.store.tiers.get_group(group.id).await?;
        group.name = group.name.trim().to_string();
        if group.name.is_empty() {
            return Err(Error::invalid("group name is required"));
        }
        if old.is_default {
            group.priority = old.priority;
            group.auto_approve_enabled = old.auto_approve_enabled;
        }
        group.is_default = old.is_default;
        group.created_at = old.created_at;
        self.store.tiers.update_group(&group).await?;
        self.rebuild_group_cache_async(group.id);
        self.audit(admin_id, "user_tier_group.update", "user_tier_group", group.id).await;
        Ok(())
    }

    pub async fn delete_group(&self, admin_id: i64, id: i64) -> Result<()> {
        let group = self.store.tiers.get_group(id).await?;
        if group.is_default {
            return Err(Error::forbidden("the default group cannot be deleted"));
        }
        self.store.tiers.delete_group(id).await?;
        self.audit(admin_id, "user_tier_group.delete", "user_tier_group", id).await;
        Ok(())
    }

    pub async fn list_discount_rules(&self, group_id: i64) -> Result<Vec<TierDiscountRule>> {
        self.store.tiers.list_discount_rules(group_id).await
    }

    async fn validate_discount_rule(&self, rule: &TierDiscountRule) -> Result<()> {
        let group = self.store.tiers.get_group(rule.group_id).await?;
        if group.is_default {
            return Err(Error::invalid("the default group has no discount rules"));
        }
        let in_range = |v: i64| (0..=PERMILLE_MAX).contains(&v);
        let all = [
            rule.discount_permille,
            rule.add_core_permille,
            rule.add_mem_permille,
            rule.add_disk_permille,
            rule.add_bw_permille,
        ];
        if !all.into_iter().all(in_range) {
            return Err(Error::invalid("discount out of range"));
        }
        if let Some(fixed) = rule.fixed_price {
            if fixed < 0 {
                return Err(Error::invalid("fixed price must not be negative"));
            }
            if rule.scope != crate::domain::DiscountScope::Package {
                return Err(Error::invalid("fixed price requires package scope"));
            }
        }
        let existing = self.store.tiers.list_discount_rules(rule.group_id).await?;
        if existing.iter().any(|r| r.id != rule.id && same_scope(r, rule)) {
            return Err(Error::conflict("a rule with this scope already exists"));
        }
        Ok(())
    }

    pub async fn create_discount_rule(&self, admin_id: i64, mut rule: TierDiscountRule) -> Result<TierDiscountRule> {
        rule.id = 0;
        self.validate_discount_rule(&rule).await?;
        let now = Utc::now();
        rule.created_at = now;
        rule.updated_at = now;
        let rule = self.store.tiers.create_discount_rule(rule).await?;
        self.rebuild_group_cache_async(rule.group_id);
        self.audit(admin_id, "user_tier_rule.create", "user_tier_rule", rule.id).await;
        Ok(rule)
    }

    pub async fn update_discount_rule(&self, admin_id: i64, rule: TierDiscountRule) -> Result<()> {
        self.validate_discount_rule(&rule).await?;
        self.store.tiers.update_discount_rule(&rule).await?;
        self.rebuild_group_cache_async(rule.group_id);
        self.audit(admin_id, "user_tier_rule.update", "user_tier_rule", rule.id).await;
        Ok(())
    }

    pub async fn delete_discount_rule(&self, admin_id: i64, group_id: i64, id: i64) -> Result<()> {
        let group = self.store.tiers.get_group(group_id).await?;
        if group.is_default {
            return Err(Error::invalid("the default group has no discount rules"));
        }
        self.store.tiers.delete_discount_rule(id).await?;
        self.rebuild_group_cache_async(group_id);
        self.audit(admin_id, "user_tier_rule.delete", "user_tier_rule", id).await;
        Ok(())
    }

    pub async fn list_auto_rules(&self, group_id: i64) -> Result<Vec<TierAutoRule>> {
        self.store.tiers.list_auto_rules(group_id).await
    }

    pub async fn create_auto_rule(&self, admin_id: i64, mut rule: TierAutoRule) -> Result<TierAutoRule> {
        let group = self.store.tiers.get_group(rule.group_id).await?;
        if group.is_default {
            return Err(Error::invalid("the default group rules are fixed"));
        }
        if rule.duration_days != -1 && rule.duration_days <= 0 {
            return Err(Error::invalid("duration_days must be -1 or positive"));
        }
        parse_conditions(&rule.conditions_json)
            .map_err(|e| Error::invalid(format!("invalid conditions: {e}")))?;
        let now = Utc::now();
        rule.created_at = now;
        rule.updated_at = now;
        let rule = self.store.tiers.create_auto_rule(rule).await?;
        self.audit(admin_id, "user_tier_auto_rule.create", "user_tier_auto_rule", rule.id).await;
        Ok(rule)
    }

    pub async fn delete_auto_rule(&self, admin_id: i64, group_id: i64, id: i64) -> Result<()> {
        let group = self.store.tiers.get_group(group_id).await?;
        if group.is_default {
            return Err(Error::invalid("the default group rules are fixed"));
        }
        self.store.tiers.delete_auto_rule(id).await?;
        self.audit(admin_id, "user_tier_auto_rule.delete", "user_tier_auto_rule", id).await;
        Ok(())
    }

    /// Manual membership, optionally until `expires_at`.
    pub async fn set_user_group(
        &self,
        admin_id: i64,
        user_id: i64,
        group_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if user_id <= 0 || group_id <= 0 {
            return Err(Error::invalid("user and group are required"));
        }
        let group = self.store.tiers.get_group(group_id).await?;
        let mut user = self.store.users.get_user(user_id).await?;
        self.assign(&mut user, group.id, MembershipSource::Manual, expires_at)
            .await?;
        info!(user_id, group_id, "Tier group set manually");
        self.audit(admin_id, "user_tier.set_user_group", "user", user_id).await;
        Ok(())
    }

    /// Duration of the first auto rule of the group that matches, `None`
    /// when nothing matches. Rules with unreadable conditions are skipped.
    async fn match_auto_rules(&self, group_id: i64, metrics: &UserMetrics) -> Result<Option<i32>> {
        for rule in self.store.tiers.list_auto_rules(group_id).await? {
            let conditions = match parse_conditions(&rule.conditions_json) {
                Ok(c) => c,
                Err(e) => {
                    debug!(rule_id = rule.id, error = %e, "Skipping auto rule");
                    continue;
                }
            };
            if conditions_match(&conditions, metrics) {
                return Ok(Some(rule.duration_days));
            }
        }
        Ok(None)
    }

    /// Promote the user to the highest-priority group whose auto rules
    /// match, if it outranks the current one or the current membership
    /// expired. An unexpired manual membership in a group without
    /// auto-approve is kept.
    pub async fn try_auto_approve(&self, user_id: i64, reason: &str) -> Result<()> {
        if user_id <= 0 {
            return Err(Error::invalid("user id is required"));
        }
        self.ensure_default_group().await?;
        let mut user = self.store.users.get_user(user_id).await?;
        let now = Utc::now();

        let mut current_group = 0;
        let mut current_priority = -1;
        let mut current_expired = true;
        if let Some(member) = self.store.tiers.get_membership(user_id).await? {
            current_group = member.group_id;
            current_expired = member.is_expired(now);
            if let Ok(group) = self.store.tiers.get_group(member.group_id).await {
                current_priority = group.priority;
                if member.source == MembershipSource::Manual
                    && !group.auto_approve_enabled
                    && !current_expired
                {
                    return Ok(());
                }
            }
        }

        let mut groups = self.store.tiers.list_groups().await?;
        groups.sort_by_key(|g| (std::cmp::Reverse(g.priority), g.id));
        let balance = self.store.wallets.get_wallet(user_id).await.map(|w| w.balance).unwrap_or(0);
        let metrics = UserMetrics::new(user.created_at, balance, now);

        for group in groups {
            if !group.auto_approve_enabled {
                continue;
            }
            if !current_expired && group.priority <= current_priority {
                continue;
            }
            let Some(duration_days) = self.match_auto_rules(group.id, &metrics).await? else {
                continue;
            };
            let expires_at = (duration_days >= 0).then(|| now + Duration::days(i64::from(duration_days)));
            self.assign(&mut user, group.id, MembershipSource::Auto, expires_at)
                .await?;
            if group.id != current_group {
                info!(user_id, group_id = group.id, reason, "User promoted to tier group");
                self.audit(0, &format!("user_tier.auto_approve.{reason}"), "user", user_id)
                    .await;
            }
            return Ok(());
        }
        Ok(())
    }

    /// Re-evaluate users whose membership expired. Returns how many were
    /// processed without error.
    pub async fn reconcile_expired(&self, limit: i64) -> Result<usize> {
        let limit = if limit <= 0 { 200 } else { limit };
        let expired = self
            .store
            .tiers
            .list_expired_memberships(Utc::now(), limit)
            .await?;
        let mut count = 0;
        for member in expired {
            match self.try_auto_approve(member.user_id, "expire").await {
                Ok(()) => count += 1,
                Err(e) => warn!(user_id = member.user_id, error = %e, "Tier reconcile failed"),
            }
        }
        Ok(count)
    }

    /// Recompute and atomically replace the cache rows of a group. Calls
    /// for the same group run one after another.
    pub async fn rebuild_group_cache(&self, group_id: i64) -> Result<usize> {
        let _guard = self.rebuild_locks.lock(group_id).await;
        let rules = self.store.tiers.list_discount_rules(group_id).await?;
        let packages = self.store.catalog.list_packages().await?;
        let plans: HashMap<i64, _> = self
            .store
            .catalog
            .list_plan_groups()
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let now = Utc::now();
        let rows: Vec<TierPriceCache> = packages
            .iter()
            .filter_map(|pkg| {
                plans
                    .get(&pkg.plan_group_id)
                    .map(|plan| resolve_prices(group_id, &rules, pkg, plan, now))
            })
            .collect();
        let count = rows.len();
        self.store.tiers.replace_price_cache(group_id, rows).await?;
        debug!(group_id, rows = count, "Tier price cache rebuilt");
        Ok(count)
    }

    /// Rebuild in the background. No-op outside a tokio runtime.
    pub fn rebuild_group_cache_async(&self, group_id: i64) {
        if group_id <= 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = self.clone();
        handle.spawn(async move {
            if let Err(e) = this.rebuild_group_cache(group_id).await {
                warn!(group_id, error = %e, "Tier price cache rebuild failed");
            }
        });
    }

    pub async fn rebuild_all(&self) -> Result<()> {
        for group in self.store.tiers.list_groups().await? {
            self.rebuild_group_cache(group.id).await?;
        }
        Ok(())
    }

    async fn group_of(&self, user_id: i64) -> Result<TierGroup> {
        let user = self.store.users.get_user(user_id).await?;
        match user.tier_group_id.filter(|g| *g > 0) {
            Some(id) => match self.store.tiers.get_group(id).await {
                Ok(group) => Ok(group),
                Err(Error::NotFound(_)) => self.ensure_default_group().await,
                Err(e) => Err(e),
            },
            None => self.ensure_default_group().await,
        }
    }

    /// Prices of a package for the user's group. A cold cache answers with
    /// list prices and schedules a rebuild.
    pub async fn package_pricing(&self, user_id: i64, package_id: i64) -> Result<(TierPriceCache, i64)> {
        if user_id <= 0 || package_id <= 0 {
            return Err(Error::invalid("user and package are required"));
        }
        if let Err(e) = self.try_auto_approve(user_id, "pricing").await {
            debug!(user_id, error = %e, "Auto approve skipped");
        }
        let group = self.group_of(user_id).await?;
        if let Some(row) = self.store.tiers.get_price_cache(group.id, package_id).await? {
            return Ok((row, group.id));
        }
        self.rebuild_group_cache_async(group.id);
        let pkg = self.store.catalog.get_package(package_id).await?;
        let plan = self.store.catalog.get_plan_group(pkg.plan_group_id).await?;
        Ok((list_prices(group.id, &pkg, &plan, Utc::now()), group.id))
    }
}

#[async_trait]
impl TierHooks for TierService {
    async fn package_pricing(&self, user_id: i64, package_id: i64) -> Result<Option<TierPriceCache>> {
        let (row, _) = TierService::package_pricing(self, user_id, package_id).await?;
        Ok(Some(row))
    }

    async fn auto_approve(&self, user_id: i64) -> Result<bool> {
        Ok(self.group_of(user_id).await?.auto_approve_enabled)
    }

    async fn on_order_paid(&self, user_id: i64) {
        if let Err(e) = self.try_auto_approve(user_id, "order_paid").await {
            warn!(user_id, error = %e, "Tier promotion after payment failed");
        }
    }
}
