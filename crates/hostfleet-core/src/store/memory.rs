// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backend.
//!
//! All tables live behind a single mutex, so every method is atomic. The lock
//! is never held across an await point.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::*;
use crate::error::Error;

#[derive(Default)]
struct Tables {
    next_id: i64,
    users: BTreeMap<i64, User>,
    goods_types: BTreeMap<i64, GoodsType>,
    plan_groups: BTreeMap<i64, PlanGroup>,
    packages: BTreeMap<i64, Package>,
    billing_cycles: BTreeMap<i64, BillingCycle>,
    system_images: BTreeMap<i64, SystemImage>,
    cart_items: BTreeMap<i64, CartItem>,
    orders: BTreeMap<i64, Order>,
    order_items: BTreeMap<i64, OrderItem>,
    payments: BTreeMap<i64, Payment>,
    events: BTreeMap<i64, Vec<OrderEvent>>,
    coupon_redemptions: Vec<(i64, i64, i64)>,
    vps: BTreeMap<i64, VpsInstance>,
    automation_logs: Vec<AutomationLog>,
    provision_jobs: BTreeMap<i64, ProvisionJob>,
    resize_tasks: BTreeMap<i64, ResizeTask>,
    installations: BTreeMap<InstanceKey, PluginInstallation>,
    method_overrides: BTreeMap<(InstanceKey, String), PaymentMethodOverride>,
    settings: BTreeMap<String, Setting>,
    tier_groups: BTreeMap<i64, TierGroup>,
    discount_rules: BTreeMap<i64, TierDiscountRule>,
    auto_rules: BTreeMap<i64, TierAutoRule>,
    memberships: BTreeMap<i64, TierMembership>,
    price_cache: BTreeMap<(i64, i64), TierPriceCache>,
    wallets: BTreeMap<i64, Wallet>,
    wallet_txs: Vec<WalletTransaction>,
    coupons: BTreeMap<i64, Coupon>,
    product_groups: BTreeMap<i64, CouponProductGroup>,
    verifications: BTreeMap<i64, RealNameVerification>,
    push_tokens: BTreeMap<i64, PushToken>,
    task_runs: BTreeMap<i64, ScheduledTaskRun>,
    reset_tokens: BTreeMap<i64, PasswordResetToken>,
    notifications: Vec<Notification>,
    audit_logs: Vec<AuditLog>,
    /// Timestamps of log tables only purged here (sync logs, probes).
    other_logs: HashMap<RetentionTarget, Vec<DateTime<Utc>>>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of every repository family.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a row in a log table that has no writer in this crate.
    pub fn seed_log(&self, target: RetentionTarget, created_at: DateTime<Utc>) {
        self.tables
            .lock()
            .other_logs
            .entry(target)
            .or_default()
            .push(created_at);
    }

    pub fn automation_log_count(&self) -> usize {
        self.tables.lock().automation_logs.len()
    }
}

fn missing(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{kind} {id}"))
}

fn page<T: Clone>(items: Vec<T>, limit: i64, offset: i64) -> Page<T> {
    let total = items.len() as i64;
    let offset = offset.max(0) as usize;
    let limit = if limit <= 0 { usize::MAX } else { limit as usize };
    Page {
        items: items.into_iter().skip(offset).take(limit).collect(),
        total,
    }
}

fn take<T>(items: impl Iterator<Item = T>, limit: i64) -> Vec<T> {
    let limit = if limit <= 0 { usize::MAX } else { limit as usize };
    items.take(limit).collect()
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get_user(&self, id: i64) -> Result<User> {
        self.tables
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("user", id))
    }

    async fn create_user(&self, mut user: User) -> Result<User> {
        let mut t = self.tables.lock();
        if t.users.values().any(|u| u.username == user.username) {
            return Err(Error::conflict(format!("username {}", user.username)));
        }
        user.id = t.id();
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .users
            .get_mut(&user.id)
            .ok_or_else(|| missing("user", user.id))?;
        *slot = user.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_active_admins(&self) -> Result<Vec<User>> {
        Ok(self
            .tables
            .lock()
            .users
            .values()
            .filter(|u| u.is_admin() && u.is_active())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn get_goods_type(&self, id: i64) -> Result<GoodsType> {
        self.tables
            .lock()
            .goods_types
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("goods type", id))
    }

    async fn list_goods_types(&self) -> Result<Vec<GoodsType>> {
        let mut all: Vec<_> = self.tables.lock().goods_types.values().cloned().collect();
        all.sort_by_key(|g| (g.sort_order, g.id));
        Ok(all)
    }

    async fn create_goods_type(&self, mut goods_type: GoodsType) -> Result<GoodsType> {
        let mut t = self.tables.lock();
        goods_type.id = t.id();
        t.goods_types.insert(goods_type.id, goods_type.clone());
        Ok(goods_type)
    }

    async fn get_plan_group(&self, id: i64) -> Result<PlanGroup> {
        self.tables
            .lock()
            .plan_groups
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("plan group", id))
    }

    async fn list_plan_groups(&self) -> Result<Vec<PlanGroup>> {
        Ok(self.tables.lock().plan_groups.values().cloned().collect())
    }

    async fn create_plan_group(&self, mut plan_group: PlanGroup) -> Result<PlanGroup> {
        let mut t = self.tables.lock();
        plan_group.id = t.id();
        t.plan_groups.insert(plan_group.id, plan_group.clone());
        Ok(plan_group)
    }

    async fn get_package(&self, id: i64) -> Result<Package> {
        self.tables
            .lock()
            .packages
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("package", id))
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        Ok(self.tables.lock().packages.values().cloned().collect())
    }

    async fn create_package(&self, mut package: Package) -> Result<Package> {
        let mut t = self.tables.lock();
        package.id = t.id();
        t.packages.insert(package.id, package.clone());
        Ok(package)
    }

    async fn get_billing_cycle(&self, id: i64) -> Result<BillingCycle> {
        self.tables
            .lock()
            .billing_cycles
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("billing cycle", id))
    }

    async fn create_billing_cycle(&self, mut cycle: BillingCycle) -> Result<BillingCycle> {
        let mut t = self.tables.lock();
        cycle.id = t.id();
        t.billing_cycles.insert(cycle.id, cycle.clone());
        Ok(cycle)
    }

    async fn get_system_image(&self, id: i64) -> Result<SystemImage> {
        self.tables
            .lock()
            .system_images
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("system image", id))
    }

    async fn create_system_image(&self, mut image: SystemImage) -> Result<SystemImage> {
        let mut t = self.tables.lock();
        image.id = t.id();
        t.system_images.insert(image.id, image.clone());
        Ok(image)
    }
}

#[async_trait]
impl CartRepository for MemoryStore {
    async fn add_cart_item(&self, mut item: CartItem) -> Result<CartItem> {
        let mut t = self.tables.lock();
        item.id = t.id();
        t.cart_items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn list_cart_items(&self, user_id: i64) -> Result<Vec<CartItem>> {
        Ok(self
            .tables
            .lock()
            .cart_items
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn clear_cart(&self, user_id: i64) -> Result<()> {
        self.tables
            .lock()
            .cart_items
            .retain(|_, c| c.user_id != user_id);
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create_order_with_items(
        &self,
        mut order: Order,
        items: Vec<OrderItem>,
        opts: CreateOrderOptions,
    ) -> Result<(Order, Vec<OrderItem>)> {
        let mut t = self.tables.lock();
        if !order.idempotency_key.is_empty()
            && t.orders.values().any(|o| {
                o.user_id == order.user_id && o.idempotency_key == order.idempotency_key
            })
        {
            return Err(Error::conflict("order idempotency key"));
        }
        if t.orders.values().any(|o| o.order_no == order.order_no) {
            return Err(Error::conflict(format!("order_no {}", order.order_no)));
        }
        order.id = t.id();
        let mut saved = Vec::with_capacity(items.len());
        for mut item in items {
            item.id = t.id();
            item.order_id = order.id;
            t.order_items.insert(item.id, item.clone());
            saved.push(item);
        }
        t.orders.insert(order.id, order.clone());
        if let Some(user_id) = opts.clear_cart_of {
            t.cart_items.retain(|_, c| c.user_id != user_id);
        }
        if let Some(coupon_id) = opts.coupon_id {
            t.coupon_redemptions.push((coupon_id, order.user_id, order.id));
        }
        Ok((order, saved))
    }

    async fn get_order(&self, id: i64) -> Result<Order> {
        self.tables
            .lock()
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("order", id))
    }

    async fn get_order_by_no(&self, order_no: &str) -> Result<Order> {
        self.tables
            .lock()
            .orders
            .values()
            .find(|o| o.order_no == order_no)
            .cloned()
            .ok_or_else(|| missing("order", order_no))
    }

    async fn get_order_by_idempotency_key(
        &self,
        user_id: i64,
        key: &str,
    ) -> Result<Option<Order>> {
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self
            .tables
            .lock()
            .orders
            .values()
            .find(|o| o.user_id == user_id && o.idempotency_key == key)
            .cloned())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| missing("order", order.id))?;
        *slot = order.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_order(&self, id: i64) -> Result<()> {
        let mut t = self.tables.lock();
        if t.orders.remove(&id).is_none() {
            return Err(missing("order", id));
        }
        t.order_items.retain(|_, i| i.order_id != id);
        t.payments.retain(|_, p| p.order_id != id);
        t.events.remove(&id);
        t.coupon_redemptions.retain(|(_, _, order_id)| *order_id != id);
        Ok(())
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Order>> {
        let t = self.tables.lock();
        let items: Vec<_> = t
            .orders
            .values()
            .rev()
            .filter(|o| filter.user_id.is_none_or(|u| o.user_id == u))
            .filter(|o| filter.status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        Ok(page(items, limit, offset))
    }

    async fn list_stale_orders(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>> {
        let t = self.tables.lock();
        Ok(take(
            t.orders
                .values()
                .filter(|o| o.status == status && o.updated_at < updated_before)
                .cloned(),
            limit,
        ))
    }

    async fn count_user_orders(&self, user_id: i64) -> Result<i64> {
        Ok(self
            .tables
            .lock()
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .count() as i64)
    }

    async fn list_order_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        Ok(self
            .tables
            .lock()
            .order_items
            .values()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn get_order_item(&self, id: i64) -> Result<OrderItem> {
        self.tables
            .lock()
            .order_items
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("order item", id))
    }

    async fn update_order_item(&self, item: &OrderItem) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .order_items
            .get_mut(&item.id)
            .ok_or_else(|| missing("order item", item.id))?;
        *slot = item.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_items_by_status(&self, status: ItemStatus, limit: i64) -> Result<Vec<OrderItem>> {
        let t = self.tables.lock();
        Ok(take(
            t.order_items
                .values()
                .filter(|i| i.status == status)
                .cloned(),
            limit,
        ))
    }

    async fn has_open_item_for_vps(&self, vps_id: i64, action: ItemAction) -> Result<bool> {
        let t = self.tables.lock();
        Ok(t.order_items.values().any(|i| {
            i.vps_id == Some(vps_id)
                && i.action == action
                && t.orders
                    .get(&i.order_id)
                    .is_some_and(|o| o.status.is_open())
        }))
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn create_payment(&self, mut payment: Payment) -> Result<Payment> {
        let mut t = self.tables.lock();
        if !payment.trade_no.is_empty()
            && t
                .payments
                .values()
                .any(|p| p.method == payment.method && p.trade_no == payment.trade_no)
        {
            return Err(Error::conflict(format!(
                "payment {}/{}",
                payment.method, payment.trade_no
            )));
        }
        payment.id = t.id();
        t.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get_payment_by_trade_no(
        &self,
        method: &str,
        trade_no: &str,
    ) -> Result<Option<Payment>> {
        Ok(self
            .tables
            .lock()
            .payments
            .values()
            .find(|p| p.method == method && p.trade_no == trade_no)
            .cloned())
    }

    async fn list_payments_by_order(&self, order_id: i64) -> Result<Vec<Payment>> {
        Ok(self
            .tables
            .lock()
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn update_payment(&self, payment: &Payment) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .payments
            .get_mut(&payment.id)
            .ok_or_else(|| missing("payment", payment.id))?;
        *slot = payment.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn append_event(
        &self,
        order_id: i64,
        event_type: &str,
        data_json: &str,
    ) -> Result<OrderEvent> {
        let mut t = self.tables.lock();
        let id = t.id();
        let log = t.events.entry(order_id).or_default();
        let seq = log.last().map(|e| e.seq).unwrap_or(0) + 1;
        let event = OrderEvent {
            id,
            order_id,
            seq,
            event_type: event_type.to_string(),
            data_json: data_json.to_string(),
            created_at: Utc::now(),
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn list_events_after(
        &self,
        order_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<OrderEvent>> {
        let t = self.tables.lock();
        let Some(log) = t.events.get(&order_id) else {
            return Ok(Vec::new());
        };
        Ok(take(
            log.iter().filter(|e| e.seq > after_seq).cloned(),
            limit,
        ))
    }
}

#[async_trait]
impl VpsRepository for MemoryStore {
    async fn create_instance(&self, mut vps: VpsInstance) -> Result<VpsInstance> {
        let mut t = self.tables.lock();
        vps.id = t.id();
        t.vps.insert(vps.id, vps.clone());
        Ok(vps)
    }

    async fn get_instance(&self, id: i64) -> Result<VpsInstance> {
        self.tables
            .lock()
            .vps
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("vps", id))
    }

    async fn get_instance_by_order_item(&self, order_item_id: i64) -> Result<Option<VpsInstance>> {
        Ok(self
            .tables
            .lock()
            .vps
            .values()
            .find(|v| v.order_item_id == order_item_id)
            .cloned())
    }

    async fn list_instances(&self, limit: i64, offset: i64) -> Result<Page<VpsInstance>> {
        let items: Vec<_> = self.tables.lock().vps.values().cloned().collect();
        Ok(page(items, limit, offset))
    }

    async fn list_expiring(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<VpsInstance>> {
        let mut items: Vec<_> = self
            .tables
            .lock()
            .vps
            .values()
            .filter(|v| v.expire_at.is_some_and(|at| at < before))
            .cloned()
            .collect();
        items.sort_by_key(|v| (v.expire_at, v.id));
        Ok(take(items.into_iter(), limit))
    }

    async fn update_instance(&self, vps: &VpsInstance) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t.vps.get_mut(&vps.id).ok_or_else(|| missing("vps", vps.id))?;
        *slot = vps.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_instance(&self, id: i64) -> Result<()> {
        self.tables
            .lock()
            .vps
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing("vps", id))
    }
}

#[async_trait]
impl AutomationLogRepository for MemoryStore {
    async fn add_automation_log(&self, mut log: AutomationLog) -> Result<()> {
        let mut t = self.tables.lock();
        log.id = t.id();
        t.automation_logs.push(log);
        Ok(())
    }
}

#[async_trait]
impl ProvisionJobRepository for MemoryStore {
    async fn create_provision_job(&self, mut job: ProvisionJob) -> Result<ProvisionJob> {
        let mut t = self.tables.lock();
        if t
            .provision_jobs
            .values()
            .any(|j| j.order_item_id == job.order_item_id)
        {
            return Err(Error::conflict(format!(
                "provision job for item {}",
                job.order_item_id
            )));
        }
        job.id = t.id();
        t.provision_jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_provision_job_by_item(&self, order_item_id: i64) -> Result<Option<ProvisionJob>> {
        Ok(self
            .tables
            .lock()
            .provision_jobs
            .values()
            .find(|j| j.order_item_id == order_item_id)
            .cloned())
    }

    async fn list_due_provision_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProvisionJob>> {
        let t = self.tables.lock();
        Ok(take(
            t.provision_jobs
                .values()
                .filter(|j| j.status == JobStatus::Pending && j.next_run_at <= now)
                .cloned(),
            limit,
        ))
    }

    async fn update_provision_job(&self, job: &ProvisionJob) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .provision_jobs
            .get_mut(&job.id)
            .ok_or_else(|| missing("provision job", job.id))?;
        *slot = job.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ResizeTaskRepository for MemoryStore {
    async fn create_resize_task(&self, mut task: ResizeTask) -> Result<ResizeTask> {
        let mut t = self.tables.lock();
        if t
            .resize_tasks
            .values()
            .any(|r| r.vps_id == task.vps_id && r.status.is_open())
        {
            return Err(Error::conflict(format!(
                "resize task pending for vps {}",
                task.vps_id
            )));
        }
        task.id = t.id();
        t.resize_tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn has_pending_resize_task(&self, vps_id: i64) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .resize_tasks
            .values()
            .any(|r| r.vps_id == vps_id && r.status.is_open()))
    }

    async fn list_due_resize_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ResizeTask>> {
        let t = self.tables.lock();
        Ok(take(
            t.resize_tasks
                .values()
                .filter(|r| r.status == JobStatus::Pending && r.next_run_at <= now)
                .cloned(),
            limit,
        ))
    }

    async fn update_resize_task(&self, task: &ResizeTask) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .resize_tasks
            .get_mut(&task.id)
            .ok_or_else(|| missing("resize task", task.id))?;
        *slot = task.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl PluginInstallationRepository for MemoryStore {
    async fn upsert_installation(&self, inst: &PluginInstallation) -> Result<()> {
        let mut row = inst.clone();
        row.updated_at = Utc::now();
        self.tables.lock().installations.insert(inst.key(), row);
        Ok(())
    }

    async fn get_installation(&self, key: &InstanceKey) -> Result<PluginInstallation> {
        self.tables
            .lock()
            .installations
            .get(key)
            .cloned()
            .ok_or_else(|| missing("plugin instance", key))
    }

    async fn list_installations(&self) -> Result<Vec<PluginInstallation>> {
        Ok(self.tables.lock().installations.values().cloned().collect())
    }

    async fn list_plugin_instances(
        &self,
        category: PluginCategory,
        plugin_id: &str,
    ) -> Result<Vec<PluginInstallation>> {
        Ok(self
            .tables
            .lock()
            .installations
            .values()
            .filter(|i| i.category == category && i.plugin_id == plugin_id)
            .cloned()
            .collect())
    }

    async fn delete_installation(&self, key: &InstanceKey) -> Result<()> {
        let mut t = self.tables.lock();
        t.installations
            .remove(key)
            .ok_or_else(|| missing("plugin instance", key))?;
        t.method_overrides.retain(|(k, _), _| k != key);
        Ok(())
    }
}

#[async_trait]
impl PluginPaymentMethodRepository for MemoryStore {
    async fn list_payment_method_overrides(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<PaymentMethodOverride>> {
        Ok(self
            .tables
            .lock()
            .method_overrides
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn upsert_payment_method_override(&self, ov: &PaymentMethodOverride) -> Result<()> {
        let key = InstanceKey::new(ov.category, &ov.plugin_id, &ov.instance_id);
        self.tables
            .lock()
            .method_overrides
            .insert((key, ov.method.clone()), ov.clone());
        Ok(())
    }
}

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        Ok(self.tables.lock().settings.get(key).cloned())
    }

    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.tables.lock().settings.insert(
            key.to_string(),
            Setting {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_settings(&self) -> Result<Vec<Setting>> {
        Ok(self.tables.lock().settings.values().cloned().collect())
    }
}

#[async_trait]
impl TierRepository for MemoryStore {
    async fn list_groups(&self) -> Result<Vec<TierGroup>> {
        Ok(self.tables.lock().tier_groups.values().cloned().collect())
    }

    async fn get_group(&self, id: i64) -> Result<TierGroup> {
        self.tables
            .lock()
            .tier_groups
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("tier group", id))
    }

    async fn create_group(&self, mut group: TierGroup) -> Result<TierGroup> {
        let mut t = self.tables.lock();
        group.id = t.id();
        t.tier_groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn update_group(&self, group: &TierGroup) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .tier_groups
            .get_mut(&group.id)
            .ok_or_else(|| missing("tier group", group.id))?;
        *slot = group.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_group(&self, id: i64) -> Result<()> {
        let mut t = self.tables.lock();
        t.tier_groups
            .remove(&id)
            .ok_or_else(|| missing("tier group", id))?;
        t.discount_rules.retain(|_, r| r.group_id != id);
        t.auto_rules.retain(|_, r| r.group_id != id);
        t.price_cache.retain(|(g, _), _| *g != id);
        Ok(())
    }

    async fn list_discount_rules(&self, group_id: i64) -> Result<Vec<TierDiscountRule>> {
        Ok(self
            .tables
            .lock()
            .discount_rules
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn create_discount_rule(&self, mut rule: TierDiscountRule) -> Result<TierDiscountRule> {
        let mut t = self.tables.lock();
        rule.id = t.id();
        t.discount_rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_discount_rule(&self, rule: &TierDiscountRule) -> Result<()> {
        let mut t = self.tables.lock();
        let slot = t
            .discount_rules
            .get_mut(&rule.id)
            .ok_or_else(|| missing("discount rule", rule.id))?;
        *slot = rule.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_discount_rule(&self, id: i64) -> Result<()> {
        self.tables
            .lock()
            .discount_rules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing("discount rule", id))
    }

    async fn list_auto_rules(&self, group_id: i64) -> Result<Vec<TierAutoRule>> {
        let mut rules: Vec<_> = self
            .tables
            .lock()
            .auto_rules
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.sort_order, r.id));
        Ok(rules)
    }

    async fn create_auto_rule(&self, mut rule: TierAutoRule) -> Result<TierAutoRule> {
        let mut t = self.tables.lock();
        rule.id = t.id();
        t.auto_rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn delete_auto_rule(&self, id: i64) -> Result<()> {
        self.tables
            .lock()
            .auto_rules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing("auto rule", id))
    }

    async fn get_membership(&self, user_id: i64) -> Result<Option<TierMembership>> {
        Ok(self.tables.lock().memberships.get(&user_id).cloned())
    }

    async fn upsert_membership(&self, membership: &TierMembership) -> Result<()> {
        self.tables
            .lock()
            .memberships
            .insert(membership.user_id, membership.clone());
        Ok(())
    }

    async fn list_expired_memberships(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TierMembership>> {
        let t = self.tables.lock();
        Ok(take(
            t.memberships
                .values()
                .filter(|m| m.is_expired(now))
                .cloned(),
            limit,
        ))
    }

    async fn get_price_cache(
        &self,
        group_id: i64,
        package_id: i64,
    ) -> Result<Option<TierPriceCache>> {
        Ok(self
            .tables
            .lock()
            .price_cache
            .get(&(group_id, package_id))
            .cloned())
    }

    async fn list_price_cache(&self, group_id: i64) -> Result<Vec<TierPriceCache>> {
        Ok(self
            .tables
            .lock()
            .price_cache
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn replace_price_cache(&self, group_id: i64, rows: Vec<TierPriceCache>) -> Result<()> {
        let mut t = self.tables.lock();
        t.price_cache.retain(|(g, _), _| *g != group_id);
        for row in rows {
            t.price_cache.insert((group_id, row.package_id), row);
        }
        Ok(())
    }
}

#[async_trait]
impl WalletRepository for MemoryStore {
    async fn get_wallet(&self, user_id: i64) -> Result<Wallet> {
        Ok(self
            .tables
            .lock()
            .wallets
            .get(&user_id)
            .cloned()
            .unwrap_or(Wallet {
                user_id,
                balance: 0,
                updated_at: Utc::now(),
            }))
    }

    async fn adjust_wallet_balance(&self, adj: WalletAdjustment) -> Result<Wallet> {
        let mut t = self.tables.lock();
        if !adj.ref_type.is_empty()
            && t
                .wallet_txs
                .iter()
                .any(|tx| tx.ref_type == adj.ref_type && tx.ref_id == adj.ref_id)
        {
            return Err(Error::conflict(format!(
                "wallet transaction {}:{}",
                adj.ref_type, adj.ref_id
            )));
        }
        let current = t.wallets.get(&adj.user_id).map(|w| w.balance).unwrap_or(0);
        let next = current
            .checked_add(adj.amount)
            .ok_or_else(|| Error::invalid("wallet amount overflow"))?;
        if next < 0 {
            return Err(Error::InsufficientBalance);
        }
        let now = Utc::now();
        let wallet = Wallet {
            user_id: adj.user_id,
            balance: next,
            updated_at: now,
        };
        t.wallets.insert(adj.user_id, wallet.clone());
        let id = t.id();
        t.wallet_txs.push(WalletTransaction {
            id,
            user_id: adj.user_id,
            amount: adj.amount,
            tx_type: adj.tx_type,
            ref_type: adj.ref_type,
            ref_id: adj.ref_id,
            note: adj.note,
            created_at: now,
        });
        Ok(wallet)
    }

    async fn has_wallet_transaction(&self, ref_type: &str, ref_id: i64) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .wallet_txs
            .iter()
            .any(|tx| tx.ref_type == ref_type && tx.ref_id == ref_id))
    }

    async fn list_wallet_transactions(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<WalletTransaction>> {
        let t = self.tables.lock();
        Ok(take(
            t.wallet_txs
                .iter()
                .rev()
                .filter(|tx| tx.user_id == user_id)
                .cloned(),
            limit,
        ))
    }
}

#[async_trait]
impl CouponRepository for MemoryStore {
    async fn get_coupon_by_code(&self, code: &str) -> Result<Coupon> {
        self.tables
            .lock()
            .coupons
            .values()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .cloned()
            .ok_or_else(|| missing("coupon", code))
    }

    async fn create_coupon(&self, mut coupon: Coupon) -> Result<Coupon> {
        let mut t = self.tables.lock();
        if t
            .coupons
            .values()
            .any(|c| c.code.eq_ignore_ascii_case(&coupon.code))
        {
            return Err(Error::conflict(format!("coupon {}", coupon.code)));
        }
        coupon.id = t.id();
        t.coupons.insert(coupon.id, coupon.clone());
        Ok(coupon)
    }

    async fn get_product_group(&self, id: i64) -> Result<CouponProductGroup> {
        self.tables
            .lock()
            .product_groups
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("coupon product group", id))
    }

    async fn create_product_group(&self, mut group: CouponProductGroup) -> Result<CouponProductGroup> {
        let mut t = self.tables.lock();
        group.id = t.id();
        t.product_groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn count_redemptions(&self, coupon_id: i64, user_id: Option<i64>) -> Result<i64> {
        Ok(self
            .tables
            .lock()
            .coupon_redemptions
            .iter()
            .filter(|(c, u, _)| *c == coupon_id && user_id.is_none_or(|uid| *u == uid))
            .count() as i64)
    }
}

#[async_trait]
impl RealNameRepository for MemoryStore {
    async fn create_verification(&self, mut v: RealNameVerification) -> Result<RealNameVerification> {
        let mut t = self.tables.lock();
        v.id = t.id();
        t.verifications.insert(v.id, v.clone());
        Ok(v)
    }

    async fn latest_verification(&self, user_id: i64) -> Result<Option<RealNameVerification>> {
        Ok(self
            .tables
            .lock()
            .verifications
            .values()
            .rev()
            .find(|v| v.user_id == user_id)
            .cloned())
    }

    async fn list_pending_verifications(&self, limit: i64) -> Result<Vec<RealNameVerification>> {
        let t = self.tables.lock();
        Ok(take(
            t.verifications
                .values()
                .filter(|v| v.status == VerificationStatus::Pending)
                .cloned(),
            limit,
        ))
    }

    async fn update_verification_status(
        &self,
        id: i64,
        status: VerificationStatus,
        reason: &str,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut t = self.tables.lock();
        let v = t
            .verifications
            .get_mut(&id)
            .ok_or_else(|| missing("verification", id))?;
        v.status = status;
        v.reason = reason.to_string();
        v.verified_at = verified_at;
        Ok(())
    }
}

#[async_trait]
impl PushTokenRepository for MemoryStore {
    async fn list_push_tokens(&self, user_ids: &[i64]) -> Result<Vec<PushToken>> {
        Ok(self
            .tables
            .lock()
            .push_tokens
            .values()
            .filter(|p| user_ids.contains(&p.user_id))
            .cloned()
            .collect())
    }

    async fn upsert_push_token(&self, mut token: PushToken) -> Result<()> {
        let mut t = self.tables.lock();
        let existing = t
            .push_tokens
            .values()
            .find(|p| p.token == token.token)
            .map(|p| p.id);
        token.id = match existing {
            Some(id) => id,
            None => t.id(),
        };
        token.updated_at = Utc::now();
        t.push_tokens.insert(token.id, token);
        Ok(())
    }
}

#[async_trait]
impl ScheduledTaskRunRepository for MemoryStore {
    async fn create_task_run(
        &self,
        task_key: &str,
        started_at: DateTime<Utc>,
    ) -> Result<ScheduledTaskRun> {
        let mut t = self.tables.lock();
        let run = ScheduledTaskRun {
            id: t.id(),
            task_key: task_key.to_string(),
            started_at,
            finished_at: None,
            status: TaskRunStatus::Running,
            message: String::new(),
            duration_sec: 0.0,
        };
        t.task_runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn finish_task_run(
        &self,
        id: i64,
        status: TaskRunStatus,
        message: &str,
        finished_at: DateTime<Utc>,
        duration_sec: f64,
    ) -> Result<()> {
        let mut t = self.tables.lock();
        let run = t
            .task_runs
            .get_mut(&id)
            .ok_or_else(|| missing("task run", id))?;
        run.status = status;
        run.message = message.to_string();
        run.finished_at = Some(finished_at);
        run.duration_sec = duration_sec;
        Ok(())
    }

    async fn list_task_runs(&self, task_key: &str, limit: i64) -> Result<Vec<ScheduledTaskRun>> {
        let t = self.tables.lock();
        Ok(take(
            t.task_runs
                .values()
                .rev()
                .filter(|r| r.task_key == task_key)
                .cloned(),
            limit,
        ))
    }
}

#[async_trait]
impl PasswordResetTokenRepository for MemoryStore {
    async fn create_reset_token(&self, mut token: PasswordResetToken) -> Result<PasswordResetToken> {
        let mut t = self.tables.lock();
        token.id = t.id();
        t.reset_tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn get_reset_token(&self, token: &str) -> Result<PasswordResetToken> {
        self.tables
            .lock()
            .reset_tokens
            .values()
            .find(|r| r.token == token)
            .cloned()
            .ok_or_else(|| Error::not_found("reset token"))
    }

    async fn mark_reset_token_used(&self, id: i64) -> Result<bool> {
        let mut t = self.tables.lock();
        let row = t
            .reset_tokens
            .get_mut(&id)
            .ok_or_else(|| missing("reset token", id))?;
        if row.used {
            return Ok(false);
        }
        row.used = true;
        Ok(true)
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn create_notification(&self, mut n: Notification) -> Result<Notification> {
        let mut t = self.tables.lock();
        n.id = t.id();
        t.notifications.push(n.clone());
        Ok(n)
    }

    async fn list_notifications(&self, user_id: i64, limit: i64) -> Result<Vec<Notification>> {
        let t = self.tables.lock();
        Ok(take(
            t.notifications
                .iter()
                .rev()
                .filter(|n| n.user_id == user_id)
                .cloned(),
            limit,
        ))
    }
}

#[async_trait]
impl AuditLogRepository for MemoryStore {
    async fn add_audit_log(&self, mut log: AuditLog) -> Result<()> {
        let mut t = self.tables.lock();
        log.id = t.id();
        t.audit_logs.push(log);
        Ok(())
    }
}

#[async_trait]
impl RetentionRepository for MemoryStore {
    async fn purge_before(&self, target: RetentionTarget, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock();
        let removed = match target {
            RetentionTarget::AutomationLogs => {
                let before = t.automation_logs.len();
                t.automation_logs.retain(|l| l.created_at >= cutoff);
                before - t.automation_logs.len()
            }
            RetentionTarget::AuditLogs => {
                let before = t.audit_logs.len();
                t.audit_logs.retain(|l| l.created_at >= cutoff);
                before - t.audit_logs.len()
            }
            RetentionTarget::TaskRuns => {
                let before = t.task_runs.len();
                t.task_runs.retain(|_, r| r.started_at >= cutoff);
                before - t.task_runs.len()
            }
            other => {
                let rows = t.other_logs.entry(other).or_default();
                let before = rows.len();
                rows.retain(|at| *at >= cutoff);
                before - rows.len()
            }
        };
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_seq_starts_at_one_per_order() {
        let store = MemoryStore::new();
        let a1 = store.append_event(1, "order.created", "{}").await.unwrap();
        let b1 = store.append_event(2, "order.created", "{}").await.unwrap();
        let a2 = store.append_event(1, "order.paid", "{}").await.unwrap();
        assert_eq!((a1.seq, b1.seq, a2.seq), (1, 1, 2));
        let after = store.list_events_after(1, 1, 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].event_type, "order.paid");
    }

    #[tokio::test]
    async fn test_wallet_never_goes_negative_and_refs_are_unique() {
        let store = MemoryStore::new();
        let credit = WalletAdjustment {
            user_id: 1,
            amount: 100,
            tx_type: "credit".into(),
            ref_type: "topup".into(),
            ref_id: 1,
            note: String::new(),
        };
        store.adjust_wallet_balance(credit.clone()).await.unwrap();
        assert!(matches!(
            store.adjust_wallet_balance(credit).await,
            Err(Error::Conflict(_))
        ));
        let debit = WalletAdjustment {
            user_id: 1,
            amount: -150,
            tx_type: "debit".into(),
            ref_type: "order".into(),
            ref_id: 9,
            note: String::new(),
        };
        assert!(matches!(
            store.adjust_wallet_balance(debit).await,
            Err(Error::InsufficientBalance)
        ));
        assert_eq!(store.get_wallet(1).await.unwrap().balance, 100);
        assert!(!store.has_wallet_transaction("order", 9).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_order_cascades() {
        let store = MemoryStore::new();
        let order = Order::new(1, "N1".into(), "cart", "CNY");
        let item = OrderItem::new(ItemAction::Create, 1, 1, 100);
        let (order, _) = store
            .create_order_with_items(order, vec![item], CreateOrderOptions::default())
            .await
            .unwrap();
        store.append_event(order.id, "order.created", "{}").await.unwrap();
        store.delete_order(order.id).await.unwrap();
        assert!(store.list_order_items(order.id).await.unwrap().is_empty());
        assert!(store.list_events_after(order.id, 0, 10).await.unwrap().is_empty());
        assert!(matches!(
            store.get_order(order.id).await,
            Err(Error::NotFound(_))
        ));
    }
}
