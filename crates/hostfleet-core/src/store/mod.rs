// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository contracts.
//!
//! Each trait covers one entity family. Services take only the families they
//! use, via [`Store`]. Two backends implement every family:
//!
//! - [`MemoryStore`]: all tables behind one lock, used by tests and embedded runs
//! - [`SqliteStore`]: SQLite through sqlx
//!
//! Shared contract:
//! - point reads fail with [`Error::NotFound`](crate::error::Error::NotFound)
//!   unless the method returns `Option`
//! - composite writes (`create_order_with_items`, `create_resize_task`,
//!   `adjust_wallet_balance`, `append_event`, `replace_price_cache`,
//!   `upsert_installation`) are atomic
//! - listings take `(limit, offset)` and return a [`Page`]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::*;
use crate::error::Result;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<User>;
    async fn create_user(&self, user: User) -> Result<User>;
    async fn update_user(&self, user: &User) -> Result<()>;
    async fn list_active_admins(&self) -> Result<Vec<User>>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_goods_type(&self, id: i64) -> Result<GoodsType>;
    async fn list_goods_types(&self) -> Result<Vec<GoodsType>>;
    async fn create_goods_type(&self, goods_type: GoodsType) -> Result<GoodsType>;
    async fn get_plan_group(&self, id: i64) -> Result<PlanGroup>;
    async fn list_plan_groups(&self) -> Result<Vec<PlanGroup>>;
    async fn create_plan_group(&self, plan_group: PlanGroup) -> Result<PlanGroup>;
    async fn get_package(&self, id: i64) -> Result<Package>;
    async fn list_packages(&self) -> Result<Vec<Package>>;
    async fn create_package(&self, package: Package) -> Result<Package>;
    async fn get_billing_cycle(&self, id: i64) -> Result<BillingCycle>;
    async fn create_billing_cycle(&self, cycle: BillingCycle) -> Result<BillingCycle>;
    async fn get_system_image(&self, id: i64) -> Result<SystemImage>;
    async fn create_system_image(&self, image: SystemImage) -> Result<SystemImage>;
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn add_cart_item(&self, item: CartItem) -> Result<CartItem>;
    async fn list_cart_items(&self, user_id: i64) -> Result<Vec<CartItem>>;
    async fn clear_cart(&self, user_id: i64) -> Result<()>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert the order and its items in one transaction, applying `opts`.
    /// Fails with `Conflict` when `(user_id, idempotency_key)` already exists.
    async fn create_order_with_items(
        &self,
        order: Order,
        items: Vec<OrderItem>,
        opts: CreateOrderOptions,
    ) -> Result<(Order, Vec<OrderItem>)>;
    async fn get_order(&self, id: i64) -> Result<Order>;
    async fn get_order_by_no(&self, order_no: &str) -> Result<Order>;
    async fn get_order_by_idempotency_key(&self, user_id: i64, key: &str)
    -> Result<Option<Order>>;
    async fn update_order(&self, order: &Order) -> Result<()>;
    /// Remove the order together with its items, payments and events.
    async fn delete_order(&self, id: i64) -> Result<()>;
    async fn list_orders(&self, filter: &OrderFilter, limit: i64, offset: i64)
    -> Result<Page<Order>>;
    /// Orders in `status` not updated since `updated_before`.
    async fn list_stale_orders(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>>;
    async fn count_user_orders(&self, user_id: i64) -> Result<i64>;
    async fn list_order_items(&self, order_id: i64) -> Result<Vec<OrderItem>>;
    async fn get_order_item(&self, id: i64) -> Result<OrderItem>;
    async fn update_order_item(&self, item: &OrderItem) -> Result<()>;
    async fn list_items_by_status(&self, status: ItemStatus, limit: i64) -> Result<Vec<OrderItem>>;
    /// Whether an order still awaiting review or payment carries an item with
    /// this action for the VPS.
    async fn has_open_item_for_vps(&self, vps_id: i64, action: ItemAction) -> Result<bool>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Fails with `Conflict` when `(method, trade_no)` is taken.
    async fn create_payment(&self, payment: Payment) -> Result<Payment>;
    async fn get_payment_by_trade_no(&self, method: &str, trade_no: &str)
    -> Result<Option<Payment>>;
    async fn list_payments_by_order(&self, order_id: i64) -> Result<Vec<Payment>>;
    async fn update_payment(&self, payment: &Payment) -> Result<()>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Persist an event with `seq = max(seq) + 1` for the order.
    async fn append_event(&self, order_id: i64, event_type: &str, data_json: &str)
    -> Result<OrderEvent>;
    async fn list_events_after(&self, order_id: i64, after_seq: i64, limit: i64)
    -> Result<Vec<OrderEvent>>;
}

#[async_trait]
pub trait VpsRepository: Send + Sync {
    async fn create_instance(&self, vps: VpsInstance) -> Result<VpsInstance>;
    async fn get_instance(&self, id: i64) -> Result<VpsInstance>;
    async fn get_instance_by_order_item(&self, order_item_id: i64) -> Result<Option<VpsInstance>>;
    async fn list_instances(&self, limit: i64, offset: i64) -> Result<Page<VpsInstance>>;
    /// Instances with an `expire_at` before `before`, oldest first.
    async fn list_expiring(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<VpsInstance>>;
    async fn update_instance(&self, vps: &VpsInstance) -> Result<()>;
    async fn delete_instance(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait AutomationLogRepository: Send + Sync {
    async fn add_automation_log(&self, log: AutomationLog) -> Result<()>;
}

#[async_trait]
pub trait ProvisionJobRepository: Send + Sync {
    async fn create_provision_job(&self, job: ProvisionJob) -> Result<ProvisionJob>;
    async fn get_provision_job_by_item(&self, order_item_id: i64) -> Result<Option<ProvisionJob>>;
    async fn list_due_provision_jobs(&self, now: DateTime<Utc>, limit: i64)
    -> Result<Vec<ProvisionJob>>;
    async fn update_provision_job(&self, job: &ProvisionJob) -> Result<()>;
}

#[async_trait]
pub trait ResizeTaskRepository: Send + Sync {
    /// Fails with `Conflict` while another task of the VPS is pending or running.
    async fn create_resize_task(&self, task: ResizeTask) -> Result<ResizeTask>;
    async fn has_pending_resize_task(&self, vps_id: i64) -> Result<bool>;
    async fn list_due_resize_tasks(&self, now: DateTime<Utc>, limit: i64)
    -> Result<Vec<ResizeTask>>;
    async fn update_resize_task(&self, task: &ResizeTask) -> Result<()>;
}

#[async_trait]
pub trait PluginInstallationRepository: Send + Sync {
    async fn upsert_installation(&self, inst: &PluginInstallation) -> Result<()>;
    async fn get_installation(&self, key: &InstanceKey) -> Result<PluginInstallation>;
    async fn list_installations(&self) -> Result<Vec<PluginInstallation>>;
    async fn list_plugin_instances(
        &self,
        category: PluginCategory,
        plugin_id: &str,
    ) -> Result<Vec<PluginInstallation>>;
    async fn delete_installation(&self, key: &InstanceKey) -> Result<()>;
}

#[async_trait]
pub trait PluginPaymentMethodRepository: Send + Sync {
    async fn list_payment_method_overrides(&self, key: &InstanceKey)
    -> Result<Vec<PaymentMethodOverride>>;
    async fn upsert_payment_method_override(&self, ov: &PaymentMethodOverride) -> Result<()>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>>;
    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()>;
    async fn list_settings(&self) -> Result<Vec<Setting>>;
}

#[async_trait]
pub trait TierRepository: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<TierGroup>>;
    async fn get_group(&self, id: i64) -> Result<TierGroup>;
    async fn create_group(&self, group: TierGroup) -> Result<TierGroup>;
    async fn update_group(&self, group: &TierGroup) -> Result<()>;
    async fn delete_group(&self, id: i64) -> Result<()>;

    async fn list_discount_rules(&self, group_id: i64) -> Result<Vec<TierDiscountRule>>;
    async fn create_discount_rule(&self, rule: TierDiscountRule) -> Result<TierDiscountRule>;
    async fn update_discount_rule(&self, rule: &TierDiscountRule) -> Result<()>;
    async fn delete_discount_rule(&self, id: i64) -> Result<()>;

    async fn list_auto_rules(&self, group_id: i64) -> Result<Vec<TierAutoRule>>;
    async fn create_auto_rule(&self, rule: TierAutoRule) -> Result<TierAutoRule>;
    async fn delete_auto_rule(&self, id: i64) -> Result<()>;

    async fn get_membership(&self, user_id: i64) -> Result<Option<TierMembership>>;
    async fn upsert_membership(&self, membership: &TierMembership) -> Result<()>;
    async fn list_expired_memberships(&self, now: DateTime<Utc>, limit: i64)
    -> Result<Vec<TierMembership>>;

    async fn get_price_cache(&self, group_id: i64, package_id: i64)
    -> Result<Option<TierPriceCache>>;
    async fn list_price_cache(&self, group_id: i64) -> Result<Vec<TierPriceCache>>;
    /// Replace every cache row of the group in one transaction.
    async fn replace_price_cache(&self, group_id: i64, rows: Vec<TierPriceCache>) -> Result<()>;
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Wallet of the user; a user without one has balance 0.
    async fn get_wallet(&self, user_id: i64) -> Result<Wallet>;
    /// Apply a signed change and append the ledger entry atomically.
    /// `InsufficientBalance` if the balance would go negative, `Conflict` if
    /// `(ref_type, ref_id)` was already applied.
    async fn adjust_wallet_balance(&self, adj: WalletAdjustment) -> Result<Wallet>;
    async fn has_wallet_transaction(&self, ref_type: &str, ref_id: i64) -> Result<bool>;
    async fn list_wallet_transactions(&self, user_id: i64, limit: i64)
    -> Result<Vec<WalletTransaction>>;
}

#[async_trait]
pub trait CouponRepository: Send + Sync {
    async fn get_coupon_by_code(&self, code: &str) -> Result<Coupon>;
    async fn create_coupon(&self, coupon: Coupon) -> Result<Coupon>;
    async fn get_product_group(&self, id: i64) -> Result<CouponProductGroup>;
    async fn create_product_group(&self, group: CouponProductGroup) -> Result<CouponProductGroup>;
    /// Redemptions of the coupon, optionally only by one user.
    async fn count_redemptions(&self, coupon_id: i64, user_id: Option<i64>) -> Result<i64>;
}

#[async_trait]
pub trait RealNameRepository: Send + Sync {
    async fn create_verification(&self, v: RealNameVerification) -> Result<RealNameVerification>;
    async fn latest_verification(&self, user_id: i64) -> Result<Option<RealNameVerification>>;
    async fn list_pending_verifications(&self, limit: i64) -> Result<Vec<RealNameVerification>>;
    async fn update_verification_status(
        &self,
        id: i64,
        status: VerificationStatus,
        reason: &str,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

#[async_trait]
pub trait PushTokenRepository: Send + Sync {
    async fn list_push_tokens(&self, user_ids: &[i64]) -> Result<Vec<PushToken>>;
    async fn upsert_push_token(&self, token: PushToken) -> Result<()>;
}

#[async_trait]
pub trait ScheduledTaskRunRepository: Send + Sync {
    async fn create_task_run(&self, task_key: &str, started_at: DateTime<Utc>)
    -> Result<ScheduledTaskRun>;
    async fn finish_task_run(
        &self,
        id: i64,
        status: TaskRunStatus,
        message: &str,
        finished_at: DateTime<Utc>,
        duration_sec: f64,
    ) -> Result<()>;
    async fn list_task_runs(&self, task_key: &str, limit: i64) -> Result<Vec<ScheduledTaskRun>>;
}

#[async_trait]
pub trait PasswordResetTokenRepository: Send + Sync {
    async fn create_reset_token(&self, token: PasswordResetToken) -> Result<PasswordResetToken>;
    async fn get_reset_token(&self, token: &str) -> Result<PasswordResetToken>;
    /// Flip `used`; returns false when it was already used.
    async fn mark_reset_token_used(&self, id: i64) -> Result<bool>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create_notification(&self, n: Notification) -> Result<Notification>;
    async fn list_notifications(&self, user_id: i64, limit: i64) -> Result<Vec<Notification>>;
}

#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn add_audit_log(&self, log: AuditLog) -> Result<()>;
}

#[async_trait]
pub trait RetentionRepository: Send + Sync {
    /// Delete rows of `target` created before `cutoff`; returns rows removed.
    async fn purge_before(&self, target: RetentionTarget, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Every repository family, implemented by one backend.
pub trait Backend:
    UserRepository
    + CatalogRepository
    + CartRepository
    + OrderRepository
    + PaymentRepository
    + EventRepository
    + VpsRepository
    + AutomationLogRepository
    + ProvisionJobRepository
    + ResizeTaskRepository
    + PluginInstallationRepository
    + PluginPaymentMethodRepository
    + SettingsRepository
    + TierRepository
    + WalletRepository
    + CouponRepository
    + RealNameRepository
    + PushTokenRepository
    + ScheduledTaskRunRepository
    + PasswordResetTokenRepository
    + NotificationRepository
    + AuditLogRepository
    + RetentionRepository
    + 'static
{
}

impl<T> Backend for T where
    T: UserRepository
        + CatalogRepository
        + CartRepository
        + OrderRepository
        + PaymentRepository
        + EventRepository
        + VpsRepository
        + AutomationLogRepository
        + ProvisionJobRepository
        + ResizeTaskRepository
        + PluginInstallationRepository
        + PluginPaymentMethodRepository
        + SettingsRepository
        + TierRepository
        + WalletRepository
        + CouponRepository
        + RealNameRepository
        + PushTokenRepository
        + ScheduledTaskRunRepository
        + PasswordResetTokenRepository
        + NotificationRepository
        + AuditLogRepository
        + RetentionRepository
        + 'static
{
}

/// Handles to every repository family.
#[derive(Clone)]
pub struct Store {
    pub users: Arc<dyn UserRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub carts: Arc<dyn CartRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub events: Arc<dyn EventRepository>,
    pub vps: Arc<dyn VpsRepository>,
    pub automation_logs: Arc<dyn AutomationLogRepository>,
    pub provision_jobs: Arc<dyn ProvisionJobRepository>,
    pub resize_tasks: Arc<dyn ResizeTaskRepository>,
    pub plugins: Arc<dyn PluginInstallationRepository>,
    pub payment_methods: Arc<dyn PluginPaymentMethodRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub tiers: Arc<dyn TierRepository>,
    pub wallets: Arc<dyn WalletRepository>,
    pub coupons: Arc<dyn CouponRepository>,
    pub realname: Arc<dyn RealNameRepository>,
    pub push_tokens: Arc<dyn PushTokenRepository>,
    pub task_runs: Arc<dyn ScheduledTaskRunRepository>,
    pub reset_tokens: Arc<dyn PasswordResetTokenRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub audit_logs: Arc<dyn AuditLogRepository>,
    pub retention: Arc<dyn RetentionRepository>,
}

impl Store {
    pub fn new<B: Backend>(backend: Arc<B>) -> Self {
        Self {
            users: backend.clone(),
            catalog: backend.clone(),
            carts: backend.clone(),
            orders: backend.clone(),
            payments: backend.clone(),
            events: backend.clone(),
            vps: backend.clone(),
            automation_logs: backend.clone(),
            provision_jobs: backend.clone(),
            resize_tasks: backend.clone(),
            plugins: backend.clone(),
            payment_methods: backend.clone(),
            settings: backend.clone(),
            tiers: backend.clone(),
            wallets: backend.clone(),
            coupons: backend.clone(),
            realname: backend.clone(),
            push_tokens: backend.clone(),
            task_runs: backend.clone(),
            reset_tokens: backend.clone(),
            notifications: backend.clone(),
            audit_logs: backend.clone(),
            retention: backend,
        }
    }

    /// Fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}
