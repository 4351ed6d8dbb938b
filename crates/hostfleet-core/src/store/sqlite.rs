// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite backend.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;

use super::*;
use crate::error::Error;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed implementation of every repository family.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Connect to a database URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn missing(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{kind} {id}"))
}

/// Non-positive limits mean "no limit".
fn lim(limit: i64) -> i64 {
    if limit <= 0 { -1 } else { limit }
}

#[async_trait]
impl UserRepository for SqliteStore {
    async fn get_user(&self, id: i64) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("user", id))
    }

    async fn create_user(&self, mut user: User) -> Result<User> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (username, email, phone, role, status, tier_group_id,
                tier_expires_at, totp_secret_enc, totp_enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.role)
        .bind(user.status)
        .bind(user.tier_group_id)
        .bind(user.tier_expires_at)
        .bind(&user.totp_secret_enc)
        .bind(user.totp_enabled)
        .bind(user.created_at)
        .bind(user.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "username"))?;
        user.id = id;
        Ok(user)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE users SET email = ?, phone = ?, role = ?, status = ?, tier_group_id = ?,
                tier_expires_at = ?, totp_secret_enc = ?, totp_enabled = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.role)
        .bind(user.status)
        .bind(user.tier_group_id)
        .bind(user.tier_expires_at)
        .bind(&user.totp_secret_enc)
        .bind(user.totp_enabled)
        .bind(Utc::now())
        .bind(user.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("user", user.id));
        }
        Ok(())
    }

    async fn list_active_admins(&self) -> Result<Vec<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE role = 'admin' AND status = 'active' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl CatalogRepository for SqliteStore {
    async fn get_goods_type(&self, id: i64) -> Result<GoodsType> {
        sqlx::query_as::<_, GoodsType>("SELECT * FROM goods_types WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("goods type", id))
    }

    async fn list_goods_types(&self) -> Result<Vec<GoodsType>> {
        Ok(
            sqlx::query_as::<_, GoodsType>("SELECT * FROM goods_types ORDER BY sort_order, id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn create_goods_type(&self, mut g: GoodsType) -> Result<GoodsType> {
        g.id = sqlx::query_scalar(
            r#"
            INSERT INTO goods_types (code, name, active, sort_order, automation_category,
                automation_plugin_id, automation_instance_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&g.code)
        .bind(&g.name)
        .bind(g.active)
        .bind(g.sort_order)
        .bind(&g.automation_category)
        .bind(&g.automation_plugin_id)
        .bind(&g.automation_instance_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(g)
    }

    async fn get_plan_group(&self, id: i64) -> Result<PlanGroup> {
        sqlx::query_as::<_, PlanGroup>("SELECT * FROM plan_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("plan group", id))
    }

    async fn list_plan_groups(&self) -> Result<Vec<PlanGroup>> {
        Ok(sqlx::query_as::<_, PlanGroup>("SELECT * FROM plan_groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn create_plan_group(&self, mut p: PlanGroup) -> Result<PlanGroup> {
        p.id = sqlx::query_scalar(
            r#"
            INSERT INTO plan_groups (goods_type_id, region_id, name, line_id,
                unit_core, unit_mem, unit_disk, unit_bw,
                add_core_min, add_core_max, add_core_step,
                add_mem_min, add_mem_max, add_mem_step,
                add_disk_min, add_disk_max, add_disk_step,
                add_bw_min, add_bw_max, add_bw_step, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(p.goods_type_id)
        .bind(p.region_id)
        .bind(&p.name)
        .bind(p.line_id)
        .bind(p.unit_core)
        .bind(p.unit_mem)
        .bind(p.unit_disk)
        .bind(p.unit_bw)
        .bind(p.add_core_min)
        .bind(p.add_core_max)
        .bind(p.add_core_step)
        .bind(p.add_mem_min)
        .bind(p.add_mem_max)
        .bind(p.add_mem_step)
        .bind(p.add_disk_min)
        .bind(p.add_disk_max)
        .bind(p.add_disk_step)
        .bind(p.add_bw_min)
        .bind(p.add_bw_max)
        .bind(p.add_bw_step)
        .bind(p.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(p)
    }

    async fn get_package(&self, id: i64) -> Result<Package> {
        sqlx::query_as::<_, Package>("SELECT * FROM packages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("package", id))
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        Ok(sqlx::query_as::<_, Package>("SELECT * FROM packages ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn create_package(&self, mut p: Package) -> Result<Package> {
        p.id = sqlx::query_scalar(
            r#"
            INSERT INTO packages (plan_group_id, goods_type_id, product_id, name, cores,
                memory_gb, disk_gb, bandwidth_mbps, port_num, monthly_price, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(p.plan_group_id)
        .bind(p.goods_type_id)
        .bind(p.product_id)
        .bind(&p.name)
        .bind(p.cores)
        .bind(p.memory_gb)
        .bind(p.disk_gb)
        .bind(p.bandwidth_mbps)
        .bind(p.port_num)
        .bind(p.monthly_price)
        .bind(p.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(p)
    }

    async fn get_billing_cycle(&self, id: i64) -> Result<BillingCycle> {
        sqlx::query_as::<_, BillingCycle>("SELECT * FROM billing_cycles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("billing cycle", id))
    }

    async fn create_billing_cycle(&self, mut c: BillingCycle) -> Result<BillingCycle> {
        c.id = sqlx::query_scalar(
            r#"
            INSERT INTO billing_cycles (name, months, multiplier, min_qty, max_qty, active)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&c.name)
        .bind(c.months)
        .bind(c.multiplier)
        .bind(c.min_qty)
        .bind(c.max_qty)
        .bind(c.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(c)
    }

    async fn get_system_image(&self, id: i64) -> Result<SystemImage> {
        sqlx::query_as::<_, SystemImage>("SELECT * FROM system_images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("system image", id))
    }

    async fn create_system_image(&self, mut img: SystemImage) -> Result<SystemImage> {
        img.id = sqlx::query_scalar(
            "INSERT INTO system_images (image_id, name, active) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(img.image_id)
        .bind(&img.name)
        .bind(img.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(img)
    }
}

#[async_trait]
impl CartRepository for SqliteStore {
    async fn add_cart_item(&self, mut item: CartItem) -> Result<CartItem> {
        item.id = sqlx::query_scalar(
            r#"
            INSERT INTO cart_items (user_id, package_id, system_id, spec, qty, amount, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(item.user_id)
        .bind(item.package_id)
        .bind(item.system_id)
        .bind(Json(&item.spec))
        .bind(item.qty)
        .bind(item.amount)
        .bind(item.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(item)
    }

    async fn list_cart_items(&self, user_id: i64) -> Result<Vec<CartItem>> {
        Ok(
            sqlx::query_as::<_, CartItem>("SELECT * FROM cart_items WHERE user_id = ? ORDER BY id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn clear_cart(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM cart_items WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for SqliteStore {
    async fn create_order_with_items(
        &self,
        mut order: Order,
        items: Vec<OrderItem>,
        opts: CreateOrderOptions,
    ) -> Result<(Order, Vec<OrderItem>)> {
        let mut tx = self.pool.begin().await?;
        order.id = sqlx::query_scalar(
            r#"
            INSERT INTO orders (user_id, order_no, source, status, total_amount, currency,
                idempotency_key, coupon_id, coupon_code, coupon_discount, pending_reason,
                approved_by, approved_at, rejected_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(order.user_id)
        .bind(&order.order_no)
        .bind(&order.source)
        .bind(order.status)
        .bind(order.total_amount)
        .bind(&order.currency)
        .bind(&order.idempotency_key)
        .bind(order.coupon_id)
        .bind(&order.coupon_code)
        .bind(order.coupon_discount)
        .bind(&order.pending_reason)
        .bind(order.approved_by)
        .bind(order.approved_at)
        .bind(&order.rejected_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "order"))?;

        let mut saved = Vec::with_capacity(items.len());
        for mut item in items {
            item.order_id = order.id;
            item.id = sqlx::query_scalar(
                r#"
                INSERT INTO order_items (order_id, package_id, system_id, goods_type_id, spec_json,
                    qty, amount, status, action, duration_months, automation_instance_id, vps_id,
                    created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(item.order_id)
            .bind(item.package_id)
            .bind(item.system_id)
            .bind(item.goods_type_id)
            .bind(&item.spec_json)
            .bind(item.qty)
            .bind(item.amount)
            .bind(item.status)
            .bind(item.action)
            .bind(item.duration_months)
            .bind(&item.automation_instance_id)
            .bind(item.vps_id)
            .bind(item.created_at)
            .bind(item.updated_at)
            .fetch_one(&mut *tx)
            .await?;
            saved.push(item);
        }

        if let Some(user_id) = opts.clear_cart_of {
            sqlx::query("DELETE FROM cart_items WHERE user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(coupon_id) = opts.coupon_id {
            sqlx::query(
                "INSERT INTO coupon_redemptions (coupon_id, user_id, order_id, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(coupon_id)
            .bind(order.user_id)
            .bind(order.id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok((order, saved))
    }

    async fn get_order(&self, id: i64) -> Result<Order> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("order", id))
    }

    async fn get_order_by_no(&self, order_no: &str) -> Result<Order> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_no = ?")
            .bind(order_no)
            .fetch_optional(&self.pool)
            .await?
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
        Ok(sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE user_id = ? AND idempotency_key = ?",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE orders SET status = ?, total_amount = ?, coupon_id = ?, coupon_code = ?,
                coupon_discount = ?, pending_reason = ?, approved_by = ?, approved_at = ?,
                rejected_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(order.status)
        .bind(order.total_amount)
        .bind(order.coupon_id)
        .bind(&order.coupon_code)
        .bind(order.coupon_discount)
        .bind(&order.pending_reason)
        .bind(order.approved_by)
        .bind(order.approved_at)
        .bind(&order.rejected_reason)
        .bind(Utc::now())
        .bind(order.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("order", order.id));
        }
        Ok(())
    }

    async fn delete_order(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "order_items",
            "payments",
            "order_events",
            "coupon_redemptions",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE order_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let res = sqlx::query("DELETE FROM orders WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(missing("order", id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Order>> {
        let items = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)
            ORDER BY id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(lim(limit))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)",
        )
        .bind(filter.user_id)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;
        Ok(Page { items, total })
    }

    async fn list_stale_orders(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>> {
        Ok(sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE status = ? AND updated_at < ? ORDER BY id LIMIT ?",
        )
        .bind(status)
        .bind(updated_before)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count_user_orders(&self, user_id: i64) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn list_order_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        Ok(sqlx::query_as::<_, OrderItem>(
            "SELECT * FROM order_items WHERE order_id = ? ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_order_item(&self, id: i64) -> Result<OrderItem> {
        sqlx::query_as::<_, OrderItem>("SELECT * FROM order_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("order item", id))
    }

    async fn update_order_item(&self, item: &OrderItem) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE order_items SET spec_json = ?, qty = ?, amount = ?, status = ?,
                duration_months = ?, automation_instance_id = ?, vps_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&item.spec_json)
        .bind(item.qty)
        .bind(item.amount)
        .bind(item.status)
        .bind(item.duration_months)
        .bind(&item.automation_instance_id)
        .bind(item.vps_id)
        .bind(Utc::now())
        .bind(item.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("order item", item.id));
        }
        Ok(())
    }

    async fn list_items_by_status(&self, status: ItemStatus, limit: i64) -> Result<Vec<OrderItem>> {
        Ok(sqlx::query_as::<_, OrderItem>(
            "SELECT * FROM order_items WHERE status = ? ORDER BY id LIMIT ?",
        )
        .bind(status)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn has_open_item_for_vps(&self, vps_id: i64, action: ItemAction) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT oi.id FROM order_items oi
            JOIN orders o ON o.id = oi.order_id
            WHERE oi.vps_id = ? AND oi.action = ?
              AND o.status IN ('pending_review', 'pending_payment')
            LIMIT 1
            "#,
        )
        .bind(vps_id)
        .bind(action)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl PaymentRepository for SqliteStore {
    async fn create_payment(&self, mut p: Payment) -> Result<Payment> {
        p.id = sqlx::query_scalar(
            r#"
            INSERT INTO payments (order_id, user_id, method, amount, currency, trade_no, status,
                idempotency_key, raw_notify_json, reviewed_by, reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(p.order_id)
        .bind(p.user_id)
        .bind(&p.method)
        .bind(p.amount)
        .bind(&p.currency)
        .bind(&p.trade_no)
        .bind(p.status)
        .bind(&p.idempotency_key)
        .bind(&p.raw_notify_json)
        .bind(p.reviewed_by)
        .bind(&p.reason)
        .bind(p.created_at)
        .bind(p.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "payment"))?;
        Ok(p)
    }

    async fn get_payment_by_trade_no(
        &self,
        method: &str,
        trade_no: &str,
    ) -> Result<Option<Payment>> {
        Ok(sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE method = ? AND trade_no = ?",
        )
        .bind(method)
        .bind(trade_no)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_payments_by_order(&self, order_id: i64) -> Result<Vec<Payment>> {
        Ok(
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE order_id = ? ORDER BY id")
                .bind(order_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn update_payment(&self, p: &Payment) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE payments SET trade_no = ?, status = ?, raw_notify_json = ?, reviewed_by = ?,
                reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&p.trade_no)
        .bind(p.status)
        .bind(&p.raw_notify_json)
        .bind(p.reviewed_by)
        .bind(&p.reason)
        .bind(Utc::now())
        .bind(p.id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "payment"))?;
        if res.rows_affected() == 0 {
            return Err(missing("payment", p.id));
        }
        Ok(())
    }
}

#[async_trait]
impl EventRepository for SqliteStore {
    async fn append_event(
        &self,
        order_id: i64,
        event_type: &str,
        data_json: &str,
    ) -> Result<OrderEvent> {
        // Single statement, so seq assignment and insert are atomic.
        Ok(sqlx::query_as::<_, OrderEvent>(
            r#"
            INSERT INTO order_events (order_id, seq, event_type, data_json, created_at)
            SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4
            FROM order_events WHERE order_id = ?1
            RETURNING id, order_id, seq, event_type, data_json, created_at
            "#,
        )
        .bind(order_id)
        .bind(event_type)
        .bind(data_json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn list_events_after(
        &self,
        order_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<OrderEvent>> {
        Ok(sqlx::query_as::<_, OrderEvent>(
            "SELECT * FROM order_events WHERE order_id = ? AND seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(order_id)
        .bind(after_seq)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl VpsRepository for SqliteStore {
    async fn create_instance(&self, mut v: VpsInstance) -> Result<VpsInstance> {
        v.id = sqlx::query_scalar(
            r#"
            INSERT INTO vps_instances (user_id, order_item_id, automation_instance_id,
                goods_type_id, package_id, package_name, name, region, line_id, system_id,
                cpu, memory_gb, disk_gb, bandwidth_mbps, port_num, monthly_price, spec_json,
                status, automation_state, admin_status, expire_at, last_emergency_renew_at,
                access_info_json, panel_url_cache, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(v.user_id)
        .bind(v.order_item_id)
        .bind(&v.automation_instance_id)
        .bind(v.goods_type_id)
        .bind(v.package_id)
        .bind(&v.package_name)
        .bind(&v.name)
        .bind(&v.region)
        .bind(v.line_id)
        .bind(v.system_id)
        .bind(v.cpu)
        .bind(v.memory_gb)
        .bind(v.disk_gb)
        .bind(v.bandwidth_mbps)
        .bind(v.port_num)
        .bind(v.monthly_price)
        .bind(&v.spec_json)
        .bind(v.status)
        .bind(v.automation_state)
        .bind(v.admin_status)
        .bind(v.expire_at)
        .bind(v.last_emergency_renew_at)
        .bind(&v.access_info_json)
        .bind(&v.panel_url_cache)
        .bind(v.created_at)
        .bind(v.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(v)
    }

    async fn get_instance(&self, id: i64) -> Result<VpsInstance> {
        sqlx::query_as::<_, VpsInstance>("SELECT * FROM vps_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("vps", id))
    }

    async fn get_instance_by_order_item(&self, order_item_id: i64) -> Result<Option<VpsInstance>> {
        Ok(sqlx::query_as::<_, VpsInstance>(
            "SELECT * FROM vps_instances WHERE order_item_id = ? ORDER BY id LIMIT 1",
        )
        .bind(order_item_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_instances(&self, limit: i64, offset: i64) -> Result<Page<VpsInstance>> {
        let items = sqlx::query_as::<_, VpsInstance>(
            "SELECT * FROM vps_instances ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(lim(limit))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vps_instances")
            .fetch_one(&self.pool)
            .await?;
        Ok(Page { items, total })
    }

    async fn list_expiring(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<VpsInstance>> {
        Ok(sqlx::query_as::<_, VpsInstance>(
            r#"
            SELECT * FROM vps_instances
            WHERE expire_at IS NOT NULL AND expire_at < ?
            ORDER BY expire_at, id
            LIMIT ?
            "#,
        )
        .bind(before)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_instance(&self, v: &VpsInstance) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE vps_instances SET automation_instance_id = ?, package_id = ?, package_name = ?,
                name = ?, region = ?, system_id = ?, cpu = ?, memory_gb = ?, disk_gb = ?,
                bandwidth_mbps = ?, port_num = ?, monthly_price = ?, spec_json = ?, status = ?,
                automation_state = ?, admin_status = ?, expire_at = ?,
                last_emergency_renew_at = ?, access_info_json = ?, panel_url_cache = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&v.automation_instance_id)
        .bind(v.package_id)
        .bind(&v.package_name)
        .bind(&v.name)
        .bind(&v.region)
        .bind(v.system_id)
        .bind(v.cpu)
        .bind(v.memory_gb)
        .bind(v.disk_gb)
        .bind(v.bandwidth_mbps)
        .bind(v.port_num)
        .bind(v.monthly_price)
        .bind(&v.spec_json)
        .bind(v.status)
        .bind(v.automation_state)
        .bind(v.admin_status)
        .bind(v.expire_at)
        .bind(v.last_emergency_renew_at)
        .bind(&v.access_info_json)
        .bind(&v.panel_url_cache)
        .bind(Utc::now())
        .bind(v.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("vps", v.id));
        }
        Ok(())
    }

    async fn delete_instance(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM vps_instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(missing("vps", id));
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationLogRepository for SqliteStore {
    async fn add_automation_log(&self, log: AutomationLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_logs (order_id, order_item_id, action, request_json,
                response_json, success, message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.order_id)
        .bind(log.order_item_id)
        .bind(&log.action)
        .bind(&log.request_json)
        .bind(&log.response_json)
        .bind(log.success)
        .bind(&log.message)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProvisionJobRepository for SqliteStore {
    async fn create_provision_job(&self, mut job: ProvisionJob) -> Result<ProvisionJob> {
        job.id = sqlx::query_scalar(
            r#"
            INSERT INTO provision_jobs (order_id, order_item_id, host_id, host_name, status,
                attempts, next_run_at, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job.order_id)
        .bind(job.order_item_id)
        .bind(job.host_id)
        .bind(&job.host_name)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.next_run_at)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "provision job"))?;
        Ok(job)
    }

    async fn get_provision_job_by_item(&self, order_item_id: i64) -> Result<Option<ProvisionJob>> {
        Ok(sqlx::query_as::<_, ProvisionJob>(
            "SELECT * FROM provision_jobs WHERE order_item_id = ?",
        )
        .bind(order_item_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_due_provision_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProvisionJob>> {
        Ok(sqlx::query_as::<_, ProvisionJob>(
            r#"
            SELECT * FROM provision_jobs
            WHERE status = 'pending' AND next_run_at <= ?
            ORDER BY next_run_at, id
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_provision_job(&self, job: &ProvisionJob) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE provision_jobs SET host_id = ?, host_name = ?, status = ?, attempts = ?,
                next_run_at = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.host_id)
        .bind(&job.host_name)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.next_run_at)
        .bind(&job.last_error)
        .bind(Utc::now())
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("provision job", job.id));
        }
        Ok(())
    }
}

#[async_trait]
impl ResizeTaskRepository for SqliteStore {
    async fn create_resize_task(&self, mut task: ResizeTask) -> Result<ResizeTask> {
        task.id = sqlx::query_scalar(
            r#"
            INSERT INTO resize_tasks (vps_id, order_id, order_item_id, status, attempts,
                next_run_at, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(task.vps_id)
        .bind(task.order_id)
        .bind(task.order_item_id)
        .bind(task.status)
        .bind(task.attempts)
        .bind(task.next_run_at)
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "resize task"))?;
        Ok(task)
    }

    async fn has_pending_resize_task(&self, vps_id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM resize_tasks WHERE vps_id = ? AND status IN ('pending', 'running') LIMIT 1",
        )
        .bind(vps_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn list_due_resize_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ResizeTask>> {
        Ok(sqlx::query_as::<_, ResizeTask>(
            r#"
            SELECT * FROM resize_tasks
            WHERE status = 'pending' AND next_run_at <= ?
            ORDER BY next_run_at, id
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_resize_task(&self, task: &ResizeTask) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE resize_tasks SET status = ?, attempts = ?, next_run_at = ?, last_error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status)
        .bind(task.attempts)
        .bind(task.next_run_at)
        .bind(&task.last_error)
        .bind(Utc::now())
        .bind(task.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("resize task", task.id));
        }
        Ok(())
    }
}

#[async_trait]
impl PluginInstallationRepository for SqliteStore {
    async fn upsert_installation(&self, inst: &PluginInstallation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_installations (category, plugin_id, instance_id, name, version,
                enabled, loaded, manifest_json, config_encrypted, signature_status,
                health_status, health_message, last_health_at, installed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (category, plugin_id, instance_id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                enabled = excluded.enabled,
                loaded = excluded.loaded,
                manifest_json = excluded.manifest_json,
                config_encrypted = excluded.config_encrypted,
                signature_status = excluded.signature_status,
                health_status = excluded.health_status,
                health_message = excluded.health_message,
                last_health_at = excluded.last_health_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(inst.category)
        .bind(&inst.plugin_id)
        .bind(&inst.instance_id)
        .bind(&inst.name)
        .bind(&inst.version)
        .bind(inst.enabled)
        .bind(inst.loaded)
        .bind(&inst.manifest_json)
        .bind(&inst.config_encrypted)
        .bind(inst.signature_status)
        .bind(inst.health_status)
        .bind(&inst.health_message)
        .bind(inst.last_health_at)
        .bind(inst.installed_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_installation(&self, key: &InstanceKey) -> Result<PluginInstallation> {
        sqlx::query_as::<_, PluginInstallation>(
            "SELECT * FROM plugin_installations WHERE category = ? AND plugin_id = ? AND instance_id = ?",
        )
        .bind(key.category)
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| missing("plugin instance", key))
    }

    async fn list_installations(&self) -> Result<Vec<PluginInstallation>> {
        Ok(sqlx::query_as::<_, PluginInstallation>(
            "SELECT * FROM plugin_installations ORDER BY category, plugin_id, instance_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_plugin_instances(
        &self,
        category: PluginCategory,
        plugin_id: &str,
    ) -> Result<Vec<PluginInstallation>> {
        Ok(sqlx::query_as::<_, PluginInstallation>(
            "SELECT * FROM plugin_installations WHERE category = ? AND plugin_id = ? ORDER BY instance_id",
        )
        .bind(category)
        .bind(plugin_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_installation(&self, key: &InstanceKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            "DELETE FROM plugin_installations WHERE category = ? AND plugin_id = ? AND instance_id = ?",
        )
        .bind(key.category)
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("plugin instance", key));
        }
        sqlx::query(
            "DELETE FROM plugin_payment_methods WHERE category = ? AND plugin_id = ? AND instance_id = ?",
        )
        .bind(key.category)
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PluginPaymentMethodRepository for SqliteStore {
    async fn list_payment_method_overrides(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<PaymentMethodOverride>> {
        Ok(sqlx::query_as::<_, PaymentMethodOverride>(
            r#"
            SELECT * FROM plugin_payment_methods
            WHERE category = ? AND plugin_id = ? AND instance_id = ?
            ORDER BY method
            "#,
        )
        .bind(key.category)
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_payment_method_override(&self, ov: &PaymentMethodOverride) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_payment_methods (category, plugin_id, instance_id, method, enabled)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (category, plugin_id, instance_id, method)
            DO UPDATE SET enabled = excluded.enabled
            "#,
        )
        .bind(ov.category)
        .bind(&ov.plugin_id)
        .bind(&ov.instance_id)
        .bind(&ov.method)
        .bind(ov.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsRepository for SqliteStore {
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        Ok(
            sqlx::query_as::<_, Setting>("SELECT * FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_settings(&self) -> Result<Vec<Setting>> {
        Ok(sqlx::query_as::<_, Setting>("SELECT * FROM settings ORDER BY key")
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl TierRepository for SqliteStore {
    async fn list_groups(&self) -> Result<Vec<TierGroup>> {
        Ok(sqlx::query_as::<_, TierGroup>("SELECT * FROM tier_groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn get_group(&self, id: i64) -> Result<TierGroup> {
        sqlx::query_as::<_, TierGroup>("SELECT * FROM tier_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("tier group", id))
    }

    async fn create_group(&self, mut g: TierGroup) -> Result<TierGroup> {
        g.id = sqlx::query_scalar(
            r#"
            INSERT INTO tier_groups (name, color, icon, priority, auto_approve_enabled,
                is_default, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&g.name)
        .bind(&g.color)
        .bind(&g.icon)
        .bind(g.priority)
        .bind(g.auto_approve_enabled)
        .bind(g.is_default)
        .bind(g.created_at)
        .bind(g.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(g)
    }

    async fn update_group(&self, g: &TierGroup) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE tier_groups SET name = ?, color = ?, icon = ?, priority = ?,
                auto_approve_enabled = ?, is_default = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&g.name)
        .bind(&g.color)
        .bind(&g.icon)
        .bind(g.priority)
        .bind(g.auto_approve_enabled)
        .bind(g.is_default)
        .bind(Utc::now())
        .bind(g.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("tier group", g.id));
        }
        Ok(())
    }

    async fn delete_group(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["tier_discount_rules", "tier_auto_rules", "tier_price_cache"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE group_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let res = sqlx::query("DELETE FROM tier_groups WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(missing("tier group", id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_discount_rules(&self, group_id: i64) -> Result<Vec<TierDiscountRule>> {
        Ok(sqlx::query_as::<_, TierDiscountRule>(
            "SELECT * FROM tier_discount_rules WHERE group_id = ? ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_discount_rule(&self, mut r: TierDiscountRule) -> Result<TierDiscountRule> {
        r.id = sqlx::query_scalar(
            r#"
            INSERT INTO tier_discount_rules (group_id, scope, goods_type_id, region_id,
                plan_group_id, package_id, discount_permille, fixed_price, add_core_permille,
                add_mem_permille, add_disk_permille, add_bw_permille, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(r.group_id)
        .bind(r.scope)
        .bind(r.goods_type_id)
        .bind(r.region_id)
        .bind(r.plan_group_id)
        .bind(r.package_id)
        .bind(r.discount_permille)
        .bind(r.fixed_price)
        .bind(r.add_core_permille)
        .bind(r.add_mem_permille)
        .bind(r.add_disk_permille)
        .bind(r.add_bw_permille)
        .bind(r.created_at)
        .bind(r.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(r)
    }

    async fn update_discount_rule(&self, r: &TierDiscountRule) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE tier_discount_rules SET scope = ?, goods_type_id = ?, region_id = ?,
                plan_group_id = ?, package_id = ?, discount_permille = ?, fixed_price = ?,
                add_core_permille = ?, add_mem_permille = ?, add_disk_permille = ?,
                add_bw_permille = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(r.scope)
        .bind(r.goods_type_id)
        .bind(r.region_id)
        .bind(r.plan_group_id)
        .bind(r.package_id)
        .bind(r.discount_permille)
        .bind(r.fixed_price)
        .bind(r.add_core_permille)
        .bind(r.add_mem_permille)
        .bind(r.add_disk_permille)
        .bind(r.add_bw_permille)
        .bind(Utc::now())
        .bind(r.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("discount rule", r.id));
        }
        Ok(())
    }

    async fn delete_discount_rule(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM tier_discount_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(missing("discount rule", id));
        }
        Ok(())
    }

    async fn list_auto_rules(&self, group_id: i64) -> Result<Vec<TierAutoRule>> {
        Ok(sqlx::query_as::<_, TierAutoRule>(
            "SELECT * FROM tier_auto_rules WHERE group_id = ? ORDER BY sort_order, id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_auto_rule(&self, mut r: TierAutoRule) -> Result<TierAutoRule> {
        r.id = sqlx::query_scalar(
            r#"
            INSERT INTO tier_auto_rules (group_id, duration_days, conditions_json, sort_order,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(r.group_id)
        .bind(r.duration_days)
        .bind(&r.conditions_json)
        .bind(r.sort_order)
        .bind(r.created_at)
        .bind(r.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(r)
    }

    async fn delete_auto_rule(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM tier_auto_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(missing("auto rule", id));
        }
        Ok(())
    }

    async fn get_membership(&self, user_id: i64) -> Result<Option<TierMembership>> {
        Ok(sqlx::query_as::<_, TierMembership>(
            "SELECT * FROM tier_memberships WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn upsert_membership(&self, m: &TierMembership) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tier_memberships (user_id, group_id, source, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                group_id = excluded.group_id,
                source = excluded.source,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(m.user_id)
        .bind(m.group_id)
        .bind(m.source)
        .bind(m.expires_at)
        .bind(m.created_at)
        .bind(m.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_expired_memberships(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TierMembership>> {
        Ok(sqlx::query_as::<_, TierMembership>(
            r#"
            SELECT * FROM tier_memberships
            WHERE expires_at IS NOT NULL AND expires_at <= ?
            ORDER BY user_id
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_price_cache(
        &self,
        group_id: i64,
        package_id: i64,
    ) -> Result<Option<TierPriceCache>> {
        Ok(sqlx::query_as::<_, TierPriceCache>(
            "SELECT * FROM tier_price_cache WHERE group_id = ? AND package_id = ?",
        )
        .bind(group_id)
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_price_cache(&self, group_id: i64) -> Result<Vec<TierPriceCache>> {
        Ok(sqlx::query_as::<_, TierPriceCache>(
            "SELECT * FROM tier_price_cache WHERE group_id = ? ORDER BY package_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn replace_price_cache(&self, group_id: i64, rows: Vec<TierPriceCache>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tier_price_cache WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO tier_price_cache (group_id, package_id, monthly_price, unit_core,
                    unit_mem, unit_disk, unit_bw, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(group_id)
            .bind(row.package_id)
            .bind(row.monthly_price)
            .bind(row.unit_core)
            .bind(row.unit_mem)
            .bind(row.unit_disk)
            .bind(row.unit_bw)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl WalletRepository for SqliteStore {
    async fn get_wallet(&self, user_id: i64) -> Result<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(wallet.unwrap_or(Wallet {
            user_id,
            balance: 0,
            updated_at: Utc::now(),
        }))
    }

    async fn adjust_wallet_balance(&self, adj: WalletAdjustment) -> Result<Wallet> {
        let mut tx = self.pool.begin().await?;
        let current: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = ?")
                .bind(adj.user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let next = current
            .unwrap_or(0)
            .checked_add(adj.amount)
            .ok_or_else(|| Error::invalid("wallet amount overflow"))?;
        if next < 0 {
            return Err(Error::InsufficientBalance);
        }
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO wallet_transactions (user_id, amount, tx_type, ref_type, ref_id, note, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(adj.user_id)
        .bind(adj.amount)
        .bind(&adj.tx_type)
        .bind(&adj.ref_type)
        .bind(adj.ref_id)
        .bind(&adj.note)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "wallet transaction"))?;
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            INSERT INTO wallets (user_id, balance, updated_at) VALUES (?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at
            RETURNING user_id, balance, updated_at
            "#,
        )
        .bind(adj.user_id)
        .bind(next)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(wallet)
    }

    async fn has_wallet_transaction(&self, ref_type: &str, ref_id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM wallet_transactions WHERE ref_type = ? AND ref_id = ? LIMIT 1",
        )
        .bind(ref_type)
        .bind(ref_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn list_wallet_transactions(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<WalletTransaction>> {
        Ok(sqlx::query_as::<_, WalletTransaction>(
            "SELECT * FROM wallet_transactions WHERE user_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl CouponRepository for SqliteStore {
    async fn get_coupon_by_code(&self, code: &str) -> Result<Coupon> {
        sqlx::query_as::<_, Coupon>("SELECT * FROM coupons WHERE code = ? COLLATE NOCASE")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("coupon", code))
    }

    async fn create_coupon(&self, mut c: Coupon) -> Result<Coupon> {
        c.id = sqlx::query_scalar(
            r#"
            INSERT INTO coupons (code, discount_type, fixed_amount, discount_permille,
                product_group_id, min_order_amount, total_limit, per_user_limit, starts_at,
                ends_at, new_user_only, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&c.code)
        .bind(c.discount_type)
        .bind(c.fixed_amount)
        .bind(c.discount_permille)
        .bind(c.product_group_id)
        .bind(c.min_order_amount)
        .bind(c.total_limit)
        .bind(c.per_user_limit)
        .bind(c.starts_at)
        .bind(c.ends_at)
        .bind(c.new_user_only)
        .bind(c.active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "coupon"))?;
        Ok(c)
    }

    async fn get_product_group(&self, id: i64) -> Result<CouponProductGroup> {
        sqlx::query_as::<_, CouponProductGroup>("SELECT * FROM coupon_product_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("coupon product group", id))
    }

    async fn create_product_group(&self, mut g: CouponProductGroup) -> Result<CouponProductGroup> {
        g.id = sqlx::query_scalar(
            "INSERT INTO coupon_product_groups (name, rules) VALUES (?, ?) RETURNING id",
        )
        .bind(&g.name)
        .bind(Json(&g.rules))
        .fetch_one(&self.pool)
        .await?;
        Ok(g)
    }

    async fn count_redemptions(&self, coupon_id: i64, user_id: Option<i64>) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM coupon_redemptions WHERE coupon_id = ?1 AND (?2 IS NULL OR user_id = ?2)",
        )
        .bind(coupon_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?)
    }
}

#[async_trait]
impl RealNameRepository for SqliteStore {
    async fn create_verification(&self, mut v: RealNameVerification) -> Result<RealNameVerification> {
        v.id = sqlx::query_scalar(
            r#"
            INSERT INTO realname_verifications (user_id, provider, real_name, id_number, status,
                reason, created_at, verified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(v.user_id)
        .bind(&v.provider)
        .bind(&v.real_name)
        .bind(&v.id_number)
        .bind(v.status)
        .bind(&v.reason)
        .bind(v.created_at)
        .bind(v.verified_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(v)
    }

    async fn latest_verification(&self, user_id: i64) -> Result<Option<RealNameVerification>> {
        Ok(sqlx::query_as::<_, RealNameVerification>(
            "SELECT * FROM realname_verifications WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_pending_verifications(&self, limit: i64) -> Result<Vec<RealNameVerification>> {
        Ok(sqlx::query_as::<_, RealNameVerification>(
            "SELECT * FROM realname_verifications WHERE status = 'pending' ORDER BY id LIMIT ?",
        )
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_verification_status(
        &self,
        id: i64,
        status: VerificationStatus,
        reason: &str,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let res = sqlx::query(
            "UPDATE realname_verifications SET status = ?, reason = ?, verified_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(reason)
        .bind(verified_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(missing("verification", id));
        }
        Ok(())
    }
}

#[async_trait]
impl PushTokenRepository for SqliteStore {
    async fn list_push_tokens(&self, user_ids: &[i64]) -> Result<Vec<PushToken>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!("SELECT * FROM push_tokens WHERE user_id IN ({placeholders}) ORDER BY id");
        let mut query = sqlx::query_as::<_, PushToken>(&sql);
        for id in user_ids {
            query = query.bind(*id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn upsert_push_token(&self, token: PushToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO push_tokens (user_id, platform, token, device_id, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (token) DO UPDATE SET
                user_id = excluded.user_id,
                platform = excluded.platform,
                device_id = excluded.device_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(token.user_id)
        .bind(&token.platform)
        .bind(&token.token)
        .bind(&token.device_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduledTaskRunRepository for SqliteStore {
    async fn create_task_run(
        &self,
        task_key: &str,
        started_at: DateTime<Utc>,
    ) -> Result<ScheduledTaskRun> {
        Ok(sqlx::query_as::<_, ScheduledTaskRun>(
            r#"
            INSERT INTO scheduled_task_runs (task_key, started_at, status) VALUES (?, ?, 'running')
            RETURNING id, task_key, started_at, finished_at, status, message, duration_sec
            "#,
        )
        .bind(task_key)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn finish_task_run(
        &self,
        id: i64,
        status: TaskRunStatus,
        message: &str,
        finished_at: DateTime<Utc>,
        duration_sec: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_task_runs SET status = ?, message = ?, finished_at = ?, duration_sec = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(message)
        .bind(finished_at)
        .bind(duration_sec)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_task_runs(&self, task_key: &str, limit: i64) -> Result<Vec<ScheduledTaskRun>> {
        Ok(sqlx::query_as::<_, ScheduledTaskRun>(
            "SELECT * FROM scheduled_task_runs WHERE task_key = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(task_key)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl PasswordResetTokenRepository for SqliteStore {
    async fn create_reset_token(&self, mut t: PasswordResetToken) -> Result<PasswordResetToken> {
        t.id = sqlx::query_scalar(
            r#"
            INSERT INTO password_reset_tokens (user_id, token, expires_at, used, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(t.user_id)
        .bind(&t.token)
        .bind(t.expires_at)
        .bind(t.used)
        .bind(t.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_sqlx_unique(e, "reset token"))?;
        Ok(t)
    }

    async fn get_reset_token(&self, token: &str) -> Result<PasswordResetToken> {
        sqlx::query_as::<_, PasswordResetToken>(
            "SELECT * FROM password_reset_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("reset token"))
    }

    async fn mark_reset_token_used(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("UPDATE password_reset_tokens SET used = 1 WHERE id = ? AND used = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl NotificationRepository for SqliteStore {
    async fn create_notification(&self, mut n: Notification) -> Result<Notification> {
        n.id = sqlx::query_scalar(
            r#"
            INSERT INTO notifications (user_id, kind, title, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(n.user_id)
        .bind(&n.kind)
        .bind(&n.title)
        .bind(&n.content)
        .bind(n.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    async fn list_notifications(&self, user_id: i64, limit: i64) -> Result<Vec<Notification>> {
        Ok(sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(lim(limit))
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl AuditLogRepository for SqliteStore {
    async fn add_audit_log(&self, log: AuditLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (actor_id, action, target_type, target_id, detail_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.actor_id)
        .bind(&log.action)
        .bind(&log.target_type)
        .bind(&log.target_id)
        .bind(&log.detail_json)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RetentionRepository for SqliteStore {
    async fn purge_before(&self, target: RetentionTarget, cutoff: DateTime<Utc>) -> Result<u64> {
        let column = match target {
            RetentionTarget::TaskRuns => "started_at",
            _ => "created_at",
        };
        let sql = format!("DELETE FROM {} WHERE {column} < ?", target.as_str());
        let res = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to create in-memory SQLite store")
    }

    #[tokio::test]
    async fn test_append_event_assigns_sequential_seq() {
        let store = test_store().await;
        let (order, _) = store
            .create_order_with_items(
                Order::new(1, "N-1".into(), "cart", "CNY"),
                vec![OrderItem::new(ItemAction::Create, 1, 1, 500)],
                CreateOrderOptions::default(),
            )
            .await
            .unwrap();
        let first = store.append_event(order.id, "order.created", "{}").await.unwrap();
        let second = store.append_event(order.id, "order.pending_review", "{}").await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let replay = store.list_events_after(order.id, 0, 200).await.unwrap();
        assert_eq!(replay.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_is_conflict() {
        let store = test_store().await;
        let mut order = Order::new(7, "N-2".into(), "cart", "CNY");
        order.idempotency_key = "k1".into();
        store
            .create_order_with_items(order.clone(), vec![], CreateOrderOptions::default())
            .await
            .unwrap();
        order.order_no = "N-3".into();
        let err = store
            .create_order_with_items(order, vec![], CreateOrderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(
            store
                .get_order_by_idempotency_key(7, "k1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_wallet_debit_rejected_below_zero() {
        let store = test_store().await;
        let adj = WalletAdjustment {
            user_id: 3,
            amount: 1000,
            tx_type: "credit".into(),
            ref_type: "admin".into(),
            ref_id: 1,
            note: String::new(),
        };
        store.adjust_wallet_balance(adj).await.unwrap();
        let debit = WalletAdjustment {
            user_id: 3,
            amount: -1500,
            tx_type: "debit".into(),
            ref_type: "order".into(),
            ref_id: 2,
            note: String::new(),
        };
        assert!(matches!(
            store.adjust_wallet_balance(debit).await,
            Err(Error::InsufficientBalance)
        ));
        assert_eq!(store.get_wallet(3).await.unwrap().balance, 1000);
    }

    #[tokio::test]
    async fn test_second_open_resize_task_is_conflict() {
        let store = test_store().await;
        let now = Utc::now();
        let task = ResizeTask {
            id: 0,
            vps_id: 9,
            order_id: 1,
            order_item_id: 1,
            status: JobStatus::Pending,
            attempts: 0,
            next_run_at: now,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
        };
        store.create_resize_task(task.clone()).await.unwrap();
        assert!(matches!(
            store.create_resize_task(task).await,
            Err(Error::Conflict(_))
        ));
        assert!(store.has_pending_resize_task(9).await.unwrap());
    }
}
