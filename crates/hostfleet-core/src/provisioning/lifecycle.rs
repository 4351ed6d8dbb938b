// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle actions on existing instances: renew, refund, expiry lock,
//! auto-delete and expiry reminders.

use chrono::{DateTime, Duration, Utc};
use hostfleet_protocol::messages::RefundRequest;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::{
    AdminStatus, ItemStatus, Notification, Order, OrderItem, PaymentStatus, RefundSpec, RenewSpec,
    VpsInstance, VpsStatus,
};
use crate::error::{Error, Result};
use crate::payment::METHOD_BALANCE;
use crate::settings::{SettingsReader, keys};
use crate::wallet::refs;

use super::engine::{CallContext, ProvisioningEngine};

/// Default days before expiry a reminder is sent.
pub const DEFAULT_REMINDER_DAYS: i64 = 3;
/// Default grace days after expiry before an instance is deleted.
pub const DEFAULT_AUTO_DELETE_DAYS: i64 = 7;

/// Emergency renewal settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyRenewPolicy {
    pub enabled: bool,
    /// Days before expiry the renewal becomes available. 0 means any time.
    pub window_days: i64,
    /// Days granted per renewal.
    pub renew_days: i64,
    /// Minimum hours between two renewals of one instance.
    pub interval_hours: i64,
}

impl Default for EmergencyRenewPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            window_days: 7,
            renew_days: 1,
            interval_hours: 720,
        }
    }
}

impl EmergencyRenewPolicy {
    pub async fn load(settings: &SettingsReader) -> Result<Self> {
        let d = Self::default();
        let window_days = settings
            .get_i64(keys::EMERGENCY_RENEW_WINDOW_DAYS, d.window_days)
            .await?;
        let renew_days = settings
            .get_i64(keys::EMERGENCY_RENEW_DAYS, d.renew_days)
            .await?;
        let interval_hours = settings
            .get_i64(keys::EMERGENCY_RENEW_INTERVAL_HOURS, d.interval_hours)
            .await?;
        Ok(Self {
            enabled: settings
                .get_bool(keys::EMERGENCY_RENEW_ENABLED, d.enabled)
                .await?,
            window_days: window_days.max(0),
            renew_days: if renew_days <= 0 { 1 } else { renew_days },
            interval_hours: if interval_hours <= 0 { 24 } else { interval_hours },
        })
    }

    /// Whether `vps` may be renewed in an emergency at `now`.
    pub fn check(&self, vps: &VpsInstance, now: DateTime<Utc>) -> Result<()> {
        if !self.enabled {
            return Err(Error::forbidden("emergency renewal is disabled"));
        }
        let Some(expire_at) = vps.expire_at else {
            return Err(Error::forbidden("instance has no expiry date"));
        };
        if now > expire_at {
            return Err(Error::forbidden("instance already expired"));
        }
        if self.window_days > 0 && now < expire_at - Duration::days(self.window_days) {
            return Err(Error::forbidden(format!(
                "emergency renewal opens {} days before expiry",
                self.window_days
            )));
        }
        if let Some(last) = vps.last_emergency_renew_at {
            if now < last + Duration::hours(self.interval_hours) {
                return Err(Error::conflict("emergency renewal used recently"));
            }
        }
        Ok(())
    }
}

impl ProvisioningEngine {
    /// Extend an instance by `days` and lift an expiry lock.
    pub async fn renew(&self, vps_id: i64, days: i64) -> Result<VpsInstance> {
        self.renew_with_context(vps_id, days, CallContext::default()).await
    }

    async fn renew_with_context(&self, vps_id: i64, days: i64, ctx: CallContext) -> Result<VpsInstance> {
        if days <= 0 {
            return Err(Error::invalid("renew days must be positive"));
        }
        let mut vps = self.store.vps.get_instance(vps_id).await?;
        let host_id = vps
            .host_id()
            .ok_or_else(|| Error::invalid(format!("vps {} has no automation host", vps.id)))?;
        let client = self.client_for(vps.goods_type_id).await?;

        let now = Utc::now();
        let base = vps.expire_at.map_or(now, |at| at.max(now));
        let next = base + Duration::days(days);
        let result = client.renew_host(host_id, next).await;
        self.log_call(ctx, "renew_host", &json!({ "host_id": host_id, "next_due_date": next }), &result)
            .await;
        result?;

        if vps.admin_status != AdminStatus::Normal || vps.status == VpsStatus::ExpiredLocked {
            let unlocked = client.unlock_host(host_id).await;
            self.log_call(ctx, "unlock_host", &json!({ "host_id": host_id }), &unlocked)
                .await;
            if let Err(e) = unlocked {
                warn!(vps_id, error = %e, "Unlock after renewal failed");
            }
            vps.admin_status = AdminStatus::Normal;
            if matches!(vps.status, VpsStatus::ExpiredLocked | VpsStatus::Locked) {
                vps.status = VpsStatus::Running;
            }
        }

        let period_start = match vps.expire_at {
            Some(at) if at > now => at,
            _ => now,
        };
        vps.expire_at = Some(next);
        vps.set_current_period(period_start, next);
        self.store.vps.update_instance(&vps).await?;
        info!(vps_id, days, expire_at = %next, "Instance renewed");
        Ok(vps)
    }

    pub(crate) async fn apply_renew_item(&self, order: &Order, item: &mut OrderItem) -> Result<()> {
        let spec: RenewSpec = serde_json::from_str(&item.spec_json)?;
        let days = if spec.renew_days > 0 {
            spec.renew_days as i64
        } else {
            spec.duration_months.max(1) as i64 * 30
        };
        let ctx = CallContext {
            order_id: order.id,
            item_id: item.id,
        };
        let mut vps = self.renew_with_context(spec.vps_id, days, ctx).await?;
        if spec.emergency {
            vps.last_emergency_renew_at = Some(Utc::now());
            self.store.vps.update_instance(&vps).await?;
        }
        item.vps_id = Some(vps.id);
        self.complete_item(order, item).await
    }

    /// Destroy the instance and return the money.
    pub(crate) async fn apply_refund_item(&self, order: &Order, item: &mut OrderItem) -> Result<()> {
        let spec: RefundSpec = serde_json::from_str(&item.spec_json)?;
        if spec.refund_amount <= 0 {
            return Err(Error::invalid("refund amount must be positive"));
        }
        let vps = self.store.vps.get_instance(spec.vps_id).await?;
        let ctx = CallContext {
            order_id: order.id,
            item_id: item.id,
        };

        if !self.refund_through_gateway(order, &vps, spec.refund_amount, &spec.reason).await {
            self.wallet
                .credit_once(
                    vps.user_id,
                    spec.refund_amount,
                    refs::REFUND_ORDER,
                    order.id,
                    &format!("refund {}", order.order_no),
                )
                .await?;
        }

        if let Some(host_id) = vps.host_id() {
            let deleted = match self.client_for(vps.goods_type_id).await {
                Ok(client) => client.delete_host(host_id).await,
                Err(e) => Err(e),
            };
            self.log_call(ctx, "delete_host", &json!({ "host_id": host_id }), &deleted)
                .await;
            if let Err(e) = deleted {
                warn!(vps_id = vps.id, host_id, error = %e, "Host deletion after refund failed");
            }
        }
        self.store.vps.delete_instance(vps.id).await?;
        info!(order_id = order.id, vps_id = vps.id, amount = spec.refund_amount, "Instance refunded");

        item.vps_id = Some(vps.id);
        self.complete_item(order, item).await
    }

    /// Refund the original gateway payment of the instance. False when the
    /// money has to go to the wallet instead.
    async fn refund_through_gateway(
        &self,
        order: &Order,
        vps: &VpsInstance,
        amount: i64,
        reason: &str,
    ) -> bool {
        let Some(payments) = &self.payments else {
            return false;
        };
        let Ok(source_item) = self.store.orders.get_order_item(vps.order_item_id).await else {
            return false;
        };
        let Ok(paid) = self.store.payments.list_payments_by_order(source_item.order_id).await else {
            return false;
        };
        let Some(mut payment) = paid.into_iter().find(|p| {
            p.status == PaymentStatus::Approved
                && p.method != METHOD_BALANCE
                && !p.trade_no.is_empty()
                && p.amount >= amount
        }) else {
            return false;
        };
        let provider = match payments.get_provider(&payment.method).await {
            Ok(p) => p,
            Err(e) => {
                debug!(method = %payment.method, error = %e, "No gateway for refund");
                return false;
            }
        };
        let req = RefundRequest {
            method: payment.method.clone(),
            trade_no: payment.trade_no.clone(),
            refund_no: order.order_no.clone(),
            amount,
            reason: reason.to_string(),
        };
        match provider.refund(req).await {
            Ok(result) => {
                info!(order_id = order.id, method = %payment.method, refund_no = %result.refund_no, "Gateway refund issued");
                if amount >= payment.amount {
                    payment.status = PaymentStatus::Refunded;
                    if let Err(e) = self.store.payments.update_payment(&payment).await {
                        warn!(payment_id = payment.id, error = %e, "Failed to mark payment refunded");
                    }
                }
                true
            }
            Err(e) => {
                warn!(method = %payment.method, error = %e, "Gateway refund failed, crediting wallet");
                false
            }
        }
    }

    /// Lock instances whose expiry has passed.
    pub async fn expire_lock(&self) -> Result<usize> {
        self.expire_lock_at(Utc::now()).await
    }

    pub async fn expire_lock_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self
            .store
            .vps
            .list_expiring(now, self.config.batch_size * 10)
            .await?;
        let mut locked = 0;
        for mut vps in expired {
            if vps.admin_status != AdminStatus::Normal || vps.status == VpsStatus::ExpiredLocked {
                continue;
            }
            let Some(host_id) = vps.host_id() else {
                continue;
            };
            let result = match self.client_for(vps.goods_type_id).await {
                Ok(client) => client.lock_host(host_id).await,
                Err(e) => Err(e),
            };
            self.log_call(CallContext::default(), "lock_host", &json!({ "host_id": host_id }), &result)
                .await;
            match result {
                Ok(()) => {
                    vps.status = VpsStatus::ExpiredLocked;
                    self.store.vps.update_instance(&vps).await?;
                    info!(vps_id = vps.id, host_id, "Expired instance locked");
                    locked += 1;
                }
                Err(e) => warn!(vps_id = vps.id, host_id, error = %e, "Expiry lock failed"),
            }
        }
        Ok(locked)
    }

    /// Delete instances expired for longer than `auto_delete_days`.
    pub async fn auto_delete(&self) -> Result<usize> {
        self.auto_delete_at(Utc::now()).await
    }

    pub async fn auto_delete_at(&self, now: DateTime<Utc>) -> Result<usize> {
        if !self.settings.get_bool(keys::AUTO_DELETE_ENABLED, false).await? {
            return Ok(0);
        }
        let days = self
            .settings
            .get_i64(keys::AUTO_DELETE_DAYS, DEFAULT_AUTO_DELETE_DAYS)
            .await?
            .max(0);
        let expired = self
            .store
            .vps
            .list_expiring(now - Duration::days(days), self.config.batch_size * 10)
            .await?;
        let mut deleted = 0;
        for vps in expired {
            if let Some(host_id) = vps.host_id() {
                let result = match self.client_for(vps.goods_type_id).await {
                    Ok(client) => client.delete_host(host_id).await,
                    Err(e) => Err(e),
                };
                self.log_call(CallContext::default(), "delete_host", &json!({ "host_id": host_id }), &result)
                    .await;
                if let Err(e) = result {
                    warn!(vps_id = vps.id, host_id, error = %e, "Auto delete failed");
                    continue;
                }
            }
            self.store.vps.delete_instance(vps.id).await?;
            info!(vps_id = vps.id, "Expired instance deleted");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Notify owners of instances that expire soon.
    pub async fn send_expire_reminders(&self) -> Result<usize> {
        self.send_expire_reminders_at(Utc::now()).await
    }

    pub async fn send_expire_reminders_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let days = self
            .settings
            .get_i64(keys::EXPIRE_REMINDER_DAYS, DEFAULT_REMINDER_DAYS)
            .await?;
        if days <= 0 {
            return Ok(0);
        }
        let soon = self
            .store
            .vps
            .list_expiring(now + Duration::days(days), self.config.batch_size * 10)
            .await?;
        let mut sent = 0;
        for vps in soon {
            let Some(expire_at) = vps.expire_at else {
                continue;
            };
            if expire_at <= now || vps.status == VpsStatus::ExpiredLocked {
                continue;
            }
            let note = Notification {
                id: 0,
                user_id: vps.user_id,
                kind: "vps_expire".into(),
                title: format!("{} expires soon", vps.name),
                content: format!(
                    "Instance {} expires at {}. Renew it to keep it running.",
                    vps.name,
                    expire_at.format("%Y-%m-%d %H:%M UTC")
                ),
                created_at: now,
            };
            match self.store.notifications.create_notification(note).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(vps_id = vps.id, error = %e, "Failed to store expiry reminder"),
            }
        }
        Ok(sent)
    }

    /// Items stuck in `approved` are dispatched again.
    pub async fn redispatch_approved(&self) -> Result<usize> {
        let items = self
            .store
            .orders
            .list_items_by_status(ItemStatus::Approved, self.config.batch_size)
            .await?;
        let mut orders: Vec<i64> = items.iter().map(|i| i.order_id).collect();
        orders.sort_unstable();
        orders.dedup();
        let mut done = 0;
        for order_id in orders {
            match self.dispatch_order(order_id).await {
                Ok(_) => done += 1,
                Err(e) => debug!(order_id, error = %e, "Redispatch skipped"),
            }
        }
        Ok(done)
    }
}
