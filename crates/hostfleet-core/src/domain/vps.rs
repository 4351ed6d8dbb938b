// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    pub enum VpsStatus {
        Unknown => "unknown",
        Provisioning => "provisioning",
        Running => "running",
        Stopped => "stopped",
        Reinstalling => "reinstalling",
        ReinstallFailed => "reinstall_failed",
        Locked => "locked",
        ExpiredLocked => "expired_locked",
    }
}

text_enum! {
    pub enum AdminStatus {
        Normal => "normal",
        Abuse => "abuse",
        Fraud => "fraud",
        Locked => "locked",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VpsInstance {
    pub id: i64,
    pub user_id: i64,
    pub order_item_id: i64,
    /// Host id on the automation side, as text.
    pub automation_instance_id: String,
    pub goods_type_id: i64,
    pub package_id: i64,
    pub package_name: String,
    pub name: String,
    pub region: String,
    pub line_id: i64,
    pub system_id: i64,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub port_num: i32,
    pub monthly_price: i64,
    pub spec_json: String,
    pub status: VpsStatus,
    pub automation_state: i32,
    pub admin_status: AdminStatus,
    pub expire_at: Option<DateTime<Utc>>,
    pub last_emergency_renew_at: Option<DateTime<Utc>>,
    pub access_info_json: String,
    pub panel_url_cache: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VpsInstance {
    /// Automation host id parsed from `automation_instance_id`.
    pub fn host_id(&self) -> Option<i64> {
        self.automation_instance_id.trim().parse().ok()
    }

    /// Billing period the instance is in: `current_period_start/end` from
    /// `spec_json`, else `created_at..expire_at` while not expired.
    pub fn current_period(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let spec: serde_json::Value = serde_json::from_str(&self.spec_json).unwrap_or_default();
        let field = |key: &str| {
            spec.get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        if let Some(start) = field("current_period_start") {
            if let Some(end) = field("current_period_end").or(self.expire_at) {
                return Some((start, end));
            }
        }
        match self.expire_at {
            Some(end) if end > now => Some((self.created_at, end)),
            _ => None,
        }
    }

    /// Record the billing period in `spec_json`, keeping the other keys.
    pub fn set_current_period(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut spec: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.spec_json).unwrap_or_default();
        spec.insert("current_period_start".into(), start.to_rfc3339().into());
        spec.insert("current_period_end".into(), end.to_rfc3339().into());
        self.spec_json = serde_json::Value::Object(spec).to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AutomationLog {
    pub id: i64,
    pub order_id: i64,
    pub order_item_id: i64,
    pub action: String,
    pub request_json: String,
    pub response_json: String,
    pub success: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

text_enum! {
    pub enum JobStatus {
        Pending => "pending",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

impl JobStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProvisionJob {
    pub id: i64,
    pub order_id: i64,
    pub order_item_id: i64,
    /// Automation host id once `CreateHost` succeeded, else 0.
    pub host_id: i64,
    pub host_name: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResizeTask {
    pub id: i64,
    pub vps_id: i64,
    pub order_id: i64,
    pub order_item_id: i64,
    pub status: JobStatus,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Target resources of a resize order item, stored in `spec_json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSpec {
    pub vps_id: i64,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    #[serde(default)]
    pub target_package_id: Option<i64>,
    /// Monthly price after the resize.
    #[serde(default)]
    pub monthly_price: i64,
    /// Add-ons after the resize.
    #[serde(default)]
    pub spec: Option<super::CartSpec>,
    #[serde(default)]
    pub charge_amount: i64,
    /// Credited to the wallet once the resize is applied.
    #[serde(default)]
    pub refund_amount: i64,
}

/// Spec of a renew order item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewSpec {
    pub vps_id: i64,
    pub renew_days: i32,
    #[serde(default)]
    pub duration_months: i32,
    /// Created through the emergency renew path.
    #[serde(default)]
    pub emergency: bool,
}

/// Spec of a refund order item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSpec {
    pub vps_id: i64,
    pub refund_amount: i64,
    #[serde(default)]
    pub reason: String,
}
