// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    pub enum VerificationStatus {
        Verified => "verified",
        Pending => "pending",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RealNameVerification {
    pub id: i64,
    pub user_id: i64,
    /// Provider key, e.g. `idcard_cn` or `plugin/<plugin_id>/<instance_id>`.
    pub provider: String,
    pub real_name: String,
    pub id_number: String,
    pub status: VerificationStatus,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PushToken {
    pub id: i64,
    pub user_id: i64,
    pub platform: String,
    pub token: String,
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PasswordResetToken {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

text_enum! {
    pub enum TaskRunStatus {
        Running => "running",
        Success => "success",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledTaskRun {
    pub id: i64,
    pub task_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TaskRunStatus,
    pub message: String,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub actor_id: i64,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub detail_json: String,
    pub created_at: DateTime<Utc>,
}

text_enum! {
    /// Log tables with age-based retention.
    pub enum RetentionTarget {
        AutomationLogs => "automation_logs",
        AuditLogs => "audit_logs",
        SyncLogs => "sync_logs",
        TaskRuns => "scheduled_task_runs",
        ProbeEvents => "probe_events",
        ProbeSessions => "probe_sessions",
    }
}

impl RetentionTarget {
    /// Setting key holding the retention days.
    pub fn setting_key(&self) -> &'static str {
        match self {
            RetentionTarget::AutomationLogs => "automation_log_retention_days",
            RetentionTarget::AuditLogs => "audit_log_retention_days",
            RetentionTarget::SyncLogs => "sync_log_retention_days",
            RetentionTarget::TaskRuns => "task_run_retention_days",
            RetentionTarget::ProbeEvents => "probe_event_retention_days",
            RetentionTarget::ProbeSessions => "probe_session_retention_days",
        }
    }

    pub fn default_days(&self) -> i64 {
        match self {
            RetentionTarget::AutomationLogs => 30,
            RetentionTarget::AuditLogs => 90,
            RetentionTarget::SyncLogs => 30,
            RetentionTarget::TaskRuns => 14,
            RetentionTarget::ProbeEvents => 30,
            RetentionTarget::ProbeSessions => 7,
        }
    }
}
