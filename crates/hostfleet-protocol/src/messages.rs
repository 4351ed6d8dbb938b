// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and result payloads for every plugin service.
//!
//! These are the `params` / `result` bodies of [`RpcRequest`](crate::rpc::RpcRequest)
//! and [`RpcResponse`](crate::rpc::RpcResponse). Both the host and plugin side
//! share them so the two ends cannot drift.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Core
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    /// JSON Schema document, as a JSON string.
    #[serde(default)]
    pub json_schema: String,
    /// UI hints, as a JSON string.
    #[serde(default)]
    pub ui_schema: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub config_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    pub instance_id: String,
    pub config_json: String,
}

/// Result of `ValidateConfig`, `Init` and `ReloadConfig`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub unix_millis: i64,
}

// ============================================================================
// Payment
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodList {
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentCreateRequest {
    pub method: String,
    pub order_id: i64,
    pub order_no: String,
    pub user_id: i64,
    pub amount: i64,
    pub currency: String,
    pub subject: String,
    #[serde(default)]
    pub return_url: String,
    #[serde(default)]
    pub notify_url: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentCreateResult {
    #[serde(default)]
    pub trade_no: String,
    #[serde(default)]
    pub pay_url: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentQueryRequest {
    pub method: String,
    #[serde(default)]
    pub order_no: String,
    #[serde(default)]
    pub trade_no: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentQueryResult {
    pub status: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub raw_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub method: String,
    pub trade_no: String,
    pub refund_no: String,
    pub amount: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefundResult {
    #[serde(default)]
    pub refund_no: String,
    pub status: String,
    #[serde(default)]
    pub raw_json: String,
}

/// An inbound HTTP callback forwarded untouched to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyNotifyRequest {
    pub method: String,
    pub request: RawHttpRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyResult {
    #[serde(default)]
    pub order_no: String,
    #[serde(default)]
    pub trade_no: String,
    #[serde(default)]
    pub amount: i64,
    pub status: String,
    /// Body the gateway expects as acknowledgement (e.g. `success`).
    #[serde(default)]
    pub ack_body: String,
    #[serde(default)]
    pub raw_json: String,
}

impl NotifyResult {
    pub fn is_paid(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "paid" | "success" | "succeeded" | "trade_success" | "trade_finished"
        )
    }
}

// ============================================================================
// KYC
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KycStartRequest {
    pub user_id: i64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KycStartResult {
    pub ok: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub url: String,
    /// `query_result` or `redirect`.
    #[serde(default)]
    pub next_step: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KycQueryRequest {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KycResultStatus {
    Verified,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KycQueryResult {
    pub ok: bool,
    pub status: KycResultStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub raw_json: String,
}

// ============================================================================
// SMS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmsSendRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    pub phones: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmsSendResult {
    pub ok: bool,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub error: String,
}

// ============================================================================
// Automation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateHostRequest {
    pub line_id: i64,
    pub os: String,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth: i32,
    pub expire_time: DateTime<Utc>,
    pub host_name: String,
    #[serde(default)]
    pub sys_pwd: String,
    #[serde(default)]
    pub vnc_pwd: String,
    #[serde(default)]
    pub port_num: i32,
    #[serde(default)]
    pub snapshot: i32,
    #[serde(default)]
    pub backups: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateHostResult {
    pub host_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_id: i64,
    #[serde(default)]
    pub host_name: String,
    /// Automation-side state code.
    pub state: i32,
    #[serde(default)]
    pub cpu: i32,
    #[serde(default)]
    pub memory_gb: i32,
    #[serde(default)]
    pub disk_gb: i32,
    #[serde(default)]
    pub bandwidth: i32,
    #[serde(default)]
    pub panel_password: String,
    #[serde(default)]
    pub vnc_password: String,
    #[serde(default)]
    pub os_password: String,
    #[serde(default)]
    pub remote_ip: String,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSimple {
    pub id: i64,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostRef {
    pub host_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSearch {
    #[serde(default)]
    pub search_tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElasticUpdateRequest {
    pub host_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_num: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewHostRequest {
    pub host_id: i64,
    pub next_due_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetOsRequest {
    pub host_id: i64,
    pub template_id: i64,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetPasswordRequest {
    pub host_id: i64,
    pub password: String,
}

/// Refers to a snapshot, backup, firewall rule or port mapping of a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostResourceRef {
    pub host_id: i64,
    pub resource_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallRuleCreate {
    pub host_id: i64,
    pub direction: String,
    pub protocol: String,
    pub method: String,
    pub port: String,
    pub ip: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortMappingCreate {
    pub host_id: i64,
    pub name: String,
    pub sport: String,
    pub dport: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortCandidatesRequest {
    pub host_id: i64,
    #[serde(default)]
    pub keywords: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortCandidates {
    pub ports: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelUrlRequest {
    pub host_name: String,
    pub panel_password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UrlResult {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineRef {
    pub line_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub state: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub image_id: i64,
    pub name: String,
    #[serde(default)]
    pub r#type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub area_id: i64,
    #[serde(default)]
    pub state: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub cpu: i32,
    #[serde(default)]
    pub memory_gb: i32,
    #[serde(default)]
    pub disk_gb: i32,
    #[serde(default)]
    pub bandwidth: i32,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub port_num: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    #[serde(default)]
    pub cpu_percent: i32,
    #[serde(default)]
    pub memory_percent: i32,
    #[serde(default)]
    pub bytes_in: i64,
    #[serde(default)]
    pub bytes_out: i64,
    #[serde(default)]
    pub storage_info: String,
}

/// Driver-specific listing rows (snapshots, backups, firewall rules, port
/// mappings) are passed through as JSON objects.
pub type ResourceRow = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceList {
    pub items: Vec<ResourceRow>,
}

/// Generic wrapper for list results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Items<T> {
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notify_paid_statuses() {
        let mut r = NotifyResult {
            status: "TRADE_SUCCESS".into(),
            ..Default::default()
        };
        assert!(r.is_paid());
        r.status = "WAIT_BUYER_PAY".into();
        assert!(!r.is_paid());
    }

    #[test]
    fn test_kyc_status_is_uppercase_on_wire() {
        let r: KycQueryResult = serde_json::from_value(json!({
            "ok": true,
            "status": "VERIFIED"
        }))
        .unwrap();
        assert_eq!(r.status, KycResultStatus::Verified);
        assert_eq!(r.reason, "");
    }

    #[test]
    fn test_elastic_update_omits_unset_fields() {
        let req = ElasticUpdateRequest {
            host_id: 7,
            cpu: Some(4),
            ..Default::default()
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, json!({"host_id": 7, "cpu": 4}));
    }
}
