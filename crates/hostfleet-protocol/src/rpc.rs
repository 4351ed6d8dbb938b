// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC envelopes carried inside request and response frames.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Services a plugin may serve. `Core` is mandatory, the rest follow the
/// capabilities declared in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Core,
    Payment,
    Kyc,
    Sms,
    Automation,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Core => "core",
            Service::Payment => "payment",
            Service::Kyc => "kyc",
            Service::Sms => "sms",
            Service::Automation => "automation",
        }
    }

    /// Parse a plugin category name into the service that backs it.
    pub fn from_category(category: &str) -> Option<Self> {
        match category {
            "payment" => Some(Service::Payment),
            "kyc" => Some(Service::Kyc),
            "sms" => Some(Service::Sms),
            "automation" => Some(Service::Automation),
            _ => None,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call from host to plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub service: Service,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// The plugin's answer to an [`RpcRequest`] with the same `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Status codes a plugin may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unimplemented,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(ErrorCode::Unimplemented, format!("{method} not implemented"))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Method names, grouped per service.
pub mod methods {
    pub const GET_MANIFEST: &str = "GetManifest";
    pub const GET_CONFIG_SCHEMA: &str = "GetConfigSchema";
    pub const VALIDATE_CONFIG: &str = "ValidateConfig";
    pub const INIT: &str = "Init";
    pub const RELOAD_CONFIG: &str = "ReloadConfig";
    pub const HEALTH: &str = "Health";

    pub const LIST_METHODS: &str = "ListMethods";
    pub const CREATE_PAYMENT: &str = "CreatePayment";
    pub const QUERY_PAYMENT: &str = "QueryPayment";
    pub const REFUND: &str = "Refund";
    pub const VERIFY_NOTIFY: &str = "VerifyNotify";

    pub const KYC_START: &str = "Start";
    pub const KYC_QUERY_RESULT: &str = "QueryResult";

    pub const SMS_SEND: &str = "Send";

    pub mod automation {
        pub const CREATE_HOST: &str = "CreateHost";
        pub const GET_HOST_INFO: &str = "GetHostInfo";
        pub const LIST_HOST_SIMPLE: &str = "ListHostSimple";
        pub const ELASTIC_UPDATE: &str = "ElasticUpdate";
        pub const RENEW_HOST: &str = "RenewHost";
        pub const LOCK_HOST: &str = "LockHost";
        pub const UNLOCK_HOST: &str = "UnlockHost";
        pub const DELETE_HOST: &str = "DeleteHost";
        pub const START_HOST: &str = "StartHost";
        pub const SHUTDOWN_HOST: &str = "ShutdownHost";
        pub const REBOOT_HOST: &str = "RebootHost";
        pub const RESET_OS: &str = "ResetOS";
        pub const RESET_OS_PASSWORD: &str = "ResetOSPassword";
        pub const LIST_SNAPSHOTS: &str = "ListSnapshots";
        pub const CREATE_SNAPSHOT: &str = "CreateSnapshot";
        pub const DELETE_SNAPSHOT: &str = "DeleteSnapshot";
        pub const RESTORE_SNAPSHOT: &str = "RestoreSnapshot";
        pub const LIST_BACKUPS: &str = "ListBackups";
        pub const CREATE_BACKUP: &str = "CreateBackup";
        pub const DELETE_BACKUP: &str = "DeleteBackup";
        pub const RESTORE_BACKUP: &str = "RestoreBackup";
        pub const LIST_FIREWALL_RULES: &str = "ListFirewallRules";
        pub const ADD_FIREWALL_RULE: &str = "AddFirewallRule";
        pub const DELETE_FIREWALL_RULE: &str = "DeleteFirewallRule";
        pub const LIST_PORT_MAPPINGS: &str = "ListPortMappings";
        pub const ADD_PORT_MAPPING: &str = "AddPortMapping";
        pub const DELETE_PORT_MAPPING: &str = "DeletePortMapping";
        pub const FIND_PORT_CANDIDATES: &str = "FindPortCandidates";
        pub const GET_PANEL_URL: &str = "GetPanelURL";
        pub const LIST_AREAS: &str = "ListAreas";
        pub const LIST_IMAGES: &str = "ListImages";
        pub const LIST_LINES: &str = "ListLines";
        pub const LIST_PRODUCTS: &str = "ListProducts";
        pub const GET_MONITOR: &str = "GetMonitor";
        pub const GET_VNC_URL: &str = "GetVNCURL";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = RpcRequest {
            id: 9,
            service: Service::Payment,
            method: methods::CREATE_PAYMENT.to_string(),
            params: json!({"amount": 100}),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["service"], "payment");
        assert_eq!(v["method"], "CreatePayment");
    }

    #[test]
    fn test_error_response_omits_result() {
        let resp = RpcResponse::err(3, RpcError::new(ErrorCode::FailedPrecondition, "not initialized"));
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("result").is_none());
        assert_eq!(v["error"]["code"], "failed_precondition");
        assert_eq!(v["error"]["message"], "not initialized");
    }

    #[test]
    fn test_service_from_category() {
        assert_eq!(Service::from_category("kyc"), Some(Service::Kyc));
        assert_eq!(Service::from_category("core"), None);
    }
}
