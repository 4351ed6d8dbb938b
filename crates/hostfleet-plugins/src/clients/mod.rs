// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability clients: core traits implemented on top of plugin RPC.

mod automation;
mod kyc;
mod payment;
mod sms;

pub use automation::AutomationPluginClient;
pub use kyc::{KycPluginProvider, PluginKycRegistry};
pub use payment::PaymentPluginProvider;
pub use sms::PluginSmsSender;

use hostfleet_core::domain::InstanceKey;
use hostfleet_core::{Error, Result};
use serde_json::Value;

/// Turn `{"ok": false, "error": ...}` replies into `FailedPrecondition`.
/// Any other body counts as success.
pub(crate) fn expect_ok(key: &InstanceKey, method: &str, reply: &Value) -> Result<()> {
    if reply.get("ok").and_then(Value::as_bool) == Some(false) {
        let reason = reply
            .get("error")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("rejected");
        return Err(Error::FailedPrecondition(format!("{key} {method}: {reason}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostfleet_core::domain::PluginCategory;
    use serde_json::json;

    #[test]
    fn test_expect_ok() {
        let key = InstanceKey::new(PluginCategory::Automation, "lightboat", "default");
        assert!(expect_ok(&key, "LockHost", &json!({})).is_ok());
        assert!(expect_ok(&key, "LockHost", &Value::Null).is_ok());
        assert!(expect_ok(&key, "LockHost", &json!({"ok": true})).is_ok());

        let err = expect_ok(&key, "LockHost", &json!({"ok": false, "error": "host busy"})).unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(ref m) if m.contains("host busy")));
    }
}
