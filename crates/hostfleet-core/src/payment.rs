// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payment provider seam. Providers are keyed by payment method name.

use std::sync::Arc;

use async_trait::async_trait;
use hostfleet_protocol::messages::{
    NotifyResult, PaymentCreateRequest, PaymentCreateResult, PaymentQueryResult, RawHttpRequest,
    RefundRequest, RefundResult,
};
use serde::Serialize;

use crate::error::{Error, Result};

/// Method key of wallet payments. Never backed by a plugin.
pub const METHOD_BALANCE: &str = "balance";

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Payment method, e.g. `alipay_native`.
    fn key(&self) -> &str;

    fn name(&self) -> &str;

    fn schema_json(&self) -> &str {
        ""
    }

    async fn create_payment(&self, req: PaymentCreateRequest) -> Result<PaymentCreateResult>;

    /// Verify a gateway callback. Signature failures are `Unauthorized`.
    async fn verify_notify(&self, req: RawHttpRequest) -> Result<NotifyResult>;

    async fn query_payment(&self, _order_no: &str, _trade_no: &str) -> Result<PaymentQueryResult> {
        Err(Error::NotSupported(format!("{} does not support query", self.key())))
    }

    async fn refund(&self, _req: RefundRequest) -> Result<RefundResult> {
        Err(Error::NotSupported(format!("{} does not support refund", self.key())))
    }
}

/// Listing entry of [`PaymentProviderRegistry::list_providers`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub key: String,
    pub name: String,
    pub enabled: bool,
    pub plugin_id: String,
    pub instance_id: String,
    pub schema_json: String,
}

#[async_trait]
pub trait PaymentProviderRegistry: Send + Sync {
    async fn list_providers(&self, include_disabled: bool) -> Result<Vec<ProviderInfo>>;

    /// `NotFound` for unknown methods, `Forbidden` when disabled,
    /// `Unavailable` when the backing instance is not loaded.
    async fn get_provider(&self, key: &str) -> Result<Arc<dyn PaymentProvider>>;

    /// Plaintext config of the owning instance and whether the method is enabled.
    async fn get_provider_config(&self, key: &str) -> Result<(String, bool)>;

    async fn update_provider_config(&self, key: &str, enabled: bool, config_json: &str)
    -> Result<()>;
}
