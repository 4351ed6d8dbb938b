// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One payment method served by a payment plugin instance.

use std::sync::Arc;

use async_trait::async_trait;
use hostfleet_core::Result;
use hostfleet_core::domain::InstanceKey;
use hostfleet_core::payment::PaymentProvider;
use hostfleet_protocol::messages::{
    NotifyResult, PaymentCreateRequest, PaymentCreateResult, PaymentQueryRequest,
    PaymentQueryResult, RawHttpRequest, RefundRequest, RefundResult, VerifyNotifyRequest,
};
use hostfleet_protocol::{Service, methods};

use crate::host::PluginHost;

pub struct PaymentPluginProvider {
    host: Arc<PluginHost>,
    key: InstanceKey,
    method: String,
    name: String,
    schema_json: String,
}

impl PaymentPluginProvider {
    pub fn new(
        host: Arc<PluginHost>,
        key: InstanceKey,
        method: impl Into<String>,
        name: impl Into<String>,
        schema_json: impl Into<String>,
    ) -> Self {
        Self {
            host,
            key,
            method: method.into(),
            name: name.into(),
            schema_json: schema_json.into(),
        }
    }

    /// Instance that owns the method.
    pub fn instance(&self) -> &InstanceKey {
        &self.key
    }
}

#[async_trait]
impl PaymentProvider for PaymentPluginProvider {
    fn key(&self) -> &str {
        &self.method
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn schema_json(&self) -> &str {
        &self.schema_json
    }

    async fn create_payment(&self, mut req: PaymentCreateRequest) -> Result<PaymentCreateResult> {
        req.method = self.method.clone();
        self.host
            .call(&self.key, Service::Payment, methods::CREATE_PAYMENT, &req)
            .await
    }

    async fn verify_notify(&self, req: RawHttpRequest) -> Result<NotifyResult> {
        let req = VerifyNotifyRequest {
            method: self.method.clone(),
            request: req,
        };
        self.host
            .call(&self.key, Service::Payment, methods::VERIFY_NOTIFY, &req)
            .await
    }

    async fn query_payment(&self, order_no: &str, trade_no: &str) -> Result<PaymentQueryResult> {
        let req = PaymentQueryRequest {
            method: self.method.clone(),
            order_no: order_no.to_string(),
            trade_no: trade_no.to_string(),
        };
        self.host
            .call(&self.key, Service::Payment, methods::QUERY_PAYMENT, &req)
            .await
    }

    async fn refund(&self, mut req: RefundRequest) -> Result<RefundResult> {
        req.method = self.method.clone();
        self.host
            .call(&self.key, Service::Payment, methods::REFUND, &req)
            .await
    }
}
