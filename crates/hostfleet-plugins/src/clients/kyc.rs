// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Real-name verification through KYC plugins.
//!
//! Plugin providers are keyed `plugin/<plugin_id>/<instance_id>`. A start
//! that returns a redirect URL becomes a `pending_face` marker whose channel
//! is the provider key; a bare token becomes `pending` and is resolved later
//! by the scheduler through [`KycProvider::query_pending`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hostfleet_core::domain::{InstanceKey, PluginCategory};
use hostfleet_core::kyc::{
    IDCARD_CN, IdCardCnProvider, KycProvider, KycProviderRegistry, KycVerdict, PendingOutcome,
    PendingReason, VerifyInput,
};
use hostfleet_core::{Error, Result};
use hostfleet_protocol::messages::{
    KycQueryRequest, KycQueryResult, KycResultStatus, KycStartRequest, KycStartResult,
};
use hostfleet_protocol::{Service, methods};
use tracing::debug;

use crate::host::PluginHost;

const KEY_PREFIX: &str = "plugin";

pub struct KycPluginProvider {
    host: Arc<PluginHost>,
    key: InstanceKey,
    provider_key: String,
    name: String,
}

impl KycPluginProvider {
    pub fn new(host: Arc<PluginHost>, key: InstanceKey, name: impl Into<String>) -> Self {
        let provider_key = format!("{KEY_PREFIX}/{}/{}", key.plugin_id, key.instance_id);
        Self {
            host,
            key,
            provider_key,
            name: name.into(),
        }
    }

    async fn query(&self, token: &str) -> Result<KycQueryResult> {
        self.host
            .call(&self.key, Service::Kyc, methods::KYC_QUERY_RESULT, &KycQueryRequest {
                token: token.to_string(),
            })
            .await
    }
}

/// Split a `plugin/<plugin_id>/<instance_id>` provider key.
fn parse_provider_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(KEY_PREFIX), Some(plugin_id), Some(instance_id))
            if !plugin_id.is_empty() && !instance_id.is_empty() && !instance_id.contains('/') =>
        {
            Some((plugin_id, instance_id))
        }
        _ => None,
    }
}

fn start_params(input: &VerifyInput) -> (i64, BTreeMap<String, String>) {
    let mut params = BTreeMap::new();
    let name = input.real_name.trim().to_string();
    let phone = input.phone.trim().to_string();
    params.insert("name".to_string(), name.clone());
    params.insert("real_name".to_string(), name);
    params.insert("id_number".to_string(), input.id_number.trim().to_string());
    params.insert("phone".to_string(), phone.clone());
    params.insert("mobile".to_string(), phone);
    if !input.callback_url.is_empty() {
        params.insert("callback_url".to_string(), input.callback_url.clone());
    }
    let mut user_id = 0;
    for (k, v) in &input.extra {
        if k == "user_id" {
            user_id = v.trim().parse().unwrap_or(0);
            continue;
        }
        params.insert(k.clone(), v.clone());
    }
    (user_id, params)
}

fn outcome(status: KycResultStatus) -> PendingOutcome {
    match status {
        KycResultStatus::Verified => PendingOutcome::Verified,
        KycResultStatus::Failed => PendingOutcome::Failed,
        KycResultStatus::Pending => PendingOutcome::Pending,
    }
}

#[async_trait]
impl KycProvider for KycPluginProvider {
    fn key(&self) -> &str {
        &self.provider_key
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, input: &VerifyInput) -> Result<KycVerdict> {
        let (user_id, params) = start_params(input);
        let started: KycStartResult = self
            .host
            .call(&self.key, Service::Kyc, methods::KYC_START, &KycStartRequest {
                user_id,
                params,
            })
            .await?;
        if !started.ok {
            let reason = if started.error.is_empty() {
                "verification rejected".to_string()
            } else {
                started.error
            };
            return Ok(KycVerdict::failed(reason));
        }
        if started.token.is_empty() {
            return Ok(KycVerdict::verified());
        }
        if started.next_step == "redirect" || !started.url.is_empty() {
            debug!(plugin = %self.key, user_id, "KYC waiting for face check");
            return Ok(KycVerdict::pending(PendingReason::PendingFace {
                channel: self.provider_key.clone(),
                token: started.token,
                url: Some(started.url).filter(|u| !u.is_empty()),
            }));
        }
        let result = self.query(&started.token).await?;
        Ok(match outcome(result.status) {
            PendingOutcome::Verified => KycVerdict::verified(),
            PendingOutcome::Pending => KycVerdict::pending(PendingReason::Pending {
                token: started.token,
            }),
            PendingOutcome::Failed => KycVerdict::failed(result.reason),
        })
    }

    async fn query_pending(&self, token: &str, _channel: &str) -> Result<(PendingOutcome, String)> {
        let result = self.query(token).await?;
        Ok((outcome(result.status), result.reason))
    }
}

/// The built-in validator plus every loaded KYC instance.
pub struct PluginKycRegistry {
    host: Arc<PluginHost>,
}

impl PluginKycRegistry {
    pub fn new(host: Arc<PluginHost>) -> Self {
        Self { host }
    }

    fn provider(&self, key: InstanceKey) -> Option<Arc<dyn KycProvider>> {
        let running = self.host.running(&key)?;
        let name = running.manifest.name.clone();
        Some(Arc::new(KycPluginProvider::new(self.host.clone(), key, name)))
    }
}

#[async_trait]
impl KycProviderRegistry for PluginKycRegistry {
    async fn list_providers(&self) -> Vec<Arc<dyn KycProvider>> {
        let mut out: Vec<Arc<dyn KycProvider>> = vec![Arc::new(IdCardCnProvider)];
        for key in self.host.loaded_instances() {
            if key.category != PluginCategory::Kyc {
                continue;
            }
            if let Some(p) = self.provider(key) {
                out.push(p);
            }
        }
        out
    }

    async fn get_provider(&self, key: &str) -> Result<Arc<dyn KycProvider>> {
        if key == IDCARD_CN {
            return Ok(Arc::new(IdCardCnProvider));
        }
        let (plugin_id, instance_id) =
            parse_provider_key(key).ok_or_else(|| Error::not_found(format!("kyc provider {key}")))?;
        let instance = InstanceKey::new(PluginCategory::Kyc, plugin_id, instance_id);
        self.provider(instance)
            .ok_or_else(|| Error::not_found(format!("kyc provider {key}")))
    }
}
