// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Real-name verification.
//!
//! Providers answer a verification attempt with verified, failed, or a
//! pending marker (see [`PendingReason`]) that the poller resolves later.

mod idcard;
mod reason;
mod service;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use idcard::{IDCARD_CN, IdCardCnProvider, validate_id_number};
pub use reason::PendingReason;
pub use service::{DEFAULT_BLOCK_ACTIONS, KycConfig, KycService};

/// Data submitted by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyInput {
    pub real_name: String,
    pub id_number: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub callback_url: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Answer of [`KycProvider::verify`]. A failed verdict whose reason is a
/// pending marker means the result is not known yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KycVerdict {
    pub ok: bool,
    pub reason: String,
}

impl KycVerdict {
    pub fn verified() -> Self {
        Self {
            ok: true,
            reason: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }

    pub fn pending(reason: PendingReason) -> Self {
        Self {
            ok: false,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingOutcome {
    Verified,
    Failed,
    Pending,
}

#[async_trait]
pub trait KycProvider: Send + Sync {
    fn key(&self) -> &str;

    fn name(&self) -> &str;

    async fn verify(&self, input: &VerifyInput) -> Result<KycVerdict>;

    /// Resolve a pending token. `channel` is the face-check channel when
    /// the marker carried one.
    async fn query_pending(&self, _token: &str, _channel: &str) -> Result<(PendingOutcome, String)> {
        Err(Error::NotSupported(format!("{} has no pending results", self.key())))
    }
}

#[async_trait]
pub trait KycProviderRegistry: Send + Sync {
    async fn list_providers(&self) -> Vec<Arc<dyn KycProvider>>;

    /// `NotFound` for unknown keys.
    async fn get_provider(&self, key: &str) -> Result<Arc<dyn KycProvider>>;
}

/// Fixed set of providers, the built-in validator included.
pub struct StaticKycRegistry {
    providers: RwLock<Vec<Arc<dyn KycProvider>>>,
}

impl StaticKycRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(vec![Arc::new(IdCardCnProvider)]),
        }
    }

    /// Add a provider, replacing one with the same key.
    pub fn register(&self, provider: Arc<dyn KycProvider>) {
        let mut providers = self.providers.write();
        providers.retain(|p| p.key() != provider.key());
        providers.push(provider);
    }
}

impl Default for StaticKycRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KycProviderRegistry for StaticKycRegistry {
    async fn list_providers(&self) -> Vec<Arc<dyn KycProvider>> {
        self.providers.read().clone()
    }

    async fn get_provider(&self, key: &str) -> Result<Arc<dyn KycProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.key() == key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("kyc provider {key}")))
    }
}
