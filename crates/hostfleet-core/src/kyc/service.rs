// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{RealNameVerification, VerificationStatus};
use crate::error::{Error, Result};
use crate::orders::ActionGate;
use crate::settings::{SettingsReader, keys};
use crate::store::RealNameRepository;

use super::{IDCARD_CN, KycProviderRegistry, PendingOutcome, PendingReason, VerifyInput};

/// Actions gated when no block list is configured.
pub const DEFAULT_BLOCK_ACTIONS: &[&str] = &["purchase_vps"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycConfig {
    pub enabled: bool,
    pub provider: String,
    pub block_actions: Vec<String>,
}

pub struct KycService {
    repo: Arc<dyn RealNameRepository>,
    registry: Arc<dyn KycProviderRegistry>,
    settings: SettingsReader,
}

impl KycService {
    pub fn new(
        repo: Arc<dyn RealNameRepository>,
        registry: Arc<dyn KycProviderRegistry>,
        settings: SettingsReader,
    ) -> Self {
        Self {
            repo,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<dyn KycProviderRegistry> {
        &self.registry
    }

    pub async fn config(&self) -> Result<KycConfig> {
        let enabled = self.settings.get_bool(keys::REALNAME_ENABLED, false).await?;
        let provider = match self.settings.get_string(keys::REALNAME_PROVIDER, "").await?.trim() {
            "" => IDCARD_CN.to_string(),
            p => p.to_string(),
        };
        let block_actions = match self
            .settings
            .get_json::<Vec<String>>(keys::REALNAME_BLOCK_ACTIONS)
            .await
        {
            Ok(Some(list)) => list,
            Ok(None) => DEFAULT_BLOCK_ACTIONS.iter().map(|s| s.to_string()).collect(),
            Err(e) => {
                warn!(error = %e, "Unreadable realname_block_actions, using defaults");
                DEFAULT_BLOCK_ACTIONS.iter().map(|s| s.to_string()).collect()
            }
        };
        Ok(KycConfig {
            enabled,
            provider,
            block_actions,
        })
    }

    pub async fn update_config(&self, config: &KycConfig) -> Result<()> {
        let provider = match config.provider.trim() {
            "" => IDCARD_CN,
            p => p,
        };
        self.settings
            .set(keys::REALNAME_ENABLED, if config.enabled { "true" } else { "false" })
            .await?;
        self.settings.set(keys::REALNAME_PROVIDER, provider).await?;
        self.settings
            .set(
                keys::REALNAME_BLOCK_ACTIONS,
                &serde_json::to_string(&config.block_actions)?,
            )
            .await
    }

    /// Run a verification with the configured provider and record it.
    pub async fn verify(&self, user_id: i64, mut input: VerifyInput) -> Result<RealNameVerification> {
        let config = self.config().await?;
        if !config.enabled {
            return Err(Error::forbidden("real-name verification is disabled"));
        }
        let provider = self.registry.get_provider(&config.provider).await?;
        input
            .extra
            .entry("user_id".to_string())
            .or_insert_with(|| user_id.to_string());
        let verdict = provider.verify(&input).await?;

        let now = Utc::now();
        let (status, reason, verified_at) = if verdict.ok {
            (VerificationStatus::Verified, String::new(), Some(now))
        } else if PendingReason::is_pending(&verdict.reason) {
            (VerificationStatus::Pending, verdict.reason.trim().to_string(), None)
        } else {
            (VerificationStatus::Failed, verdict.reason, None)
        };
        let record = self
            .repo
            .create_verification(RealNameVerification {
                id: 0,
                user_id,
                provider: provider.key().to_string(),
                real_name: input.real_name.trim().to_string(),
                id_number: input.id_number.trim().to_string(),
                status,
                reason,
                created_at: now,
                verified_at,
            })
            .await?;
        info!(user_id, provider = %record.provider, status = %record.status, "Real-name verification recorded");
        Ok(record)
    }

    /// Resolve pending records through their providers. Returns how many
    /// records reached a final state.
    pub async fn poll_pending(&self, limit: i64) -> Result<usize> {
        let limit = if limit <= 0 { 200 } else { limit };
        let pending = self.repo.list_pending_verifications(limit).await?;
        let mut resolved = 0;
        for record in pending {
            let Some(marker) = PendingReason::parse(&record.reason) else {
                self.repo
                    .update_verification_status(record.id, VerificationStatus::Failed, "invalid pending token", None)
                    .await?;
                resolved += 1;
                continue;
            };
            let provider = match self.registry.get_provider(&record.provider).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(record_id = record.id, provider = %record.provider, error = %e, "Provider gone, keeping record pending");
                    continue;
                }
            };
            let outcome = provider.query_pending(marker.token(), marker.channel()).await;
            match outcome {
                Ok((PendingOutcome::Verified, _)) => {
                    self.repo
                        .update_verification_status(record.id, VerificationStatus::Verified, "", Some(Utc::now()))
                        .await?;
                    info!(record_id = record.id, user_id = record.user_id, "Pending verification passed");
                    resolved += 1;
                }
                Ok((PendingOutcome::Failed, reason)) => {
                    self.repo
                        .update_verification_status(record.id, VerificationStatus::Failed, reason.trim(), None)
                        .await?;
                    info!(record_id = record.id, user_id = record.user_id, reason = %reason, "Pending verification failed");
                    resolved += 1;
                }
                Ok((PendingOutcome::Pending, _)) => {}
                Err(e) => warn!(record_id = record.id, error = %e, "Pending verification query failed"),
            }
        }
        Ok(resolved)
    }

    pub async fn latest(&self, user_id: i64) -> Result<Option<RealNameVerification>> {
        self.repo.latest_verification(user_id).await
    }

    /// Manual override by staff.
    pub async fn update_status(&self, record_id: i64, status: VerificationStatus, reason: &str) -> Result<()> {
        let verified_at = (status == VerificationStatus::Verified).then(Utc::now);
        self.repo
            .update_verification_status(record_id, status, reason.trim(), verified_at)
            .await
    }
}

#[async_trait]
impl ActionGate for KycService {
    async fn require_action(&self, user_id: i64, action: &str) -> Result<()> {
        let config = self.config().await?;
        if !config.enabled || action.is_empty() {
            return Ok(());
        }
        let gated = config
            .block_actions
            .iter()
            .any(|a| a.trim().eq_ignore_ascii_case(action));
        if !gated {
            return Ok(());
        }
        match self.repo.latest_verification(user_id).await? {
            Some(v) if v.status == VerificationStatus::Verified => Ok(()),
            _ => Err(Error::RealNameRequired),
        }
    }
}
