// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Age-based purge of log tables.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::domain::RetentionTarget;
use crate::error::Result;
use crate::settings::SettingsReader;
use crate::store::RetentionRepository;

/// Longest retention accepted from settings.
pub const MAX_RETENTION_DAYS: i64 = 3650;

pub struct LogRetention {
    settings: SettingsReader,
    repo: Arc<dyn RetentionRepository>,
}

impl LogRetention {
    pub fn new(settings: SettingsReader, repo: Arc<dyn RetentionRepository>) -> Self {
        Self { settings, repo }
    }

    /// Configured days for `target`; 0 disables the purge.
    pub async fn retention_days(&self, target: RetentionTarget) -> Result<i64> {
        let days = self
            .settings
            .get_i64(target.setting_key(), target.default_days())
            .await?;
        Ok(days.clamp(0, MAX_RETENTION_DAYS))
    }

    /// Purge every target and summarise what was removed.
    pub async fn cleanup(&self) -> Result<String> {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<String> {
        let mut parts = Vec::new();
        for target in RetentionTarget::ALL {
            let days = self.retention_days(*target).await?;
            if days == 0 {
                parts.push(format!("{target}=off"));
                continue;
            }
            let cutoff = now - Duration::days(days);
            match self.repo.purge_before(*target, cutoff).await {
                Ok(removed) => {
                    if removed > 0 {
                        info!(target = %target, removed, days, "Purged old log rows");
                    }
                    parts.push(format!("{target}={removed}"));
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "Log purge failed");
                    parts.push(format!("{target}=error"));
                }
            }
        }
        Ok(parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_days_are_clamped() {
        let store = Arc::new(MemoryStore::new());
        let settings = SettingsReader::new(store.clone());
        let r = LogRetention::new(settings.clone(), store);
        assert_eq!(r.retention_days(RetentionTarget::AuditLogs).await.unwrap(), 90);
        settings.set("audit_log_retention_days", "99999").await.unwrap();
        assert_eq!(r.retention_days(RetentionTarget::AuditLogs).await.unwrap(), 3650);
        settings.set("audit_log_retention_days", "-4").await.unwrap();
        assert_eq!(r.retention_days(RetentionTarget::AuditLogs).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_respects_cutoff_and_disable() {
        let store = Arc::new(MemoryStore::new());
        let settings = SettingsReader::new(store.clone());
        let now = Utc::now();
        store.seed_log(RetentionTarget::ProbeEvents, now - Duration::days(31));
        store.seed_log(RetentionTarget::ProbeEvents, now - Duration::days(29));
        store.seed_log(RetentionTarget::SyncLogs, now - Duration::days(400));
        settings.set("sync_log_retention_days", "0").await.unwrap();

        let summary = LogRetention::new(settings, store.clone())
            .cleanup_at(now)
            .await
            .unwrap();
        assert!(summary.contains("probe_events=1"), "{summary}");
        assert!(summary.contains("sync_logs=off"), "{summary}");
        assert_eq!(
            store
                .purge_before(RetentionTarget::SyncLogs, now)
                .await
                .unwrap(),
            1
        );
    }
}
