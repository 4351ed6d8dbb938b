// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use crate::domain::PasswordResetToken;
use crate::error::{Error, Result};
use crate::store::PasswordResetTokenRepository;

pub const RESET_TOKEN_TTL_HOURS: i64 = 24;

/// Issues and redeems single-use password reset tokens.
#[derive(Clone)]
pub struct PasswordResetService {
    repo: Arc<dyn PasswordResetTokenRepository>,
}

impl PasswordResetService {
    pub fn new(repo: Arc<dyn PasswordResetTokenRepository>) -> Self {
        Self { repo }
    }

    /// New 64-char hex token valid for 24 hours.
    pub async fn issue(&self, user_id: i64) -> Result<PasswordResetToken> {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        let now = Utc::now();
        let token = self
            .repo
            .create_reset_token(PasswordResetToken {
                id: 0,
                user_id,
                token: hex::encode(bytes),
                expires_at: now + Duration::hours(RESET_TOKEN_TTL_HOURS),
                used: false,
                created_at: now,
            })
            .await?;
        info!(user_id, "Password reset token issued");
        Ok(token)
    }

    /// Marks the token used and returns its user id.
    pub async fn consume(&self, token: &str) -> Result<i64> {
        let row = match self.repo.get_reset_token(token.trim()).await {
            Ok(row) => row,
            Err(Error::NotFound(_)) => return Err(Error::Unauthorized("invalid token".into())),
            Err(e) => return Err(e),
        };
        if row.used || row.expires_at <= Utc::now() {
            return Err(Error::Unauthorized("token expired".into()));
        }
        if !self.repo.mark_reset_token_used(row.id).await? {
            return Err(Error::Unauthorized("token expired".into()));
        }
        Ok(row.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_token_is_single_use() {
        let svc = PasswordResetService::new(Arc::new(MemoryStore::new()));
        let token = svc.issue(5).await.unwrap();
        assert_eq!(token.token.len(), 64);
        assert_eq!(svc.consume(&token.token).await.unwrap(), 5);
        assert!(matches!(
            svc.consume(&token.token).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            svc.consume("deadbeef").await,
            Err(Error::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let repo = Arc::new(MemoryStore::new());
        let past = Utc::now() - Duration::hours(25);
        repo.create_reset_token(PasswordResetToken {
            id: 0,
            user_id: 1,
            token: "old".into(),
            expires_at: past + Duration::hours(RESET_TOKEN_TTL_HOURS),
            used: false,
            created_at: past,
        })
        .await
        .unwrap();
        let svc = PasswordResetService::new(repo);
        assert!(matches!(svc.consume("old").await, Err(Error::Unauthorized(_))));
    }
}
