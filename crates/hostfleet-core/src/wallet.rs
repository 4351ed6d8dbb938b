// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use tracing::info;

use crate::domain::{Wallet, WalletAdjustment};
use crate::error::{Error, Result};
use crate::store::WalletRepository;

/// Ledger reference types.
pub mod refs {
    pub const ORDER: &str = "order";
    pub const REFUND_ORDER: &str = "refund_order";
    pub const RESIZE_CREDIT: &str = "resize_credit";
}

/// Balance changes keyed by `(ref_type, ref_id)`.
#[derive(Clone)]
pub struct WalletService {
    repo: Arc<dyn WalletRepository>,
}

impl WalletService {
    pub fn new(repo: Arc<dyn WalletRepository>) -> Self {
        Self { repo }
    }

    pub async fn balance(&self, user_id: i64) -> Result<i64> {
        Ok(self.repo.get_wallet(user_id).await?.balance)
    }

    /// Take `amount` from the wallet. `InsufficientBalance` leaves it untouched.
    pub async fn debit(
        &self,
        user_id: i64,
        amount: i64,
        ref_type: &str,
        ref_id: i64,
        note: &str,
    ) -> Result<Wallet> {
        if amount < 0 {
            return Err(Error::invalid("debit amount must not be negative"));
        }
        let wallet = self
            .repo
            .adjust_wallet_balance(WalletAdjustment {
                user_id,
                amount: -amount,
                tx_type: "debit".to_string(),
                ref_type: ref_type.to_string(),
                ref_id,
                note: note.to_string(),
            })
            .await?;
        info!(user_id, amount, ref_type, ref_id, "Wallet debited");
        Ok(wallet)
    }

    /// Credit once per reference. Returns false if it was already applied.
    pub async fn credit_once(
        &self,
        user_id: i64,
        amount: i64,
        ref_type: &str,
        ref_id: i64,
        note: &str,
    ) -> Result<bool> {
        if amount < 0 {
            return Err(Error::invalid("credit amount must not be negative"));
        }
        if self.repo.has_wallet_transaction(ref_type, ref_id).await? {
            return Ok(false);
        }
        let result = self
            .repo
            .adjust_wallet_balance(WalletAdjustment {
                user_id,
                amount,
                tx_type: "credit".to_string(),
                ref_type: ref_type.to_string(),
                ref_id,
                note: note.to_string(),
            })
            .await;
        match result {
            Ok(_) => {
                info!(user_id, amount, ref_type, ref_id, "Wallet credited");
                Ok(true)
            }
            Err(Error::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
