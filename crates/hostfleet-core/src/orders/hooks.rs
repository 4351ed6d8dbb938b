// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callbacks the order pipeline makes into the tier engine and the
//! real-name gate. Both default to doing nothing.

use async_trait::async_trait;

use crate::domain::TierPriceCache;
use crate::error::Result;

/// Action names checked by [`ActionGate::require_action`].
pub mod actions {
    pub const PURCHASE_VPS: &str = "purchase_vps";
    pub const RENEW_VPS: &str = "renew_vps";
    pub const RESIZE_VPS: &str = "resize_vps";
}

#[async_trait]
pub trait TierHooks: Send + Sync {
    /// Tier prices of a package for the user. `None` means list prices.
    async fn package_pricing(&self, _user_id: i64, _package_id: i64) -> Result<Option<TierPriceCache>> {
        Ok(None)
    }

    /// Whether zero-amount orders of the user skip review.
    async fn auto_approve(&self, _user_id: i64) -> Result<bool> {
        Ok(false)
    }

    /// Called after an order of the user was paid.
    async fn on_order_paid(&self, _user_id: i64) {}
}

/// [`TierHooks`] without a tier engine behind it.
pub struct NoopTierHooks;

#[async_trait]
impl TierHooks for NoopTierHooks {}

#[async_trait]
pub trait ActionGate: Send + Sync {
    /// `RealNameRequired` when the user may not perform `action` yet.
    async fn require_action(&self, _user_id: i64, _action: &str) -> Result<()> {
        Ok(())
    }
}

/// [`ActionGate`] that lets everything through.
pub struct OpenGate;

#[async_trait]
impl ActionGate for OpenGate {}
