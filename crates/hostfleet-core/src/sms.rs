// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound SMS.

use async_trait::async_trait;
use hostfleet_protocol::messages::SmsSendRequest;

use crate::error::Result;

/// Delivers text messages. Returns the provider's message id.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, message: SmsSendRequest) -> Result<String>;
}
