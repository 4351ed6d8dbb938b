// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning and lifecycle engine.

mod engine;
mod lifecycle;

pub use engine::{DEFAULT_WATCHDOG_MINUTES, ProvisioningConfig, ProvisioningEngine};
pub use lifecycle::{DEFAULT_AUTO_DELETE_DAYS, DEFAULT_REMINDER_DAYS, EmergencyRenewPolicy};
