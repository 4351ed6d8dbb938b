// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostfleet Server - process wiring
//!
//! Loads [`config::Config`] from the environment, opens the store and
//! starts a [`runtime::HostfleetRuntime`]: the plugin host with its health
//! supervisor, the task scheduler and the payment plugin watcher.

pub mod config;
pub mod runtime;

pub use config::{Config, ConfigError};
pub use runtime::{HostfleetRuntime, HostfleetRuntimeBuilder, Services, open_store};
