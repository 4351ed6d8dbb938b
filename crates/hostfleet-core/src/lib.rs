// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! hostfleet core
//!
//! Domain model and services of the hostfleet VPS reseller back end:
//!
//! - [`store`]: repository traits with in-memory and SQLite backends
//! - [`orders`]: cart to paid order pipeline with coupons, tier prices and
//!   balance or gateway payments
//! - [`provisioning`]: provision jobs, resize tasks and the instance lifecycle
//! - [`events`]: per-order event log with SSE replay, webhook robots and push
//! - [`kyc`], [`tier`], [`scheduler`], [`retention`]
//!
//! Plugins reach the core through the capability traits in [`automation`],
//! [`payment`], [`kyc`] and [`sms`]; the plugin host lives in
//! `hostfleet-plugins`.

#[macro_use]
pub mod domain;

pub mod automation;
pub mod error;
pub mod events;
pub mod kyc;
pub mod locks;
pub mod money;
pub mod orders;
pub mod payment;
pub mod provisioning;
pub mod retention;
pub mod scheduler;
pub mod secrets;
pub mod settings;
pub mod sms;
pub mod store;
pub mod tier;
pub mod wallet;

pub use error::{Error, Result};
pub use store::Store;
