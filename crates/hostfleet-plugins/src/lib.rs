// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostfleet Plugins - out-of-process plugin host
//!
//! Payment gateways, KYC providers, SMS senders and VPS automation drivers
//! run as separate executables. This crate installs them, launches one
//! process per configured instance, supervises those processes and exposes
//! them to `hostfleet-core` through its capability traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            hostfleet-core                               │
//! │   PaymentProviderRegistry  KycProviderRegistry  SmsSender  Automation   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     hostfleet-plugins (This Crate)                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Registry / │  │ PluginHost  │  │ Supervisor  │  │   Payment   │     │
//! │  │   Clients   │  │ load/config │  │   health    │  │   Watcher   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │                    Launcher ─► PluginConnection                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ stdio frames
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │          plugins/<category>/<plugin_id>/  (one child per instance)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Plugin directory
//!
//! | File | Purpose |
//! |------|---------|
//! | `manifest.json` | id, name, version, entry points, capabilities |
//! | `manifest.sig` | Ed25519 signature over the manifest and entry files |
//! | `<entry>` | Executable for the current `os/arch` |
//!
//! Packages are signed by an official key, unsigned (`untrusted`) or signed
//! by an unknown key (`community`). Unsigned uploads are rejected unless the
//! install policy allows them.

pub mod clients;
pub mod connection;
pub mod disk;
pub mod entry;
pub mod error;
pub mod host;
pub mod install;
pub mod launcher;
pub mod registry;
pub mod resolver;
pub mod signature;
pub mod watcher;

pub use clients::{
    AutomationPluginClient, KycPluginProvider, PaymentPluginProvider, PluginKycRegistry,
    PluginSmsSender,
};
pub use connection::PluginConnection;
pub use error::{PluginError, Result};
pub use host::{PluginHost, PluginHostConfig, PluginListing, PluginSupervisor, SupervisorConfig};
pub use install::InstallPolicy;
pub use launcher::{Launcher, MockLauncher, ProcessLauncher};
pub use registry::PluginPaymentRegistry;
pub use resolver::PluginAutomationResolver;
pub use signature::OfficialKeys;
pub use watcher::{PaymentPluginWatcher, WatcherConfig};
