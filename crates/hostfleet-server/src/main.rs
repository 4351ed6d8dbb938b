// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostfleet Server
//!
//! Runs the back-end core of the VPS platform:
//! - Plugin host (payment, KYC, SMS and automation plugins)
//! - Scheduled tasks (provisioning watchdog, expiry handling, KYC polling)
//! - Payment plugin directory watcher

use tracing::{info, warn};

use hostfleet_server::config::Config;
use hostfleet_server::runtime::{HostfleetRuntime, open_store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostfleet_server=info,hostfleet_core=info,hostfleet_plugins=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        plugins_dir = %config.plugins_dir.display(),
        memory_store = config.uses_memory_store(),
        official_keys = config.install_policy.official_keys.len(),
        allow_unsigned = config.install_policy.allow_unsigned,
        "Starting Hostfleet"
    );

    let store = open_store(&config.database_url).await?;
    info!("Store ready");

    let runtime = HostfleetRuntime::builder()
        .config(&config)
        .store(store)
        .build()?
        .start()
        .await?;

    info!("Hostfleet ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Hostfleet shut down");

    Ok(())
}
