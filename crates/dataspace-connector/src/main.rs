// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dataspace Connector
//!
//! Runs the data-plane instance manager against the configured store. The
//! transfer and negotiation managers need a protocol dispatcher and are
//! started by applications embedding [`ConnectorRuntime`].

use std::sync::Arc;

use tracing::{info, warn};

use dataspace_connector::config::Config;
use dataspace_connector::dataplane::TcpHealthCheck;
use dataspace_connector::runtime::{ConnectorCollaborators, ConnectorRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dataspace_connector=info,dataspace_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        runtime_id = %config.runtime_id,
        database = config.database_url.as_deref().unwrap_or("in-memory"),
        batch_size = config.batch_size,
        "Starting Dataspace Connector"
    );

    let collaborators = ConnectorCollaborators {
        health_check: Some(Arc::new(TcpHealthCheck::new(config.health_check_timeout))),
        ..Default::default()
    };
    let runtime = ConnectorRuntime::start(config, collaborators).await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Dataspace Connector shut down");

    Ok(())
}
