// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Worker - fleet status service
//!
//! Connects to the worker database, applies migrations and reports the
//! running fleet's load until interrupted.

use std::sync::Arc;
use tracing::{info, warn};

use hangar_worker::client::MockWorkerClients;
use hangar_worker::config::{Config, ConfigError};
use hangar_worker::lock::PostgresLockFactory;
use hangar_worker::migrations;
use hangar_worker::persistence::PostgresPersistence;
use hangar_worker::runtime::HangarRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hangar_worker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    let database_url = config
        .database_url
        .clone()
        .ok_or(ConfigError::MissingEnvVar("HANGAR_DATABASE_URL"))?;

    info!(
        strategies = ?config.placement.strategies,
        compression = %config.streaming.compression,
        p2p_enabled = config.streaming.p2p_enabled,
        "Starting Hangar Worker"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    info!("Connected to database");

    migrations::run_postgres(&pool).await?;

    info!("Database schema verified");

    // Embedders supply wire clients for the runtime and volume store. The
    // standalone service only reads worker records, so in-memory clients
    // stand in for them.
    let clients = Arc::new(MockWorkerClients::new());

    let runtime = HangarRuntime::builder()
        .persistence(Arc::new(PostgresPersistence::new(pool.clone())))
        .clients(clients)
        .locks(Arc::new(PostgresLockFactory::new(pool)))
        .config(config)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Hangar Worker shut down");

    Ok(())
}
