// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tarmac Core - Agent and Job Orchestration
//!
//! Standalone orchestrator process: runs the notification listener, the
//! allocator and manager loops, the log proxy and the HTTP API. The run
//! and workspace services live in the surrounding platform; deployments
//! embedding this binary alongside them wire a real phase client through
//! [`tarmac_core::runtime`] instead.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use tarmac_core::config::Config;
use tarmac_core::migrations;
use tarmac_core::run::NullPhaseClient;
use tarmac_core::runtime::Runtime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tarmac_core=info".parse()?),
        )
        .init();

    info!("Starting Tarmac Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        api_addr = %config.api_addr,
        ping_interval = ?config.ping_interval,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Database connection established");

    info!("Running database migrations...");
    migrations::run(&pool).await?;
    info!("Migrations completed");

    let runtime = Runtime::builder()
        .pool(pool)
        .phases(Arc::new(NullPhaseClient))
        .job_token_secret(config.job_token_secret)
        .ping_interval(config.ping_interval)
        .api_addr(config.api_addr)
        .site_token(config.site_token)
        .build()?
        .start()
        .await?;

    info!("Tarmac Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
