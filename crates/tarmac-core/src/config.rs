// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Tarmac Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Listen address for the agent-facing and admin HTTP API
    pub api_addr: SocketAddr,
    /// Expected interval between agent heartbeats
    pub ping_interval: Duration,
    /// Secret used to sign per-job tokens
    pub job_token_secret: String,
    /// Optional site-admin bearer token for the admin API
    pub site_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TARMAC_DATABASE_URL`: PostgreSQL connection string
    /// - `TARMAC_JOB_TOKEN_SECRET`: signing secret for job tokens
    ///
    /// Optional (with defaults):
    /// - `TARMAC_API_PORT`: HTTP API port (default: 8080)
    /// - `TARMAC_PING_INTERVAL_SECS`: agent heartbeat interval (default: 30)
    /// - `TARMAC_SITE_TOKEN`: site-admin bearer token (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TARMAC_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TARMAC_DATABASE_URL"))?;

        let job_token_secret = std::env::var("TARMAC_JOB_TOKEN_SECRET")
            .map_err(|_| ConfigError::Missing("TARMAC_JOB_TOKEN_SECRET"))?;

        let api_port: u16 = std::env::var("TARMAC_API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TARMAC_API_PORT", "must be a valid port number"))?;

        let ping_interval_secs: u64 = std::env::var("TARMAC_PING_INTERVAL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TARMAC_PING_INTERVAL_SECS", "must be a positive integer")
            })?;

        let site_token = std::env::var("TARMAC_SITE_TOKEN").ok();

        Ok(Self {
            database_url,
            api_addr: SocketAddr::from(([0, 0, 0, 0], api_port)),
            ping_interval: Duration::from_secs(ping_interval_secs),
            job_token_secret,
            site_token,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
