// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tarmac-core.
//!
//! [`Runtime`] wires the store, brokers, orchestrator service, control
//! loops and log proxy together and runs them as tokio tasks, so the
//! orchestrator can be embedded into an existing application or run
//! standalone by the binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tarmac_core::run::NullPhaseClient;
//! use tarmac_core::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let runtime = Runtime::builder()
//!         .pool(pool)
//!         .job_token_secret("secret")
//!         .phases(Arc::new(NullPhaseClient))
//!         .api_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::agent::Agent;
use crate::allocator::Allocator;
use crate::api::{self, ApiState};
use crate::error::CoreError;
use crate::job::{Job, JobSpec};
use crate::logs::{Chunk, LogsProxy};
use crate::manager::Manager;
use crate::pool::Pool;
use crate::pubsub::{Action, Broker, Fetcher, Listener};
use crate::run::PhaseClient;
use crate::service::{Service, ServiceOptions};
use crate::store::Db;
use crate::token::TokenFactory;

/// Default expected interval between agent heartbeats.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Notification fetchers
// ============================================================================

struct PoolFetcher(Db);

#[async_trait]
impl Fetcher<Pool> for PoolFetcher {
    async fn fetch(&self, id: &str, action: Action) -> crate::error::Result<Pool> {
        let pool_id = parse_id(id)?;
        match action {
            Action::Delete => Ok(Pool::skeleton(pool_id)),
            _ => self.0.get_pool(pool_id).await,
        }
    }
}

struct AgentFetcher(Db);

#[async_trait]
impl Fetcher<Agent> for AgentFetcher {
    async fn fetch(&self, id: &str, action: Action) -> crate::error::Result<Agent> {
        let agent_id = parse_id(id)?;
        match action {
            Action::Delete => Ok(Agent::skeleton(agent_id)),
            _ => self.0.get_agent(agent_id).await,
        }
    }
}

struct JobFetcher(Db);

#[async_trait]
impl Fetcher<Job> for JobFetcher {
    async fn fetch(&self, id: &str, action: Action) -> crate::error::Result<Job> {
        let spec: JobSpec = id.parse()?;
        match action {
            Action::Delete => Ok(Job::skeleton(spec)),
            _ => self.0.get_job(&spec).await,
        }
    }
}

struct ChunkFetcher(Db);

#[async_trait]
impl Fetcher<Chunk> for ChunkFetcher {
    async fn fetch(&self, id: &str, action: Action) -> crate::error::Result<Chunk> {
        let chunk_id = parse_id(id)?;
        match action {
            // chunks are append-only; a delete carries nothing to cache
            Action::Delete => Err(CoreError::ResourceNotFound {
                resource: "chunk",
                id: id.to_string(),
            }),
            _ => self.0.get_chunk(chunk_id).await,
        }
    }
}

fn parse_id(id: &str) -> crate::error::Result<Uuid> {
    id.parse().map_err(|_| CoreError::InvalidArgument {
        field: "id",
        message: format!("malformed notification id '{id}'"),
    })
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder {
    pool: Option<PgPool>,
    phases: Option<Arc<dyn PhaseClient>>,
    job_token_secret: Option<String>,
    ping_interval: Duration,
    manager_timeouts: Option<(Duration, Duration)>,
    api_addr: Option<SocketAddr>,
    site_token: Option<String>,
    run_allocator: bool,
    run_manager: bool,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("pool", &self.pool.as_ref().map(|_| "..."))
            .field("ping_interval", &self.ping_interval)
            .field("api_addr", &self.api_addr)
            .field("run_allocator", &self.run_allocator)
            .field("run_manager", &self.run_manager)
            .finish()
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            pool: None,
            phases: None,
            job_token_secret: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            manager_timeouts: None,
            api_addr: None,
            site_token: None,
            run_allocator: true,
            run_manager: true,
        }
    }
}

impl RuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database connection pool (required).
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the run-service phase client (required).
    pub fn phases(mut self, phases: Arc<dyn PhaseClient>) -> Self {
        self.phases = Some(phases);
        self
    }

    /// Set the job-token signing secret (required).
    pub fn job_token_secret(mut self, secret: impl Into<String>) -> Self {
        self.job_token_secret = Some(secret.into());
        self
    }

    /// Set the expected agent heartbeat interval.
    ///
    /// Default: 30 seconds.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Override the manager's `unknown`/`errored` grace periods.
    ///
    /// Default: 3x and 10x the ping interval.
    pub fn manager_timeouts(mut self, unknown_after: Duration, errored_after: Duration) -> Self {
        self.manager_timeouts = Some((unknown_after, errored_after));
        self
    }

    /// Serve the HTTP API on this address. Without it no API server is
    /// started.
    pub fn api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    /// Accept this bearer token as the site admin on admin routes.
    pub fn site_token(mut self, site_token: Option<String>) -> Self {
        self.site_token = site_token;
        self
    }

    /// Enable or disable the allocator loop for this process's
    /// deployment role.
    ///
    /// Default: enabled.
    pub fn run_allocator(mut self, run: bool) -> Self {
        self.run_allocator = run;
        self
    }

    /// Enable or disable the manager loop for this process's deployment
    /// role.
    ///
    /// Default: enabled.
    pub fn run_manager(mut self, run: bool) -> Self {
        self.run_manager = run;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RuntimeConfig> {
        let pool = self.pool.ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        let phases = self
            .phases
            .ok_or_else(|| anyhow::anyhow!("phases client is required"))?;
        let job_token_secret = self
            .job_token_secret
            .ok_or_else(|| anyhow::anyhow!("job token secret is required"))?;
        Ok(RuntimeConfig {
            pool,
            phases,
            job_token_secret,
            ping_interval: self.ping_interval,
            manager_timeouts: self.manager_timeouts,
            api_addr: self.api_addr,
            site_token: self.site_token,
            run_allocator: self.run_allocator,
            run_manager: self.run_manager,
        })
    }
}

/// Configuration for a [`Runtime`].
pub struct RuntimeConfig {
    pool: PgPool,
    phases: Arc<dyn PhaseClient>,
    job_token_secret: String,
    ping_interval: Duration,
    manager_timeouts: Option<(Duration, Duration)>,
    api_addr: Option<SocketAddr>,
    site_token: Option<String>,
    run_allocator: bool,
    run_manager: bool,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("pool", &self.pool)
            .field("job_token_secret", &self.job_token_secret)
            .field("ping_interval", &self.ping_interval)
            .field("manager_timeouts", &self.manager_timeouts)
            .field("api_addr", &self.api_addr)
            .field("site_token", &self.site_token)
            .field("run_allocator", &self.run_allocator)
            .field("run_manager", &self.run_manager)
            .finish()
    }
}

impl RuntimeConfig {
    /// Start the runtime, spawning the notification listener, the
    /// enabled control loops, the log proxy, and the API server.
    pub async fn start(self) -> Result<Runtime> {
        let db = Db::new(self.pool.clone());
        let tokens = TokenFactory::new(self.job_token_secret);

        let pool_broker = Broker::new("agent_pools", Arc::new(PoolFetcher(db.clone())));
        let agent_broker = Broker::new("agents", Arc::new(AgentFetcher(db.clone())));
        let job_broker = Broker::new("jobs", Arc::new(JobFetcher(db.clone())));
        let chunk_broker = Broker::new("logs", Arc::new(ChunkFetcher(db.clone())));

        let mut listener = Listener::new(self.pool.clone());
        listener.register("agent_pools", Arc::new(pool_broker.clone()));
        listener.register("agents", Arc::new(agent_broker.clone()));
        listener.register("jobs", Arc::new(job_broker.clone()));
        listener.register("logs", Arc::new(chunk_broker.clone()));

        let service = Arc::new(Service::new(ServiceOptions {
            db: db.clone(),
            tokens,
            phases: self.phases,
            pool_broker,
            agent_broker,
            job_broker,
        }));
        let logs = Arc::new(LogsProxy::new(Arc::new(db.clone()), chunk_broker));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        handles.push(tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move {
                if let Err(err) = listener.start(shutdown_rx).await {
                    error!(error = %err, "notification listener exited");
                }
            }
        }));

        handles.push(tokio::spawn({
            let logs = logs.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move { logs.start(shutdown_rx).await }
        }));

        if self.run_allocator {
            handles.push(tokio::spawn({
                let allocator = Allocator::new(service.clone());
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    if let Err(err) = allocator.start(shutdown_rx).await {
                        error!(error = %err, "allocator exited");
                    }
                }
            }));
        }

        if self.run_manager {
            let manager = match self.manager_timeouts {
                Some((unknown_after, errored_after)) => Manager::with_timeouts(
                    service.clone(),
                    self.ping_interval,
                    unknown_after,
                    errored_after,
                ),
                None => Manager::new(service.clone(), self.ping_interval),
            };
            handles.push(tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    if let Err(err) = manager.start(shutdown_rx).await {
                        error!(error = %err, "manager exited");
                    }
                }
            }));
        }

        if let Some(addr) = self.api_addr {
            let router = api::router(ApiState {
                service: service.clone(),
                logs: logs.clone(),
                site_token: self.site_token,
            });
            let tcp = tokio::net::TcpListener::bind(addr).await?;
            let local_addr = tcp.local_addr()?;
            let mut shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                };
                if let Err(err) = axum::serve(tcp, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(error = %err, "api server exited");
                }
            }));
            info!(addr = %local_addr, "api server started");
        }

        info!("runtime started");
        Ok(Runtime {
            service,
            logs,
            shutdown_tx,
            handles,
        })
    }
}

/// A running orchestrator that can be embedded in an application.
pub struct Runtime {
    service: Arc<Service>,
    logs: Arc<LogsProxy>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The orchestrator service.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// The log-chunk caching proxy.
    pub fn logs(&self) -> &Arc<LogsProxy> {
        &self.logs
    }

    /// Gracefully shut down every worker and wait for them to finish.
    pub async fn shutdown(self) {
        info!("runtime shutting down...");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task panicked during shutdown");
            }
        }
        info!("runtime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::NullPhaseClient;

    #[test]
    fn builder_requires_pool_phases_and_secret() {
        let err = RuntimeBuilder::new().build();
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("pool is required"));
    }

    #[test]
    fn builder_defaults() {
        let builder = RuntimeBuilder::new();
        assert_eq!(builder.ping_interval, DEFAULT_PING_INTERVAL);
        assert!(builder.run_allocator);
        assert!(builder.run_manager);
        assert!(builder.api_addr.is_none());
    }

    #[test]
    fn builder_chains() {
        let builder = RuntimeBuilder::new()
            .job_token_secret("secret")
            .phases(Arc::new(NullPhaseClient))
            .ping_interval(Duration::from_secs(5))
            .run_allocator(false)
            .run_manager(false);
        assert_eq!(builder.ping_interval, Duration::from_secs(5));
        assert!(!builder.run_allocator);
        assert!(!builder.run_manager);
        // still missing the pool
        assert!(builder.build().is_err());
    }
}
