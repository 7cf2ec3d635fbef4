// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tarmac-core E2E tests.
//!
//! Provides a TestContext that runs the full runtime (listener,
//! allocator, optional manager, log proxy) against TEST_DATABASE_URL,
//! with a recording fake standing in for the run service.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use tarmac_core::agent::{Agent, RegisterAgentOptions};
use tarmac_core::error::Result;
use tarmac_core::pool::{CreatePoolOptions, Pool};
use tarmac_core::run::{Phase, PhaseClient, Run, RunId};
use tarmac_core::runtime::Runtime;
use tarmac_core::service::Service;
use tarmac_core::store::Db;
use tarmac_core::subject::Subject;
use tarmac_core::token::CreateAgentTokenOptions;
use tarmac_core::workspace::WorkspaceId;

/// Serializes E2E tests; they share one database.
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

pub async fn db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Phase client that records every call instead of driving a run
/// service.
#[derive(Default)]
pub struct FakePhaseClient {
    starts: Mutex<Vec<(RunId, Phase)>>,
    finishes: Mutex<Vec<(RunId, Phase, bool)>>,
    cancels: Mutex<Vec<RunId>>,
}

impl FakePhaseClient {
    pub fn starts(&self) -> Vec<(RunId, Phase)> {
        self.starts.lock().unwrap().clone()
    }

    pub fn finishes(&self) -> Vec<(RunId, Phase, bool)> {
        self.finishes.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<RunId> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseClient for FakePhaseClient {
    async fn start_phase(&self, run_id: RunId, phase: Phase) -> Result<()> {
        self.starts.lock().unwrap().push((run_id, phase));
        Ok(())
    }

    async fn finish_phase(&self, run_id: RunId, phase: Phase, errored: bool) -> Result<()> {
        self.finishes.lock().unwrap().push((run_id, phase, errored));
        Ok(())
    }

    async fn cancel(&self, run_id: RunId) -> Result<()> {
        self.cancels.lock().unwrap().push(run_id);
        Ok(())
    }
}

/// Test context that manages the database and a running orchestrator.
pub struct TestContext {
    pub pool: PgPool,
    pub db: Db,
    pub runtime: Runtime,
    pub phases: Arc<FakePhaseClient>,
    pub user: Subject,
}

impl TestContext {
    /// Create a context with the manager disabled, so agents do not have
    /// to heartbeat during the test.
    pub async fn new() -> Option<Self> {
        Self::build(false).await
    }

    /// Create a context with the manager enabled on tight timeouts, for
    /// heartbeat-timeout tests.
    pub async fn new_with_manager() -> Option<Self> {
        Self::build(true).await
    }

    async fn build(run_manager: bool) -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        tarmac_core::migrations::run(&pool).await.ok()?;
        wipe(&pool).await;

        let phases = Arc::new(FakePhaseClient::default());
        let runtime = Runtime::builder()
            .pool(pool.clone())
            .phases(phases.clone())
            .job_token_secret("e2e-signing-secret")
            .ping_interval(Duration::from_millis(100))
            .manager_timeouts(Duration::from_millis(300), Duration::from_millis(700))
            .run_manager(run_manager)
            .build()
            .ok()?
            .start()
            .await
            .ok()?;

        // give the notification listener a beat to attach
        tokio::time::sleep(Duration::from_millis(100)).await;

        Some(Self {
            db: Db::new(pool.clone()),
            pool,
            runtime,
            phases,
            user: Subject::User {
                username: "e2e".to_string(),
            },
        })
    }

    pub fn service(&self) -> &Arc<Service> {
        self.runtime.service()
    }

    /// Create an organization-scoped pool plus an agent token for it.
    pub async fn create_pool_and_token(&self, organization: &str) -> (Pool, String) {
        let pool = self
            .service()
            .create_agent_pool(
                &self.user,
                CreatePoolOptions {
                    name: "default".to_string(),
                    organization: organization.to_string(),
                    organization_scoped: true,
                    allowed_workspaces: Vec::new(),
                },
            )
            .await
            .expect("failed to create pool");
        let (_, secret) = self
            .service()
            .create_agent_token(
                &self.user,
                pool.id,
                CreateAgentTokenOptions {
                    description: "e2e".to_string(),
                },
            )
            .await
            .expect("failed to create agent token");
        (pool, secret)
    }

    /// Register a pool agent with the given token and return it together
    /// with its registered subject.
    pub async fn register_pool_agent(&self, secret: &str, concurrency: i32) -> (Agent, Subject) {
        let unregistered = self
            .service()
            .authenticate_agent_token(secret, None)
            .await
            .expect("failed to authenticate agent token");
        let agent = self
            .service()
            .register_agent(
                &unregistered,
                RegisterAgentOptions {
                    version: "e2e".to_string(),
                    concurrency,
                    ip_address: None,
                    agent_pool_id: None,
                },
            )
            .await
            .expect("failed to register agent");
        let registered = self
            .service()
            .authenticate_agent_token(secret, Some(agent.id))
            .await
            .expect("failed to upgrade agent subject");
        (agent, registered)
    }

    /// A run in the given organization and pool, ready to enqueue.
    pub fn run(&self, organization: &str, pool: &Pool, workspace_id: WorkspaceId) -> Run {
        Run {
            id: Uuid::new_v4(),
            phase: Phase::Plan,
            workspace_id,
            organization: organization.to_string(),
            agent_pool_id: Some(pool.id),
            force_canceled: false,
        }
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}

/// Poll a probe until it passes or the deadline expires.
pub async fn wait_for<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn wipe(pool: &PgPool) {
    for table in [
        "logs",
        "jobs",
        "agent_tokens",
        "agents",
        "agent_pool_assigned_workspaces",
        "agent_pool_allowed_workspaces",
        "agent_pools",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(pool)
            .await
            .ok();
    }
}
