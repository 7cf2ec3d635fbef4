// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The orchestrator service.
//!
//! Aggregates the store, brokers and token factory behind the contract
//! consumed by remote agents, by the admin API, and by the run and
//! workspace services. Every operation takes the caller's [`Subject`]
//! and authorizes it before touching state.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::agent::{Agent, AgentId, AgentStatus, RegisterAgentOptions};
use crate::error::{CoreError, Result};
use crate::job::{Job, JobSpec, JobStatus};
use crate::pool::{CreatePoolOptions, Pool, PoolId, UpdatePoolOptions};
use crate::pubsub::{Broker, Event, Subscription};
use crate::run::{PhaseClient, Run};
use crate::store::{agents, jobs, Db};
use crate::subject::{OrganizationAuthorizer, Subject};
use crate::token::{self, AgentToken, CreateAgentTokenOptions, TokenFactory, TokenId};
use crate::workspace::Workspace;

use serde::Deserialize;

/// Everything needed to construct a [`Service`].
pub struct ServiceOptions {
    /// Database handle.
    pub db: Db,
    /// Token factory.
    pub tokens: TokenFactory,
    /// Client for the run service's phase contract.
    pub phases: Arc<dyn PhaseClient>,
    /// Broker for pool change events.
    pub pool_broker: Broker<Pool>,
    /// Broker for agent change events.
    pub agent_broker: Broker<Agent>,
    /// Broker for job change events.
    pub job_broker: Broker<Job>,
}

/// Outcome an agent reports when finishing a job.
#[derive(Debug, Clone, Deserialize)]
pub struct FinishJobOptions {
    /// Terminal status of the job.
    pub status: JobStatus,
    /// Error message, when the job errored.
    #[serde(default)]
    pub error: Option<String>,
}

/// The orchestrator service.
pub struct Service {
    db: Db,
    organization: OrganizationAuthorizer,
    tokens: TokenFactory,
    phases: Arc<dyn PhaseClient>,
    pool_broker: Broker<Pool>,
    agent_broker: Broker<Agent>,
    job_broker: Broker<Job>,
}

impl Service {
    /// Construct the service.
    pub fn new(opts: ServiceOptions) -> Self {
        Self {
            db: opts.db,
            organization: OrganizationAuthorizer,
            tokens: opts.tokens,
            phases: opts.phases,
            pool_broker: opts.pool_broker,
            agent_broker: opts.agent_broker,
            job_broker: opts.job_broker,
        }
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    // ========================================================================
    // Agent pools
    // ========================================================================

    /// Create an agent pool in the subject's organization.
    #[instrument(skip(self, opts), fields(organization = %opts.organization))]
    pub async fn create_agent_pool(
        &self,
        subject: &Subject,
        opts: CreatePoolOptions,
    ) -> Result<Pool> {
        self.organization.can_access(subject, &opts.organization)?;
        let pool = Pool::new(opts)?;
        self.db.create_pool(&pool).await?;
        info!(%subject, pool_id = %pool.id, name = %pool.name, "created agent pool");
        Ok(pool)
    }

    /// Retrieve an agent pool.
    pub async fn get_agent_pool(&self, subject: &Subject, pool_id: PoolId) -> Result<Pool> {
        let pool = self.db.get_pool(pool_id).await?;
        self.organization.can_access(subject, &pool.organization)?;
        Ok(pool)
    }

    /// List the agent pools in an organization.
    pub async fn list_agent_pools(&self, subject: &Subject, organization: &str) -> Result<Vec<Pool>> {
        self.organization.can_access(subject, organization)?;
        self.db.list_pools(Some(organization)).await
    }

    /// Update an agent pool.
    #[instrument(skip(self, opts), fields(pool_id = %pool_id))]
    pub async fn update_agent_pool(
        &self,
        subject: &Subject,
        pool_id: PoolId,
        opts: UpdatePoolOptions,
    ) -> Result<Pool> {
        let authorizer = self.organization;
        let pool = self
            .db
            .update_pool(pool_id, |pool| {
                authorizer.can_access(subject, &pool.organization)?;
                pool.update(opts)
            })
            .await?;
        info!(%subject, pool_id = %pool.id, "updated agent pool");
        Ok(pool)
    }

    /// Delete an agent pool, provided no workspace still references it.
    #[instrument(skip(self), fields(pool_id = %pool_id))]
    pub async fn delete_agent_pool(&self, subject: &Subject, pool_id: PoolId) -> Result<Pool> {
        let pool = self.db.get_pool(pool_id).await?;
        self.organization.can_access(subject, &pool.organization)?;
        // friendlier than surfacing the foreign-key error the delete
        // would raise
        if !pool.assigned_workspaces.is_empty() {
            return Err(CoreError::PoolReferencedByWorkspaces);
        }
        self.db.delete_pool(pool_id).await?;
        info!(%subject, pool_id = %pool.id, "deleted agent pool");
        Ok(pool)
    }

    // ========================================================================
    // Agent tokens
    // ========================================================================

    /// Mint an agent token for a pool. The plaintext secret is returned
    /// exactly once.
    #[instrument(skip(self, opts), fields(pool_id = %pool_id))]
    pub async fn create_agent_token(
        &self,
        subject: &Subject,
        pool_id: PoolId,
        opts: CreateAgentTokenOptions,
    ) -> Result<(AgentToken, String)> {
        let pool = self.db.get_pool(pool_id).await?;
        self.organization.can_access(subject, &pool.organization)?;
        let (agent_token, secret) = self.tokens.new_agent_token(pool_id, opts)?;
        self.db
            .create_agent_token(&agent_token, &token::hash_secret(&secret))
            .await?;
        info!(%subject, token_id = %agent_token.id, "created agent token");
        Ok((agent_token, secret))
    }

    /// Retrieve an agent token's metadata.
    pub async fn get_agent_token(&self, subject: &Subject, token_id: TokenId) -> Result<AgentToken> {
        let agent_token = self.db.get_agent_token(token_id).await?;
        let pool = self.db.get_pool(agent_token.agent_pool_id).await?;
        self.organization.can_access(subject, &pool.organization)?;
        Ok(agent_token)
    }

    /// List the tokens minted for a pool.
    pub async fn list_agent_tokens(
        &self,
        subject: &Subject,
        pool_id: PoolId,
    ) -> Result<Vec<AgentToken>> {
        let pool = self.db.get_pool(pool_id).await?;
        self.organization.can_access(subject, &pool.organization)?;
        self.db.list_agent_tokens(pool_id).await
    }

    /// Delete an agent token, revoking its secret.
    #[instrument(skip(self), fields(token_id = %token_id))]
    pub async fn delete_agent_token(
        &self,
        subject: &Subject,
        token_id: TokenId,
    ) -> Result<AgentToken> {
        let agent_token = self.db.get_agent_token(token_id).await?;
        let pool = self.db.get_pool(agent_token.agent_pool_id).await?;
        self.organization.can_access(subject, &pool.organization)?;
        self.db.delete_agent_token(token_id).await?;
        info!(%subject, token_id = %agent_token.id, "deleted agent token");
        Ok(agent_token)
    }

    // ========================================================================
    // Watch streams
    // ========================================================================

    /// Subscribe to pool change events.
    pub fn watch_agent_pools(&self) -> Subscription<Pool> {
        self.pool_broker.subscribe()
    }

    /// Subscribe to agent change events.
    pub fn watch_agents(&self) -> Subscription<Agent> {
        self.agent_broker.subscribe()
    }

    /// Subscribe to job change events.
    pub fn watch_jobs(&self) -> Subscription<Job> {
        self.job_broker.subscribe()
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// Register an agent. The caller must be an unregistered agent
    /// subject; pool membership comes from the token the agent
    /// authenticated with.
    #[instrument(skip(self, opts))]
    pub async fn register_agent(
        &self,
        subject: &Subject,
        mut opts: RegisterAgentOptions,
    ) -> Result<Agent> {
        match subject {
            Subject::UnregisteredServerAgent => {}
            Subject::UnregisteredPoolAgent { pool_id, .. } => {
                opts.agent_pool_id = Some(*pool_id);
            }
            _ => return Err(CoreError::UnauthorizedAgentRegistration),
        }
        let agent = Agent::new(opts)?;
        self.db.create_agent(&agent).await?;
        info!(
            agent_id = %agent.id,
            pool_id = ?agent.agent_pool_id,
            max_jobs = agent.max_jobs,
            "registered agent"
        );
        Ok(agent)
    }

    /// Retrieve an agent.
    pub async fn get_agent(&self, agent_id: AgentId) -> Result<Agent> {
        self.db.get_agent(agent_id).await
    }

    /// Update an agent's status. Callers are the agent itself (work
    /// state, heartbeats, clean shutdown) or the manager (unknown and
    /// errored promotions).
    #[instrument(skip(self), fields(agent_id = %agent_id, to = %to))]
    pub async fn update_agent_status(
        &self,
        subject: &Subject,
        agent_id: AgentId,
        to: AgentStatus,
    ) -> Result<()> {
        let is_agent = match subject {
            Subject::Manager => false,
            other if other.is_agent(agent_id) => true,
            _ => return Err(CoreError::AccessNotPermitted),
        };

        // keep the prior status for logging
        let mut from = to;
        self.db
            .update_agent(agent_id, |agent| {
                from = agent.status;
                agent.set_status(to, is_agent)
            })
            .await?;
        if is_agent && from == to {
            debug!(agent_id = %agent_id, "received agent ping");
        } else {
            debug!(agent_id = %agent_id, from = %from, to = %to, %subject, "updated agent status");
        }
        Ok(())
    }

    /// List every agent in the fleet.
    pub async fn list_agents(&self, subject: &Subject) -> Result<Vec<Agent>> {
        self.require_admin(subject)?;
        self.db.list_agents().await
    }

    /// List the agents in a pool.
    pub async fn list_agents_by_pool(&self, subject: &Subject, pool_id: PoolId) -> Result<Vec<Agent>> {
        let pool = self.db.get_pool(pool_id).await?;
        self.organization.can_access(subject, &pool.organization)?;
        self.db.list_agents_by_pool(pool_id).await
    }

    /// Remove an agent from the fleet.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub async fn delete_agent(&self, subject: &Subject, agent_id: AgentId) -> Result<()> {
        self.require_admin(subject)?;
        self.db.delete_agent(agent_id).await?;
        debug!(agent_id = %agent_id, "deleted agent");
        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Long-poll for jobs an agent should act on: jobs allocated to it,
    /// and running jobs that were signaled to cancel. Blocks on the job
    /// stream until a match arrives or the caller goes away.
    pub async fn get_agent_jobs(&self, subject: &Subject, agent_id: AgentId) -> Result<Vec<Job>> {
        if !subject.is_agent(agent_id) {
            return Err(CoreError::AccessNotPermitted);
        }

        // subscribe before querying so nothing slips between the two
        let mut sub = self.job_broker.subscribe();
        let jobs = self.db.allocated_and_signaled_jobs(agent_id).await?;
        if !jobs.is_empty() {
            return Ok(jobs);
        }

        while let Some(event) = sub.recv().await {
            match event {
                Event::Created(job) | Event::Updated(job) => {
                    if job.agent_id != Some(agent_id) {
                        continue;
                    }
                    match job.status {
                        JobStatus::Allocated => return Ok(vec![job]),
                        JobStatus::Running if job.signaled.is_some() => return Ok(vec![job]),
                        _ => {}
                    }
                }
                Event::Resync => {
                    // events may have been missed; re-check the store
                    let jobs = self.db.allocated_and_signaled_jobs(agent_id).await?;
                    if !jobs.is_empty() {
                        return Ok(jobs);
                    }
                }
                Event::Deleted(_) => {}
            }
        }
        Ok(Vec::new())
    }

    /// Retrieve a job.
    pub async fn get_job(&self, spec: &JobSpec) -> Result<Job> {
        self.db.get_job(spec).await
    }

    /// List every job.
    pub async fn list_jobs(&self, subject: &Subject) -> Result<Vec<Job>> {
        self.require_admin(subject)?;
        self.db.list_jobs().await
    }

    /// Start a job. Only the agent the job is allocated to may call
    /// this; it receives a job token scoped to the job, and the
    /// corresponding run phase is started within the same transaction.
    #[instrument(skip(self), fields(spec = %spec))]
    pub async fn start_job(&self, subject: &Subject, spec: &JobSpec) -> Result<String> {
        let agent_id = subject.agent_id().ok_or(CoreError::AccessNotPermitted)?;

        let mut tx = self.db.begin().await?;
        let mut job = jobs::select_for_update(&mut tx, spec).await?;
        if job.agent_id != Some(agent_id) {
            return Err(CoreError::AccessNotPermitted);
        }
        job.start()?;
        // a refused phase start aborts the job transition
        self.phases.start_phase(spec.run_id, spec.phase).await?;
        jobs::persist(&mut tx, &job).await?;
        tx.commit().await?;

        let job_token = self.tokens.mint_job_token(spec)?;
        debug!(spec = %spec, agent_id = %agent_id, "started job");
        Ok(job_token)
    }

    /// Finish a job. Only the job itself (bearing its job token) may
    /// call this; the corresponding run phase is finished or the run
    /// canceled within the same transaction.
    #[instrument(skip(self, opts), fields(spec = %spec, status = %opts.status))]
    pub async fn finish_job(
        &self,
        subject: &Subject,
        spec: &JobSpec,
        opts: FinishJobOptions,
    ) -> Result<Job> {
        match subject {
            Subject::Job(own) if own == spec => {}
            _ => return Err(CoreError::AccessNotPermitted),
        }

        let mut tx = self.db.begin().await?;
        let mut job = jobs::select_for_update(&mut tx, spec).await?;
        match opts.status {
            JobStatus::Finished | JobStatus::Errored => {
                self.phases
                    .finish_phase(spec.run_id, spec.phase, opts.status == JobStatus::Errored)
                    .await?;
            }
            JobStatus::Canceled => self.phases.cancel(spec.run_id).await?,
            other => {
                return Err(CoreError::InvalidArgument {
                    field: "status",
                    message: format!("'{}' is not a terminal job status", other),
                })
            }
        }
        job.finish(opts.status)?;
        jobs::persist(&mut tx, &job).await?;
        if let Some(agent_id) = job.agent_id {
            agents::adjust_current_jobs(&mut tx, agent_id, -1).await?;
        }
        tx.commit().await?;

        match &opts.error {
            Some(job_error) => {
                debug!(spec = %spec, status = %opts.status, job_error = %job_error, "finished job with error")
            }
            None => debug!(spec = %spec, status = %opts.status, "finished job"),
        }
        Ok(job)
    }

    /// Allocate an unallocated job to an agent. Called by the allocator.
    pub(crate) async fn allocate_job(&self, spec: &JobSpec, agent_id: AgentId) -> Result<Job> {
        let allocated = self.db.allocate_job(spec, agent_id).await;
        match &allocated {
            Ok(_) => info!(spec = %spec, agent_id = %agent_id, "allocated job"),
            Err(err) => {
                error!(spec = %spec, agent_id = %agent_id, error = %err, "allocating job")
            }
        }
        allocated
    }

    /// Move a job off a dead agent. Called by the allocator.
    pub(crate) async fn reallocate_job(&self, spec: &JobSpec, agent_id: AgentId) -> Result<Job> {
        let reallocated = self.db.reallocate_job(spec, agent_id).await;
        match &reallocated {
            Ok(_) => info!(spec = %spec, to = %agent_id, "re-allocated job"),
            Err(err) => {
                error!(spec = %spec, to = %agent_id, error = %err, "re-allocating job")
            }
        }
        reallocated
    }

    // ========================================================================
    // Run and workspace service hooks
    // ========================================================================

    /// Create the job for an enqueued run phase. Invoked by the run
    /// service after enqueueing a plan or apply.
    pub async fn create_job(&self, run: &Run) -> Result<Job> {
        let job = Job::new(run);
        self.db.create_job(&job).await?;
        debug!(spec = %job.spec, "created job");
        Ok(job)
    }

    /// React to a run being canceled: signal the job when it is running,
    /// cancel it outright when it has not started. Invoked by the run
    /// service after a cancel or force-cancel.
    pub async fn cancel_job(&self, run: &Run) -> Result<()> {
        match self.db.cancel_job(run).await {
            Ok((job, Some(force))) => {
                debug!(spec = %job.spec, force, "sent cancelation signal to job");
                Ok(())
            }
            Ok((job, None)) => {
                info!(spec = %job.spec, status = %job.status, "canceled job");
                Ok(())
            }
            // no job has been created for the run yet
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                error!(run_id = %run.id, error = %err, "canceling job");
                Err(err)
            }
        }
    }

    /// Check whether a workspace may use its configured agent pool.
    /// Invoked by the workspace service before creating or updating a
    /// workspace; a failure aborts that write.
    pub async fn check_workspace_pool_access(&self, workspace: &Workspace) -> Result<()> {
        let Some(pool_id) = workspace.agent_pool_id else {
            // workspace is not using any pool
            return Ok(());
        };
        let pool = self.db.get_pool(pool_id).await?;
        if pool.allows(workspace.id) {
            Ok(())
        } else {
            Err(CoreError::WorkspaceNotAllowedToUsePool)
        }
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Resolve an agent token secret to its subject. Registered agents
    /// also send their ID in a header, upgrading them from the
    /// unregistered subject.
    pub async fn authenticate_agent_token(
        &self,
        secret: &str,
        agent_id: Option<AgentId>,
    ) -> Result<Subject> {
        let agent_token = self
            .db
            .get_agent_token_by_secret_hash(&token::hash_secret(secret))
            .await?;
        match agent_id {
            Some(agent_id) => {
                let agent = self.db.get_agent(agent_id).await?;
                Ok(Subject::PoolAgent {
                    agent_id: agent.id,
                    pool_id: agent_token.agent_pool_id,
                })
            }
            None => Ok(Subject::UnregisteredPoolAgent {
                pool_id: agent_token.agent_pool_id,
                token_id: agent_token.id,
            }),
        }
    }

    /// Resolve a job token to its subject.
    pub async fn authenticate_job_token(&self, job_token: &str) -> Result<Subject> {
        let spec = self.tokens.resolve_job_token(job_token)?;
        // the job must still exist
        self.db.get_job(&spec).await?;
        Ok(Subject::Job(spec))
    }

    fn require_admin(&self, subject: &Subject) -> Result<()> {
        match subject {
            Subject::User { .. } | Subject::Manager => Ok(()),
            _ => Err(CoreError::AccessNotPermitted),
        }
    }
}
