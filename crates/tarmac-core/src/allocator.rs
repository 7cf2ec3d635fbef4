// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The allocator control loop.
//!
//! A single-instance loop that pairs unallocated jobs with healthy
//! agents, and moves jobs off agents that died. It keeps in-memory
//! mirrors of pools, agents and jobs, seeded from a snapshot at startup
//! and maintained from the broker streams; a periodic tick guards against
//! missed events.
//!
//! Selection policy: among candidate agents, pick the one with the
//! lowest `current_jobs / max_jobs` ratio, breaking ties by earliest
//! `last_ping_at` (longest idle first). Candidates must share the job's
//! organization and satisfy the workspace's pool constraint: jobs from
//! pool-less workspaces only run on server-embedded agents, and jobs
//! from pooled workspaces only on members of that pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentId};
use crate::error::Result;
use crate::job::{Job, JobSpec, JobStatus};
use crate::pool::{Pool, PoolId};
use crate::pubsub::Event;
use crate::service::Service;

/// Interval between allocation passes when no event arrives.
const TICK: Duration = Duration::from_secs(10);

/// Pairs pending jobs with healthy agents.
pub struct Allocator {
    service: Arc<Service>,
    pools: HashMap<PoolId, Pool>,
    agents: HashMap<AgentId, Agent>,
    jobs: HashMap<JobSpec, Job>,
    stale: bool,
}

impl Allocator {
    /// Create an allocator over the given service.
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            pools: HashMap::new(),
            agents: HashMap::new(),
            jobs: HashMap::new(),
            stale: false,
        }
    }

    /// Run allocation passes until shutdown is signaled.
    pub async fn start(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // subscribe before seeding so no event is missed in between
        let mut pools_sub = self.service.watch_agent_pools();
        let mut agents_sub = self.service.watch_agents();
        let mut jobs_sub = self.service.watch_jobs();
        self.seed().await?;
        debug!(
            pools = self.pools.len(),
            agents = self.agents.len(),
            jobs = self.jobs.len(),
            "allocator started"
        );

        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                event = pools_sub.recv() => match event {
                    Some(event) => self.apply_pool_event(event),
                    None => {
                        pools_sub = self.service.watch_agent_pools();
                        self.stale = true;
                    }
                },

                event = agents_sub.recv() => match event {
                    Some(event) => self.apply_agent_event(event),
                    None => {
                        agents_sub = self.service.watch_agents();
                        self.stale = true;
                    }
                },

                event = jobs_sub.recv() => match event {
                    Some(event) => self.apply_job_event(event),
                    None => {
                        jobs_sub = self.service.watch_jobs();
                        self.stale = true;
                    }
                },

                _ = tick.tick() => {}
            }

            if self.stale {
                if let Err(err) = self.seed().await {
                    warn!(error = %err, "failed to reseed allocator snapshot");
                    continue;
                }
                self.stale = false;
            }
            self.allocate_all().await;
        }
        debug!("allocator stopped");
        Ok(())
    }

    /// Replace the in-memory mirrors with a fresh snapshot.
    async fn seed(&mut self) -> Result<()> {
        let db = self.service.db();
        self.pools = db
            .list_pools(None)
            .await?
            .into_iter()
            .map(|pool| (pool.id, pool))
            .collect();
        self.agents = db
            .list_agents()
            .await?
            .into_iter()
            .map(|agent| (agent.id, agent))
            .collect();
        self.jobs = db
            .list_active_jobs()
            .await?
            .into_iter()
            .map(|job| (job.spec, job))
            .collect();
        Ok(())
    }

    fn apply_pool_event(&mut self, event: Event<Pool>) {
        match event {
            Event::Created(pool) | Event::Updated(pool) => {
                self.pools.insert(pool.id, pool);
            }
            Event::Deleted(pool) => {
                self.pools.remove(&pool.id);
            }
            Event::Resync => self.stale = true,
        }
    }

    fn apply_agent_event(&mut self, event: Event<Agent>) {
        match event {
            Event::Created(agent) | Event::Updated(agent) => {
                self.agents.insert(agent.id, agent);
            }
            Event::Deleted(agent) => {
                self.agents.remove(&agent.id);
            }
            Event::Resync => self.stale = true,
        }
    }

    fn apply_job_event(&mut self, event: Event<Job>) {
        match event {
            Event::Created(job) | Event::Updated(job) => {
                if job.status.is_terminal() {
                    self.jobs.remove(&job.spec);
                } else {
                    self.jobs.insert(job.spec, job);
                }
            }
            Event::Deleted(job) => {
                self.jobs.remove(&job.spec);
            }
            Event::Resync => self.stale = true,
        }
    }

    /// One allocation pass: place unallocated jobs in FIFO order, then
    /// move jobs off dead agents.
    async fn allocate_all(&mut self) {
        let mut specs: Vec<JobSpec> = self.jobs.keys().copied().collect();
        specs.sort_by_key(|spec| self.jobs.get(spec).map(|job| job.created_at));

        for spec in specs {
            let Some(job) = self.jobs.get(&spec).cloned() else {
                continue;
            };
            match job.status {
                JobStatus::Unallocated => self.place(&job, false).await,
                JobStatus::Allocated | JobStatus::Running if self.agent_is_gone(&job) => {
                    self.place(&job, true).await
                }
                _ => {}
            }
        }
    }

    /// Whether the job's assigned agent is terminal or no longer known.
    fn agent_is_gone(&self, job: &Job) -> bool {
        match job.agent_id.and_then(|id| self.agents.get(&id)) {
            Some(agent) => agent.status.is_terminal(),
            None => true,
        }
    }

    async fn place(&mut self, job: &Job, reallocate: bool) {
        let Some(agent_id) = select_agent(job, &self.agents, &self.pools).map(|agent| agent.id)
        else {
            // no candidate right now; retried on the next wake
            return;
        };
        let placed = if reallocate {
            self.service.reallocate_job(&job.spec, agent_id).await
        } else {
            self.service.allocate_job(&job.spec, agent_id).await
        };
        match placed {
            Ok(placed) => {
                // mirror the placement locally so the rest of this pass
                // sees the consumed capacity
                if reallocate {
                    if let Some(previous) = job
                        .agent_id
                        .and_then(|id| self.agents.get_mut(&id))
                    {
                        previous.current_jobs = (previous.current_jobs - 1).max(0);
                    }
                }
                if let Some(agent) = self.agents.get_mut(&agent_id) {
                    agent.current_jobs += 1;
                }
                self.jobs.insert(placed.spec, placed);
            }
            Err(err) => {
                warn!(
                    spec = %job.spec,
                    agent_id = %agent_id,
                    error = %err,
                    "failed to place job"
                );
                self.stale = true;
            }
        }
    }
}

/// Whether an agent may execute the job.
fn is_candidate(job: &Job, agent: &Agent, pools: &HashMap<PoolId, Pool>) -> bool {
    if !agent.status.is_healthy() || agent.current_jobs >= agent.max_jobs {
        return false;
    }
    match job.agent_pool_id {
        // pool-less workspaces run on server-embedded agents only
        None => agent.agent_pool_id.is_none(),
        Some(pool_id) => {
            agent.agent_pool_id == Some(pool_id)
                && pools.get(&pool_id).is_some_and(|pool| {
                    pool.organization == job.organization && pool.allows(job.workspace_id)
                })
        }
    }
}

/// Pick the least-loaded candidate, preferring the longest-idle agent on
/// ties.
fn select_agent<'a>(
    job: &Job,
    agents: &'a HashMap<AgentId, Agent>,
    pools: &HashMap<PoolId, Pool>,
) -> Option<&'a Agent> {
    agents
        .values()
        .filter(|agent| is_candidate(job, agent, pools))
        .min_by(|a, b| {
            a.job_ratio()
                .total_cmp(&b.job_ratio())
                .then_with(|| a.last_ping_at.cmp(&b.last_ping_at))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, RegisterAgentOptions};
    use crate::pool::CreatePoolOptions;
    use crate::run::{Phase, Run};
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn agent(pool_id: Option<PoolId>, current: i32, max: i32) -> Agent {
        let mut agent = Agent::new(RegisterAgentOptions {
            version: "0.3.1".to_string(),
            concurrency: max,
            ip_address: None,
            agent_pool_id: pool_id,
        })
        .unwrap();
        agent.current_jobs = current;
        if current > 0 {
            agent.status = AgentStatus::Busy;
        }
        agent
    }

    fn pool(organization: &str, scoped: bool) -> Pool {
        Pool::new(CreatePoolOptions {
            name: "default".to_string(),
            organization: organization.to_string(),
            organization_scoped: scoped,
            allowed_workspaces: Vec::new(),
        })
        .unwrap()
    }

    fn job(agent_pool_id: Option<PoolId>) -> Job {
        Job::new(&Run {
            id: Uuid::new_v4(),
            phase: Phase::Plan,
            workspace_id: Uuid::new_v4(),
            organization: "acme".to_string(),
            agent_pool_id,
            force_canceled: false,
        })
    }

    #[test]
    fn pool_less_jobs_only_match_server_agents() {
        let pools = HashMap::new();
        let job = job(None);
        assert!(is_candidate(&job, &agent(None, 0, 2), &pools));
        assert!(!is_candidate(&job, &agent(Some(Uuid::new_v4()), 0, 2), &pools));
    }

    #[test]
    fn pooled_jobs_require_matching_pool_and_grant() {
        let mut pools = HashMap::new();
        let restricted = pool("acme", false);
        let pool_id = restricted.id;
        pools.insert(pool_id, restricted);

        let job = job(Some(pool_id));
        let member = agent(Some(pool_id), 0, 2);

        // unscoped pool with no grant for the workspace
        assert!(!is_candidate(&job, &member, &pools));

        // grant the workspace and the agent becomes eligible
        pools
            .get_mut(&pool_id)
            .unwrap()
            .allowed_workspaces
            .push(job.workspace_id);
        assert!(is_candidate(&job, &member, &pools));

        // organization-scoped pools skip the grant check
        let mut scoped = pool("acme", true);
        scoped.id = pool_id;
        pools.insert(pool_id, scoped);
        assert!(is_candidate(&job, &member, &pools));

        // agents outside the pool and server agents never match
        assert!(!is_candidate(&job, &agent(Some(Uuid::new_v4()), 0, 2), &pools));
        assert!(!is_candidate(&job, &agent(None, 0, 2), &pools));
    }

    #[test]
    fn unhealthy_and_saturated_agents_are_excluded() {
        let pools = HashMap::new();
        let job = job(None);

        let mut dead = agent(None, 0, 2);
        dead.status = AgentStatus::Errored;
        assert!(!is_candidate(&job, &dead, &pools));

        let mut unknown = agent(None, 0, 2);
        unknown.status = AgentStatus::Unknown;
        assert!(!is_candidate(&job, &unknown, &pools));

        let full = agent(None, 2, 2);
        assert!(!is_candidate(&job, &full, &pools));
    }

    #[test]
    fn selection_prefers_lowest_job_ratio() {
        let pools = HashMap::new();
        let job = job(None);

        let mut agents = HashMap::new();
        let loaded = agent(None, 3, 4); // ratio 0.75
        let spare = agent(None, 1, 4); // ratio 0.25
        let spare_id = spare.id;
        agents.insert(loaded.id, loaded);
        agents.insert(spare_id, spare);

        let selected = select_agent(&job, &agents, &pools).unwrap();
        assert_eq!(selected.id, spare_id);
    }

    #[test]
    fn selection_breaks_ties_by_longest_idle() {
        let pools = HashMap::new();
        let job = job(None);

        let mut fresh = agent(None, 0, 2);
        fresh.last_ping_at = Utc::now();
        let mut idle = agent(None, 0, 2);
        idle.last_ping_at = Utc::now() - ChronoDuration::minutes(5);
        let idle_id = idle.id;

        let mut agents = HashMap::new();
        agents.insert(fresh.id, fresh);
        agents.insert(idle_id, idle);

        let selected = select_agent(&job, &agents, &pools).unwrap();
        assert_eq!(selected.id, idle_id);
    }

    #[test]
    fn no_candidate_yields_none() {
        let pools = HashMap::new();
        let job = job(Some(Uuid::new_v4()));
        let mut agents = HashMap::new();
        let server = agent(None, 0, 2);
        agents.insert(server.id, server);
        assert!(select_agent(&job, &agents, &pools).is_none());
    }
}
