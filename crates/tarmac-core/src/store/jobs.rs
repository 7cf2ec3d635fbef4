// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job persistence.
//!
//! Jobs are keyed by `(run_id, phase)`. Allocation, reallocation and
//! cancellation also maintain the affected agents' `current_jobs`
//! counters within the same transaction, preserving the invariant that a
//! counter equals the number of jobs allocated to or running on the
//! agent.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{agents, decode_error, Db};
use crate::agent::AgentId;
use crate::error::{CoreError, Result};
use crate::job::{Job, JobSpec, JobStatus};
use crate::run::Run;

const JOB_COLUMNS: &str = r#"
    run_id, phase, status, agent_id, signaled, workspace_id,
    organization, agent_pool_id, created_at
"#;

#[derive(sqlx::FromRow)]
struct JobRow {
    run_id: Uuid,
    phase: String,
    status: String,
    agent_id: Option<Uuid>,
    signaled: Option<bool>,
    workspace_id: Uuid,
    organization: String,
    agent_pool_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            spec: JobSpec {
                run_id: row.run_id,
                phase: row.phase.parse().map_err(decode_error)?,
            },
            status: row.status.parse().map_err(decode_error)?,
            agent_id: row.agent_id,
            signaled: row.signaled,
            workspace_id: row.workspace_id,
            organization: row.organization,
            agent_pool_id: row.agent_pool_id,
            created_at: row.created_at,
        })
    }
}

fn not_found(spec: &JobSpec) -> CoreError {
    CoreError::ResourceNotFound {
        resource: "job",
        id: spec.to_string(),
    }
}

/// Select a job row with a row lock held for the enclosing transaction.
pub(crate) async fn select_for_update(conn: &mut PgConnection, spec: &JobSpec) -> Result<Job> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = $1 AND phase = $2 FOR UPDATE"
    );
    let row: Option<JobRow> = sqlx::query_as(&sql)
        .bind(spec.run_id)
        .bind(spec.phase.to_string())
        .fetch_optional(conn)
        .await?;
    row.ok_or_else(|| not_found(spec))?.try_into()
}

/// Write every mutable job column back to the row.
pub(crate) async fn persist(conn: &mut PgConnection, job: &Job) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $3, agent_id = $4, signaled = $5
        WHERE run_id = $1 AND phase = $2
        "#,
    )
    .bind(job.spec.run_id)
    .bind(job.spec.phase.to_string())
    .bind(job.status.to_string())
    .bind(job.agent_id)
    .bind(job.signaled)
    .execute(conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(not_found(&job.spec));
    }
    Ok(())
}

impl Db {
    /// Insert a new job.
    pub async fn create_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (run_id, phase, status, agent_id, signaled, workspace_id,
                              organization, agent_pool_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.spec.run_id)
        .bind(job.spec.phase.to_string())
        .bind(job.status.to_string())
        .bind(job.agent_id)
        .bind(job.signaled)
        .bind(job.workspace_id)
        .bind(&job.organization)
        .bind(job.agent_pool_id)
        .bind(job.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Load a job by spec.
    pub async fn get_job(&self, spec: &JobSpec) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = $1 AND phase = $2");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(spec.run_id)
            .bind(spec.phase.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.ok_or_else(|| not_found(spec))?.try_into()
    }

    /// List every job.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at");
        let rows: Vec<JobRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// List jobs that are not yet terminal, oldest first. Used to seed
    /// the allocator's snapshot.
    pub async fn list_active_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status IN ('unallocated', 'allocated', 'running') \
             ORDER BY created_at"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Jobs an agent should act on: allocated to it, or running on it
    /// with a cancellation signal set.
    pub async fn allocated_and_signaled_jobs(&self, agent_id: AgentId) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE agent_id = $1 \
               AND (status = 'allocated' OR (status = 'running' AND signaled IS NOT NULL)) \
             ORDER BY created_at"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(agent_id)
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Load a job `FOR UPDATE`, apply the mutator, and persist the result
    /// iff it succeeded.
    pub async fn update_job<F>(&self, spec: &JobSpec, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut tx = self.begin().await?;
        let mut job = select_for_update(&mut tx, spec).await?;
        f(&mut job)?;
        persist(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Allocate an unallocated job to a healthy agent, incrementing the
    /// agent's job counter in the same transaction.
    pub async fn allocate_job(&self, spec: &JobSpec, agent_id: AgentId) -> Result<Job> {
        let mut tx = self.begin().await?;
        let mut job = select_for_update(&mut tx, spec).await?;
        let agent = agents::select_for_update(&mut tx, agent_id).await?;
        if !agent.status.is_healthy() {
            return Err(CoreError::InvalidArgument {
                field: "agent_id",
                message: format!("agent {} is {}", agent.id, agent.status),
            });
        }
        job.allocate(agent_id)?;
        persist(&mut tx, &job).await?;
        agents::adjust_current_jobs(&mut tx, agent_id, 1).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Move a job from a dead agent to a replacement, transferring the
    /// job count between the two agents in the same transaction.
    pub async fn reallocate_job(&self, spec: &JobSpec, agent_id: AgentId) -> Result<Job> {
        let mut tx = self.begin().await?;
        let mut job = select_for_update(&mut tx, spec).await?;
        let previous = job.agent_id;
        job.reallocate(agent_id)?;
        persist(&mut tx, &job).await?;
        if let Some(previous) = previous {
            agents::adjust_current_jobs(&mut tx, previous, -1).await?;
        }
        agents::adjust_current_jobs(&mut tx, agent_id, 1).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Apply a run cancellation to its current job, releasing the agent's
    /// job slot when an allocated job is canceled outright. Returns the
    /// job and the signal recorded on it, if any.
    pub async fn cancel_job(&self, run: &Run) -> Result<(Job, Option<bool>)> {
        let spec = JobSpec {
            run_id: run.id,
            phase: run.phase,
        };
        let mut tx = self.begin().await?;
        let mut job = select_for_update(&mut tx, &spec).await?;
        let was = job.status;
        let signal = job.cancel(run)?;
        persist(&mut tx, &job).await?;
        if was == JobStatus::Allocated && job.status == JobStatus::Canceled {
            if let Some(agent_id) = job.agent_id {
                agents::adjust_current_jobs(&mut tx, agent_id, -1).await?;
            }
        }
        tx.commit().await?;
        Ok((job, signal))
    }
}
