// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent persistence.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{decode_error, Db};
use crate::agent::{Agent, AgentId};
use crate::error::{CoreError, Result};
use crate::pool::PoolId;

const AGENT_COLUMNS: &str = r#"
    agent_id, version, max_jobs, current_jobs, ip_address,
    agent_pool_id, status, last_ping_at, last_status_at
"#;

#[derive(sqlx::FromRow)]
struct AgentRow {
    agent_id: Uuid,
    version: String,
    max_jobs: i32,
    current_jobs: i32,
    ip_address: Option<String>,
    agent_pool_id: Option<Uuid>,
    status: String,
    last_ping_at: DateTime<Utc>,
    last_status_at: DateTime<Utc>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = CoreError;

    fn try_from(row: AgentRow) -> Result<Self> {
        let ip_address = row
            .ip_address
            .map(|ip| ip.parse())
            .transpose()
            .map_err(decode_error)?;
        Ok(Agent {
            id: row.agent_id,
            version: row.version,
            max_jobs: row.max_jobs,
            current_jobs: row.current_jobs,
            ip_address,
            agent_pool_id: row.agent_pool_id,
            status: row.status.parse().map_err(decode_error)?,
            last_ping_at: row.last_ping_at,
            last_status_at: row.last_status_at,
        })
    }
}

fn not_found(id: AgentId) -> CoreError {
    CoreError::ResourceNotFound {
        resource: "agent",
        id: id.to_string(),
    }
}

/// Select an agent row with a row lock held for the enclosing
/// transaction.
pub(crate) async fn select_for_update(conn: &mut PgConnection, id: AgentId) -> Result<Agent> {
    let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1 FOR UPDATE");
    let row: Option<AgentRow> = sqlx::query_as(&sql).bind(id).fetch_optional(conn).await?;
    row.ok_or_else(|| not_found(id))?.try_into()
}

/// Write every mutable agent column back to the row.
pub(crate) async fn persist(conn: &mut PgConnection, agent: &Agent) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE agents
        SET status = $2, current_jobs = $3, last_ping_at = $4, last_status_at = $5
        WHERE agent_id = $1
        "#,
    )
    .bind(agent.id)
    .bind(agent.status.to_string())
    .bind(agent.current_jobs)
    .bind(agent.last_ping_at)
    .bind(agent.last_status_at)
    .execute(conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(not_found(agent.id));
    }
    Ok(())
}

/// Adjust an agent's job counter, clamping at zero.
pub(crate) async fn adjust_current_jobs(
    conn: &mut PgConnection,
    id: AgentId,
    delta: i32,
) -> Result<()> {
    sqlx::query(
        "UPDATE agents SET current_jobs = GREATEST(current_jobs + $2, 0) WHERE agent_id = $1",
    )
    .bind(id)
    .bind(delta)
    .execute(conn)
    .await?;
    Ok(())
}

impl Db {
    /// Insert a newly registered agent.
    pub async fn create_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (agent_id, version, max_jobs, current_jobs, ip_address,
                                agent_pool_id, status, last_ping_at, last_status_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(agent.id)
        .bind(&agent.version)
        .bind(agent.max_jobs)
        .bind(agent.current_jobs)
        .bind(agent.ip_address.map(|ip| ip.to_string()))
        .bind(agent.agent_pool_id)
        .bind(agent.status.to_string())
        .bind(agent.last_ping_at)
        .bind(agent.last_status_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Load an agent by ID.
    pub async fn get_agent(&self, id: AgentId) -> Result<Agent> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1");
        let row: Option<AgentRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.ok_or_else(|| not_found(id))?.try_into()
    }

    /// List every agent.
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY last_ping_at DESC");
        let rows: Vec<AgentRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    /// List the agents belonging to a pool.
    pub async fn list_agents_by_pool(&self, pool_id: PoolId) -> Result<Vec<Agent>> {
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_pool_id = $1 ORDER BY last_ping_at DESC"
        );
        let rows: Vec<AgentRow> = sqlx::query_as(&sql)
            .bind(pool_id)
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    /// Load an agent `FOR UPDATE`, apply the mutator, and persist the
    /// result iff it succeeded.
    pub async fn update_agent<F>(&self, id: AgentId, f: F) -> Result<Agent>
    where
        F: FnOnce(&mut Agent) -> Result<()>,
    {
        let mut tx = self.begin().await?;
        let mut agent = select_for_update(&mut tx, id).await?;
        f(&mut agent)?;
        persist(&mut tx, &agent).await?;
        tx.commit().await?;
        Ok(agent)
    }

    /// Delete an agent.
    pub async fn delete_agent(&self, id: AgentId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM agents WHERE agent_id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }
}
