// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent pool persistence.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::Db;
use crate::error::{CoreError, Result};
use crate::pool::{Pool, PoolId};
use crate::token::TokenId;
use crate::workspace::WorkspaceId;

const POOL_COLUMNS: &str = r#"
    p.pool_id, p.name, p.organization, p.organization_scoped, p.created_at,
    coalesce(
        array_agg(DISTINCT aw.workspace_id)
            FILTER (WHERE aw.workspace_id IS NOT NULL),
        '{}'
    ) AS allowed_workspaces,
    coalesce(
        array_agg(DISTINCT sw.workspace_id)
            FILTER (WHERE sw.workspace_id IS NOT NULL),
        '{}'
    ) AS assigned_workspaces
"#;

const POOL_JOINS: &str = r#"
    LEFT JOIN agent_pool_allowed_workspaces aw USING (pool_id)
    LEFT JOIN agent_pool_assigned_workspaces sw USING (pool_id)
"#;

#[derive(sqlx::FromRow)]
struct PoolRow {
    pool_id: Uuid,
    name: String,
    organization: String,
    organization_scoped: bool,
    created_at: DateTime<Utc>,
    allowed_workspaces: Vec<Uuid>,
    assigned_workspaces: Vec<Uuid>,
}

impl From<PoolRow> for Pool {
    fn from(row: PoolRow) -> Self {
        Pool {
            id: row.pool_id,
            name: row.name,
            organization: row.organization,
            organization_scoped: row.organization_scoped,
            allowed_workspaces: row.allowed_workspaces,
            assigned_workspaces: row.assigned_workspaces,
            created_at: row.created_at,
        }
    }
}

async fn select_pool(conn: &mut PgConnection, id: PoolId) -> Result<Pool> {
    let sql = format!(
        "SELECT {POOL_COLUMNS} FROM agent_pools p {POOL_JOINS} \
         WHERE p.pool_id = $1 GROUP BY p.pool_id"
    );
    let row: Option<PoolRow> = sqlx::query_as(&sql).bind(id).fetch_optional(conn).await?;
    row.map(Pool::from).ok_or_else(|| CoreError::ResourceNotFound {
        resource: "agent pool",
        id: id.to_string(),
    })
}

impl Db {
    /// Insert a new pool and its allowed-workspace grants.
    pub async fn create_pool(&self, pool: &Pool) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO agent_pools (pool_id, name, organization, organization_scoped, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(pool.id)
        .bind(&pool.name)
        .bind(&pool.organization)
        .bind(pool.organization_scoped)
        .bind(pool.created_at)
        .execute(&mut *tx)
        .await?;
        for workspace_id in &pool.allowed_workspaces {
            sqlx::query(
                "INSERT INTO agent_pool_allowed_workspaces (pool_id, workspace_id) VALUES ($1, $2)",
            )
            .bind(pool.id)
            .bind(workspace_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Load a pool by ID.
    pub async fn get_pool(&self, id: PoolId) -> Result<Pool> {
        let mut conn = self.pool().acquire().await?;
        select_pool(&mut conn, id).await
    }

    /// Load the pool an agent token belongs to.
    pub async fn get_pool_by_token_id(&self, token_id: TokenId) -> Result<Pool> {
        let pool_id: Option<Uuid> =
            sqlx::query_scalar("SELECT agent_pool_id FROM agent_tokens WHERE token_id = $1")
                .bind(token_id)
                .fetch_optional(self.pool())
                .await?;
        match pool_id {
            Some(pool_id) => self.get_pool(pool_id).await,
            None => Err(CoreError::ResourceNotFound {
                resource: "agent token",
                id: token_id.to_string(),
            }),
        }
    }

    /// List pools, optionally restricted to one organization.
    pub async fn list_pools(&self, organization: Option<&str>) -> Result<Vec<Pool>> {
        let sql = match organization {
            Some(_) => format!(
                "SELECT {POOL_COLUMNS} FROM agent_pools p {POOL_JOINS} \
                 WHERE p.organization = $1 GROUP BY p.pool_id ORDER BY p.created_at"
            ),
            None => format!(
                "SELECT {POOL_COLUMNS} FROM agent_pools p {POOL_JOINS} \
                 GROUP BY p.pool_id ORDER BY p.created_at"
            ),
        };
        let mut query = sqlx::query_as::<_, PoolRow>(&sql);
        if let Some(organization) = organization {
            query = query.bind(organization);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(Pool::from).collect())
    }

    /// Load a pool, apply the mutator, and persist the result, all under
    /// advisory locks covering the pool tables.
    pub async fn update_pool<F>(&self, id: PoolId, f: F) -> Result<Pool>
    where
        F: FnOnce(&mut Pool) -> Result<()>,
    {
        let mut tx = self.begin().await?;
        Db::lock(
            &mut tx,
            &["agent_pools", "agent_pool_allowed_workspaces"],
        )
        .await?;
        let before = select_pool(&mut tx, id).await?;
        let mut pool = before.clone();
        f(&mut pool)?;

        sqlx::query(
            r#"
            UPDATE agent_pools
            SET name = $2, organization_scoped = $3
            WHERE pool_id = $1
            "#,
        )
        .bind(pool.id)
        .bind(&pool.name)
        .bind(pool.organization_scoped)
        .execute(&mut *tx)
        .await?;

        for workspace_id in &pool.allowed_workspaces {
            if !before.allowed_workspaces.contains(workspace_id) {
                sqlx::query(
                    "INSERT INTO agent_pool_allowed_workspaces (pool_id, workspace_id) VALUES ($1, $2)",
                )
                .bind(pool.id)
                .bind(workspace_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        for workspace_id in &before.allowed_workspaces {
            if !pool.allowed_workspaces.contains(workspace_id) {
                sqlx::query(
                    "DELETE FROM agent_pool_allowed_workspaces WHERE pool_id = $1 AND workspace_id = $2",
                )
                .bind(pool.id)
                .bind(workspace_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(pool)
    }

    /// Delete a pool. The caller is responsible for checking that no
    /// workspace still references it.
    pub async fn delete_pool(&self, id: PoolId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM agent_pools WHERE pool_id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(CoreError::ResourceNotFound {
                resource: "agent pool",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Record that a workspace now references the pool. Called by the
    /// workspace service after a workspace is created or updated with
    /// this pool.
    pub async fn add_assigned_workspace(
        &self,
        pool_id: PoolId,
        workspace_id: WorkspaceId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_pool_assigned_workspaces (pool_id, workspace_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(pool_id)
        .bind(workspace_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record that a workspace no longer references the pool.
    pub async fn remove_assigned_workspace(
        &self,
        pool_id: PoolId,
        workspace_id: WorkspaceId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM agent_pool_assigned_workspaces WHERE pool_id = $1 AND workspace_id = $2",
        )
        .bind(pool_id)
        .bind(workspace_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
