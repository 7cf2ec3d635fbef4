// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent token persistence. Only the SHA-256 digest of a secret is
//! stored; the plaintext never reaches the database.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::{CoreError, Result};
use crate::pool::PoolId;
use crate::token::{AgentToken, TokenId};

#[derive(sqlx::FromRow)]
struct TokenRow {
    token_id: Uuid,
    description: String,
    agent_pool_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<TokenRow> for AgentToken {
    fn from(row: TokenRow) -> Self {
        AgentToken {
            id: row.token_id,
            description: row.description,
            agent_pool_id: row.agent_pool_id,
            created_at: row.created_at,
        }
    }
}

fn not_found(id: TokenId) -> CoreError {
    CoreError::ResourceNotFound {
        resource: "agent token",
        id: id.to_string(),
    }
}

impl Db {
    /// Insert a new agent token with the digest of its secret.
    pub async fn create_agent_token(&self, token: &AgentToken, secret_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_tokens (token_id, description, agent_pool_id, secret_hash, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(token.id)
        .bind(&token.description)
        .bind(token.agent_pool_id)
        .bind(secret_hash)
        .bind(token.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Load an agent token by ID.
    pub async fn get_agent_token(&self, id: TokenId) -> Result<AgentToken> {
        let row: Option<TokenRow> = sqlx::query_as(
            "SELECT token_id, description, agent_pool_id, created_at \
             FROM agent_tokens WHERE token_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(AgentToken::from).ok_or_else(|| not_found(id))
    }

    /// Resolve a bearer secret digest to the token it belongs to.
    pub async fn get_agent_token_by_secret_hash(&self, secret_hash: &str) -> Result<AgentToken> {
        let row: Option<TokenRow> = sqlx::query_as(
            "SELECT token_id, description, agent_pool_id, created_at \
             FROM agent_tokens WHERE secret_hash = $1",
        )
        .bind(secret_hash)
        .fetch_optional(self.pool())
        .await?;
        row.map(AgentToken::from).ok_or(CoreError::InvalidToken)
    }

    /// List the tokens minted for a pool.
    pub async fn list_agent_tokens(&self, pool_id: PoolId) -> Result<Vec<AgentToken>> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            "SELECT token_id, description, agent_pool_id, created_at \
             FROM agent_tokens WHERE agent_pool_id = $1 ORDER BY created_at",
        )
        .bind(pool_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(AgentToken::from).collect())
    }

    /// Delete an agent token, revoking the secret.
    pub async fn delete_agent_token(&self, id: TokenId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM agent_tokens WHERE token_id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }
}
