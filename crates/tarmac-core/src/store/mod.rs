// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transactional persistence for pools, agents, jobs, tokens and logs.
//!
//! All access goes through [`Db`], a thin wrapper over a Postgres pool.
//! Row updates follow a load-mutate-persist pattern: the row is selected
//! `FOR UPDATE` inside a transaction, the in-memory value is mutated, and
//! the result is written back iff the mutator succeeded. Every
//! write-performing table carries an AFTER trigger (see `migrations/`)
//! that emits the `(action, id)` notification consumed by
//! [`crate::pubsub::Listener`]; delete notifications fire after the row
//! is gone.

pub mod agents;
pub mod jobs;
pub mod logs;
pub mod pools;
pub mod tokens;

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;

/// Handle to the orchestrator's database.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Take transaction-scoped advisory locks on the given names, in
    /// order. Released automatically when the transaction ends.
    pub async fn lock(tx: &mut Transaction<'_, Postgres>, names: &[&str]) -> Result<()> {
        for name in names {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(name)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

/// Error for a row column that failed to decode into its domain type.
pub(crate) fn decode_error(details: impl std::fmt::Display) -> crate::error::CoreError {
    crate::error::CoreError::Database {
        operation: "decode",
        details: details.to_string(),
    }
}
