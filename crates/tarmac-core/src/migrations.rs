// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for tarmac-core.
//!
//! This module exposes embedded migrations that can be run
//! programmatically. Products embedding tarmac-core call
//! [`run`] to set up the orchestration schema, including the
//! notification triggers the brokers rely on.

use sqlx::migrate::MigrateError;

/// Migrator with all core migrations embedded.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run the migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple
/// times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
