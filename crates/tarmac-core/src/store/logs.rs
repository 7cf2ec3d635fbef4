// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log chunk persistence.
//!
//! Chunks are stored append-only per `(run, phase)` in insertion order. A
//! chunk at offset zero marks the start of a fresh stream for the phase,
//! discarding what came before it (a phase can be re-run).

use async_trait::async_trait;
use uuid::Uuid;

use super::{decode_error, Db};
use crate::error::{CoreError, Result};
use crate::logs::{Chunk, ChunkStore};
use crate::run::{Phase, RunId};

#[derive(sqlx::FromRow)]
struct ChunkRow {
    chunk_id: Uuid,
    run_id: Uuid,
    phase: String,
    chunk: Vec<u8>,
    chunk_offset: i32,
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = CoreError;

    fn try_from(row: ChunkRow) -> Result<Self> {
        Ok(Chunk {
            run_id: row.run_id,
            phase: row.phase.parse().map_err(decode_error)?,
            data: row.chunk,
            offset: usize::try_from(row.chunk_offset).map_err(decode_error)?,
        })
    }
}

impl Db {
    /// Load one chunk by ID. Used to rehydrate chunk notifications.
    pub async fn get_chunk(&self, chunk_id: Uuid) -> Result<Chunk> {
        let row: Option<ChunkRow> = sqlx::query_as(
            "SELECT chunk_id, run_id, phase, chunk, chunk_offset \
             FROM logs WHERE chunk_id = $1",
        )
        .bind(chunk_id)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| CoreError::ResourceNotFound {
            resource: "chunk",
            id: chunk_id.to_string(),
        })?
        .try_into()
    }
}

#[async_trait]
impl ChunkStore for Db {
    async fn get_logs(&self, run_id: RunId, phase: Phase) -> Result<Vec<u8>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            "SELECT chunk_id, run_id, phase, chunk, chunk_offset \
             FROM logs WHERE run_id = $1 AND phase = $2 ORDER BY seq",
        )
        .bind(run_id)
        .bind(phase.to_string())
        .fetch_all(self.pool())
        .await?;

        let mut logs = Vec::new();
        for row in rows {
            let chunk: Chunk = row.try_into()?;
            if chunk.is_start() {
                logs = chunk.data;
            } else {
                logs.extend_from_slice(&chunk.data);
            }
        }
        Ok(logs)
    }

    async fn put_chunk(&self, chunk: &Chunk) -> Result<Uuid> {
        let chunk_id = Uuid::new_v4();
        let offset = i32::try_from(chunk.offset).map_err(|_| CoreError::InvalidArgument {
            field: "offset",
            message: "chunk offset out of range".to_string(),
        })?;
        sqlx::query(
            r#"
            INSERT INTO logs (chunk_id, run_id, phase, chunk, chunk_offset)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(chunk_id)
        .bind(chunk.run_id)
        .bind(chunk.phase.to_string())
        .bind(&chunk.data)
        .bind(offset)
        .execute(self.pool())
        .await?;
        Ok(chunk_id)
    }
}
