// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quoted types from the run service.
//!
//! The run service itself lives outside this crate; the orchestrator only
//! consumes the contract below: it receives a [`Run`] when the run service
//! enqueues or cancels a phase, and it drives phases through
//! [`PhaseClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::pool::PoolId;
use crate::workspace::WorkspaceId;

/// Identifier of a run, owned by the run service.
pub type RunId = Uuid;

/// A stage of a run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// The speculative or pre-apply plan stage.
    Plan,
    /// The apply stage.
    Apply,
}

/// The subset of a run the orchestrator needs in order to create and
/// cancel jobs. Denormalized workspace fields are copied onto the job at
/// creation time.
#[derive(Debug, Clone)]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// The phase the run is currently in.
    pub phase: Phase,
    /// Workspace the run belongs to.
    pub workspace_id: WorkspaceId,
    /// Organization the workspace belongs to.
    pub organization: String,
    /// Agent pool the workspace is configured with, if any.
    pub agent_pool_id: Option<PoolId>,
    /// Whether the user force-canceled the run.
    pub force_canceled: bool,
}

/// Client for starting and finishing run phases on the run service.
///
/// Implemented by the run service when tarmac-core is embedded alongside
/// it; tests use a recording fake.
#[async_trait]
pub trait PhaseClient: Send + Sync {
    /// Mark a run phase as started.
    async fn start_phase(&self, run_id: RunId, phase: Phase) -> Result<()>;

    /// Mark a run phase as finished, noting whether it errored.
    async fn finish_phase(&self, run_id: RunId, phase: Phase, errored: bool) -> Result<()>;

    /// Cancel the run.
    async fn cancel(&self, run_id: RunId) -> Result<()>;
}

/// Phase client that only records the transition in the log.
///
/// Used when the run service runs out-of-process and performs its own
/// phase bookkeeping from job events.
#[derive(Debug, Default, Clone)]
pub struct NullPhaseClient;

#[async_trait]
impl PhaseClient for NullPhaseClient {
    async fn start_phase(&self, run_id: RunId, phase: Phase) -> Result<()> {
        tracing::debug!(%run_id, %phase, "phase started");
        Ok(())
    }

    async fn finish_phase(&self, run_id: RunId, phase: Phase, errored: bool) -> Result<()> {
        tracing::debug!(%run_id, %phase, errored, "phase finished");
        Ok(())
    }

    async fn cancel(&self, run_id: RunId) -> Result<()> {
        tracing::debug!(%run_id, "run canceled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_string_round_trip() {
        assert_eq!(Phase::Plan.to_string(), "plan");
        assert_eq!(Phase::Apply.to_string(), "apply");
        assert_eq!("plan".parse::<Phase>().unwrap(), Phase::Plan);
        assert_eq!("apply".parse::<Phase>().unwrap(), Phase::Apply);
        assert!("destroy".parse::<Phase>().is_err());
    }
}
