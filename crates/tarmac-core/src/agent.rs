// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agents and the agent lifecycle state machine.
//!
//! An agent is a worker process that executes jobs. It is either
//! server-embedded (no pool) or a member of an agent pool. Agents report
//! their own status; the manager drives agents that stop reporting into
//! `unknown` and then `errored`.
//!
//! ```text
//!          ┌──────┐ agent  ┌──────┐
//!          │ idle │◄──────►│ busy │
//!          └──┬───┘        └──┬───┘
//!     manager │   ┌───────────┘ manager
//!             ▼   ▼
//!          ┌─────────┐ manager ┌─────────┐
//!          │ unknown │────────►│ errored │
//!          └─────────┘         └─────────┘
//!
//!          any non-terminal ──agent──► exited
//! ```

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::pool::PoolId;

/// Identifier of an agent.
pub type AgentId = Uuid;

/// Lifecycle state of an agent.
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
pub enum AgentStatus {
    /// Registered and reachable, with no jobs in progress.
    Idle,
    /// Executing at least one job.
    Busy,
    /// Missed its heartbeat window; may come back.
    Unknown,
    /// Declared dead by the manager. Terminal.
    Errored,
    /// Shut down cleanly. Terminal.
    Exited,
}

impl AgentStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Errored | AgentStatus::Exited)
    }

    /// Whether an agent in this status may receive work.
    pub fn is_healthy(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

/// A worker process that executes jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier, assigned at registration.
    pub id: AgentId,
    /// Version string reported by the agent binary.
    pub version: String,
    /// Maximum number of jobs the agent executes concurrently.
    pub max_jobs: i32,
    /// Number of jobs currently allocated to or running on the agent.
    pub current_jobs: i32,
    /// IP address the agent registered from, if known.
    pub ip_address: Option<IpAddr>,
    /// Pool the agent belongs to; absent for server-embedded agents.
    pub agent_pool_id: Option<PoolId>,
    /// Current lifecycle state.
    pub status: AgentStatus,
    /// Last time the agent was heard from.
    pub last_ping_at: DateTime<Utc>,
    /// Last time the status changed.
    pub last_status_at: DateTime<Utc>,
}

/// Options for registering an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAgentOptions {
    /// Version string of the agent binary.
    pub version: String,
    /// Maximum number of concurrent jobs.
    pub concurrency: i32,
    /// IP address the agent registered from.
    pub ip_address: Option<IpAddr>,
    /// Pool membership; overridden with the token's pool when the caller
    /// registered with a pool token.
    #[serde(skip)]
    pub agent_pool_id: Option<PoolId>,
}

impl Agent {
    /// Construct a newly registered agent in the `idle` state.
    pub fn new(opts: RegisterAgentOptions) -> Result<Self> {
        if opts.concurrency < 1 {
            return Err(CoreError::InvalidArgument {
                field: "concurrency",
                message: "concurrency must be at least 1".to_string(),
            });
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            version: opts.version,
            max_jobs: opts.concurrency,
            current_jobs: 0,
            ip_address: opts.ip_address,
            agent_pool_id: opts.agent_pool_id,
            status: AgentStatus::Idle,
            last_ping_at: now,
            last_status_at: now,
        })
    }

    /// Skeleton agent carrying only the identifier, published for delete
    /// notifications.
    pub fn skeleton(id: AgentId) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: String::new(),
            max_jobs: 0,
            current_jobs: 0,
            ip_address: None,
            agent_pool_id: None,
            status: AgentStatus::Exited,
            last_ping_at: now,
            last_status_at: now,
        }
    }

    /// Whether the agent belongs to no pool and is embedded in the server
    /// process.
    pub fn is_server_embedded(&self) -> bool {
        self.agent_pool_id.is_none()
    }

    /// Fraction of the agent's concurrency currently in use.
    pub fn job_ratio(&self) -> f64 {
        f64::from(self.current_jobs) / f64::from(self.max_jobs.max(1))
    }

    /// Transition the agent to a new status.
    ///
    /// `is_agent` is true iff the caller is the agent itself. Agents
    /// report `idle`/`busy`/`exited` and recover from `unknown`; only the
    /// manager may declare an agent `unknown` or `errored`. A repeated
    /// status from the agent is a heartbeat and refreshes `last_ping_at`
    /// without changing state.
    pub fn set_status(&mut self, to: AgentStatus, is_agent: bool) -> Result<()> {
        use AgentStatus::*;

        let from = self.status;
        let valid = match (from, to) {
            // terminal states cannot be left
            (Errored | Exited, _) => false,
            // agents report their own work state, heartbeat, recovery
            // from unknown, and clean shutdown
            (Idle, Busy) | (Busy, Idle) => is_agent,
            (Idle, Idle) | (Busy, Busy) => is_agent,
            (Unknown, Idle) | (Unknown, Busy) => is_agent,
            (Idle | Busy | Unknown, Exited) => is_agent,
            // manager-only promotions on missed heartbeats
            (Idle | Busy, Unknown) => !is_agent,
            (Unknown, Errored) => !is_agent,
            _ => false,
        };
        if !valid {
            if !from.is_terminal() && is_agent && matches!(to, Unknown | Errored) {
                return Err(CoreError::AccessNotPermitted);
            }
            return Err(CoreError::InvalidAgentStateTransition { from, to });
        }

        let now = Utc::now();
        if is_agent {
            self.last_ping_at = now;
        }
        if from != to {
            self.status = to;
            self.last_status_at = now;
        }
        Ok(())
    }
}
