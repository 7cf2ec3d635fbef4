// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The manager control loop.
//!
//! A periodic loop that watches agent heartbeats. An agent that misses
//! its heartbeat window is promoted to `unknown`; one that stays silent
//! past the grace period is declared `errored`, at which point the
//! allocator moves its jobs elsewhere. The manager is the only caller
//! allowed to drive these transitions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::AgentStatus;
use crate::error::Result;
use crate::service::Service;
use crate::subject::Subject;

/// Promotes unresponsive agents to `unknown` and `errored`.
pub struct Manager {
    service: Arc<Service>,
    ping_interval: Duration,
    unknown_after: Duration,
    errored_after: Duration,
}

impl Manager {
    /// Create a manager with the default grace periods: an agent is
    /// `unknown` after three missed ping intervals and `errored` after
    /// ten.
    pub fn new(service: Arc<Service>, ping_interval: Duration) -> Self {
        Self {
            service,
            ping_interval,
            unknown_after: ping_interval * 3,
            errored_after: ping_interval * 10,
        }
    }

    /// Create a manager with explicit grace periods.
    pub fn with_timeouts(
        service: Arc<Service>,
        ping_interval: Duration,
        unknown_after: Duration,
        errored_after: Duration,
    ) -> Self {
        Self {
            service,
            ping_interval,
            unknown_after,
            errored_after,
        }
    }

    /// Run heartbeat checks until shutdown is signaled.
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        debug!(
            unknown_after = ?self.unknown_after,
            errored_after = ?self.errored_after,
            "manager started"
        );
        let mut tick = tokio::time::interval(self.ping_interval);
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = tick.tick() => {
                    if let Err(err) = self.check().await {
                        warn!(error = %err, "heartbeat check failed");
                    }
                }
            }
        }
        debug!("manager stopped");
        Ok(())
    }

    /// Examine every non-terminal agent and promote the silent ones.
    async fn check(&self) -> Result<()> {
        let now = Utc::now();
        for agent in self.service.db().list_agents().await? {
            if agent.status.is_terminal() {
                continue;
            }
            let silent_for = (now - agent.last_ping_at).to_std().unwrap_or_default();
            let promote_to = match agent.status {
                AgentStatus::Unknown if silent_for > self.errored_after => AgentStatus::Errored,
                AgentStatus::Idle | AgentStatus::Busy if silent_for > self.unknown_after => {
                    AgentStatus::Unknown
                }
                _ => continue,
            };
            info!(
                agent_id = %agent.id,
                from = %agent.status,
                to = %promote_to,
                silent_for = ?silent_for,
                "promoting unresponsive agent"
            );
            if let Err(err) = self
                .service
                .update_agent_status(&Subject::Manager, agent.id, promote_to)
                .await
            {
                warn!(agent_id = %agent.id, error = %err, "failed to promote agent");
            }
        }
        Ok(())
    }
}
