// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller identities.
//!
//! Every service call carries a [`Subject`] describing who the caller is.
//! Agents arrive unregistered (bearing only a token), then registered;
//! jobs call back with the token minted at start; users act through the
//! admin API; the manager is an internal caller.

use std::fmt;

use crate::agent::AgentId;
use crate::error::{CoreError, Result};
use crate::job::JobSpec;
use crate::pool::PoolId;
use crate::token::TokenId;

/// The authenticated identity attached to a service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// A server-embedded agent that has not registered yet.
    UnregisteredServerAgent,
    /// A pool agent that authenticated with an agent token but has not
    /// registered yet.
    UnregisteredPoolAgent {
        /// Pool the agent token belongs to.
        pool_id: PoolId,
        /// The agent token used to authenticate.
        token_id: TokenId,
    },
    /// A registered server-embedded agent.
    ServerAgent {
        /// The agent's identifier.
        agent_id: AgentId,
    },
    /// A registered pool agent.
    PoolAgent {
        /// The agent's identifier.
        agent_id: AgentId,
        /// Pool the agent belongs to.
        pool_id: PoolId,
    },
    /// A job calling back with its job token.
    Job(JobSpec),
    /// A user acting through the admin API.
    User {
        /// The user's name, as resolved by the token layer.
        username: String,
    },
    /// The internal manager loop.
    Manager,
}

impl Subject {
    /// The agent identifier, when the subject is a registered agent.
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            Subject::ServerAgent { agent_id } | Subject::PoolAgent { agent_id, .. } => {
                Some(*agent_id)
            }
            _ => None,
        }
    }

    /// Whether the subject is a registered agent with the given ID.
    pub fn is_agent(&self, agent_id: AgentId) -> bool {
        self.agent_id() == Some(agent_id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::UnregisteredServerAgent => write!(f, "unregistered-server-agent"),
            Subject::UnregisteredPoolAgent { pool_id, .. } => {
                write!(f, "unregistered-pool-agent:{}", pool_id)
            }
            Subject::ServerAgent { agent_id } => write!(f, "agent:{}", agent_id),
            Subject::PoolAgent { agent_id, .. } => write!(f, "agent:{}", agent_id),
            Subject::Job(spec) => write!(f, "job:{}", spec),
            Subject::User { username } => write!(f, "user:{}", username),
            Subject::Manager => write!(f, "manager"),
        }
    }
}

/// Authorizes organization-scoped admin actions.
///
/// Fine-grained role checks live in the external token layer; by the time
/// a request carries a [`Subject::User`] it has already been resolved by
/// that layer, so this authorizer only rejects non-user callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrganizationAuthorizer;

impl OrganizationAuthorizer {
    /// Check that the subject may administer resources in the given
    /// organization.
    pub fn can_access(&self, subject: &Subject, organization: &str) -> Result<()> {
        match subject {
            Subject::User { .. } | Subject::Manager => {
                tracing::debug!(%subject, organization, "authorized organization access");
                Ok(())
            }
            _ => Err(CoreError::AccessNotPermitted),
        }
    }
}
