// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tarmac-core.
//!
//! Provides a unified error type that maps to API error responses.

use std::fmt;

use crate::agent::AgentStatus;
use crate::job::JobStatus;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while processing orchestration requests.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// An entity was not found in the database.
    ResourceNotFound {
        /// The kind of entity, e.g. "agent" or "job".
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The caller's identity does not permit the requested operation.
    AccessNotPermitted,

    /// The caller attempted to register an agent without an unregistered
    /// agent subject.
    UnauthorizedAgentRegistration,

    /// A job state-machine guard rejected the transition.
    InvalidJobStateTransition {
        /// State the job was in.
        from: JobStatus,
        /// State the caller asked for.
        to: JobStatus,
    },

    /// An agent state-machine guard rejected the transition.
    InvalidAgentStateTransition {
        /// State the agent was in.
        from: AgentStatus,
        /// State the caller asked for.
        to: AgentStatus,
    },

    /// Input validation failed.
    InvalidArgument {
        /// The field that failed validation.
        field: &'static str,
        /// The validation error message.
        message: String,
    },

    /// The pool is still referenced by one or more workspaces and cannot
    /// be deleted.
    PoolReferencedByWorkspaces,

    /// The workspace is not allowed to use the configured agent pool.
    WorkspaceNotAllowedToUsePool,

    /// A bearer token failed validation.
    InvalidToken,

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: &'static str,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::AccessNotPermitted => "ACCESS_NOT_PERMITTED",
            Self::UnauthorizedAgentRegistration => "UNAUTHORIZED_AGENT_REGISTRATION",
            Self::InvalidJobStateTransition { .. } => "INVALID_JOB_STATE_TRANSITION",
            Self::InvalidAgentStateTransition { .. } => "INVALID_AGENT_STATE_TRANSITION",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::PoolReferencedByWorkspaces => "POOL_REFERENCED_BY_WORKSPACES",
            Self::WorkspaceNotAllowedToUsePool => "WORKSPACE_NOT_ALLOWED_TO_USE_POOL",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error denotes a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceNotFound { resource, id } => {
                write!(f, "{} '{}' not found", resource, id)
            }
            Self::AccessNotPermitted => {
                write!(f, "access not permitted")
            }
            Self::UnauthorizedAgentRegistration => {
                write!(f, "subject is not an unregistered agent")
            }
            Self::InvalidJobStateTransition { from, to } => {
                write!(f, "invalid job state transition: {} -> {}", from, to)
            }
            Self::InvalidAgentStateTransition { from, to } => {
                write!(f, "invalid agent state transition: {} -> {}", from, to)
            }
            Self::InvalidArgument { field, message } => {
                write!(f, "invalid value for '{}': {}", field, message)
            }
            Self::PoolReferencedByWorkspaces => {
                write!(
                    f,
                    "agent pool is referenced by one or more workspaces and cannot be deleted"
                )
            }
            Self::WorkspaceNotAllowedToUsePool => {
                write!(f, "workspace is not allowed to use the agent pool")
            }
            Self::InvalidToken => {
                write!(f, "token validation failed")
            }
            Self::Database { operation, details } => {
                write!(f, "database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query",
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Database {
            operation: "json",
            details: err.to_string(),
        }
    }
}
