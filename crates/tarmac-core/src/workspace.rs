// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quoted types from the workspace service.

use uuid::Uuid;

use crate::pool::PoolId;

/// Identifier of a workspace, owned by the workspace service.
pub type WorkspaceId = Uuid;

/// The subset of a workspace the orchestrator consults when validating
/// pool access. The workspace service passes this into
/// `check_workspace_pool_access` before creating or updating a workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Unique workspace identifier.
    pub id: WorkspaceId,
    /// Organization the workspace belongs to.
    pub organization: String,
    /// Agent pool the workspace wants to execute runs on, if any.
    pub agent_pool_id: Option<PoolId>,
}
