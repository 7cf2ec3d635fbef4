// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent pools.
//!
//! A pool is a named collection of agents scoped to one organization. A
//! workspace may only execute runs on a pool if the pool is
//! organization-scoped or the workspace has been explicitly granted
//! access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::workspace::WorkspaceId;

/// Identifier of an agent pool.
pub type PoolId = Uuid;

/// A named collection of agents belonging to one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    /// Unique pool identifier.
    pub id: PoolId,
    /// Human-readable pool name, unique within the organization.
    pub name: String,
    /// Owning organization.
    pub organization: String,
    /// When true every workspace in the organization may use the pool;
    /// when false only workspaces in `allowed_workspaces` may.
    pub organization_scoped: bool,
    /// Workspaces explicitly granted access to the pool.
    pub allowed_workspaces: Vec<WorkspaceId>,
    /// Workspaces currently configured to use the pool. A pool with a
    /// non-empty assignment set cannot be deleted.
    pub assigned_workspaces: Vec<WorkspaceId>,
    /// When the pool was created.
    pub created_at: DateTime<Utc>,
}

/// Options for creating an agent pool.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePoolOptions {
    /// Pool name.
    pub name: String,
    /// Owning organization.
    pub organization: String,
    /// Whether every workspace in the organization may use the pool.
    #[serde(default)]
    pub organization_scoped: bool,
    /// Workspaces explicitly granted access.
    #[serde(default)]
    pub allowed_workspaces: Vec<WorkspaceId>,
}

/// Options for updating an agent pool. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePoolOptions {
    /// New pool name.
    pub name: Option<String>,
    /// New organization-scoped flag.
    pub organization_scoped: Option<bool>,
    /// Replacement set of explicitly granted workspaces.
    pub allowed_workspaces: Option<Vec<WorkspaceId>>,
}

impl Pool {
    /// Construct a new pool from creation options.
    pub fn new(opts: CreatePoolOptions) -> Result<Self> {
        if opts.name.trim().is_empty() {
            return Err(CoreError::InvalidArgument {
                field: "name",
                message: "pool name must not be empty".to_string(),
            });
        }
        if opts.organization.trim().is_empty() {
            return Err(CoreError::InvalidArgument {
                field: "organization",
                message: "organization must not be empty".to_string(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name: opts.name,
            organization: opts.organization,
            organization_scoped: opts.organization_scoped,
            allowed_workspaces: opts.allowed_workspaces,
            assigned_workspaces: Vec::new(),
            created_at: Utc::now(),
        })
    }

    /// Skeleton pool carrying only the identifier, published for delete
    /// notifications.
    pub fn skeleton(id: PoolId) -> Self {
        Self {
            id,
            name: String::new(),
            organization: String::new(),
            organization_scoped: false,
            allowed_workspaces: Vec::new(),
            assigned_workspaces: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Apply update options in place.
    pub fn update(&mut self, opts: UpdatePoolOptions) -> Result<()> {
        if let Some(name) = opts.name {
            if name.trim().is_empty() {
                return Err(CoreError::InvalidArgument {
                    field: "name",
                    message: "pool name must not be empty".to_string(),
                });
            }
            self.name = name;
        }
        if let Some(scoped) = opts.organization_scoped {
            self.organization_scoped = scoped;
        }
        if let Some(allowed) = opts.allowed_workspaces {
            self.allowed_workspaces = allowed;
        }
        Ok(())
    }

    /// Whether the given workspace may execute runs on this pool.
    pub fn allows(&self, workspace_id: WorkspaceId) -> bool {
        self.organization_scoped || self.allowed_workspaces.contains(&workspace_id)
    }
}
