// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs and the job lifecycle state machine.
//!
//! A job is the unit of work corresponding to one phase of one run,
//! executed by one agent.
//!
//! ```text
//! unallocated ──► allocated ──► running ──► finished
//!      │              │            │   └──► errored
//!      └──────────────┴────────────┴──────► canceled
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::error::{CoreError, Result};
use crate::pool::PoolId;
use crate::run::{Phase, Run, RunId};
use crate::workspace::WorkspaceId;

/// Lifecycle state of a job.
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
pub enum JobStatus {
    /// Waiting for the allocator to pick an agent.
    Unallocated,
    /// Assigned to an agent that has not started it yet.
    Allocated,
    /// Being executed by its agent.
    Running,
    /// Completed successfully. Terminal.
    Finished,
    /// Canceled before or during execution. Terminal.
    Canceled,
    /// Failed. Terminal.
    Errored,
}

impl JobStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Errored
        )
    }
}

/// Unique identity of a job: one phase of one run.
///
/// The canonical string form `<run_id>/<phase>` is the primary-key string
/// carried in job change notifications and embedded in job tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSpec {
    /// The run the job belongs to.
    pub run_id: RunId,
    /// The phase of the run the job executes.
    pub phase: Phase,
}

impl fmt::Display for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.phase)
    }
}

impl FromStr for JobSpec {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidArgument {
            field: "spec",
            message: format!("malformed job spec '{}'", s),
        };
        let (run_id, phase) = s.split_once('/').ok_or_else(invalid)?;
        Ok(Self {
            run_id: run_id.parse().map_err(|_| invalid())?,
            phase: phase.parse().map_err(|_| invalid())?,
        })
    }
}

/// Unit of work corresponding to one phase of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identity.
    pub spec: JobSpec,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Agent the job is or was assigned to; absent iff unallocated.
    pub agent_id: Option<AgentId>,
    /// Cancellation request attached to a running job; `Some(true)` means
    /// force-cancel.
    pub signaled: Option<bool>,
    /// Workspace the run belongs to, denormalized for allocation.
    pub workspace_id: WorkspaceId,
    /// Organization the workspace belongs to, denormalized for
    /// allocation.
    pub organization: String,
    /// Agent pool the workspace was configured with at job creation,
    /// denormalized for allocation.
    pub agent_pool_id: Option<PoolId>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Construct an unallocated job for the run's current phase.
    pub fn new(run: &Run) -> Self {
        Self {
            spec: JobSpec {
                run_id: run.id,
                phase: run.phase,
            },
            status: JobStatus::Unallocated,
            agent_id: None,
            signaled: None,
            workspace_id: run.workspace_id,
            organization: run.organization.clone(),
            agent_pool_id: run.agent_pool_id,
            created_at: Utc::now(),
        }
    }

    /// Skeleton job carrying only the identity, published for delete
    /// notifications.
    pub fn skeleton(spec: JobSpec) -> Self {
        Self {
            spec,
            status: JobStatus::Unallocated,
            agent_id: None,
            signaled: None,
            workspace_id: Uuid::nil(),
            organization: String::new(),
            agent_pool_id: None,
            created_at: Utc::now(),
        }
    }

    /// Assign the job to an agent.
    ///
    /// The caller is responsible for checking that the agent is healthy.
    pub fn allocate(&mut self, agent_id: AgentId) -> Result<()> {
        if self.status != JobStatus::Unallocated {
            return Err(CoreError::InvalidJobStateTransition {
                from: self.status,
                to: JobStatus::Allocated,
            });
        }
        self.status = JobStatus::Allocated;
        self.agent_id = Some(agent_id);
        Ok(())
    }

    /// Re-assign the job to another agent after its previous agent was
    /// declared dead or exited. A running job drops back to `allocated`
    /// so the new agent starts it afresh.
    pub fn reallocate(&mut self, agent_id: AgentId) -> Result<()> {
        if !matches!(self.status, JobStatus::Allocated | JobStatus::Running) {
            return Err(CoreError::InvalidJobStateTransition {
                from: self.status,
                to: JobStatus::Allocated,
            });
        }
        self.status = JobStatus::Allocated;
        self.agent_id = Some(agent_id);
        self.signaled = None;
        Ok(())
    }

    /// Mark the job as started by its assigned agent.
    pub fn start(&mut self) -> Result<()> {
        if self.status != JobStatus::Allocated {
            return Err(CoreError::InvalidJobStateTransition {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        self.status = JobStatus::Running;
        Ok(())
    }

    /// Finalize a running job with one of the terminal states.
    pub fn finish(&mut self, status: JobStatus) -> Result<()> {
        if self.status != JobStatus::Running || !status.is_terminal() {
            return Err(CoreError::InvalidJobStateTransition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        Ok(())
    }

    /// React to the run being canceled.
    ///
    /// A running job is signaled rather than terminated: `Some(force)` is
    /// recorded on the job and returned so the caller can log it, and the
    /// agent observes the signal on its next poll. A job that has not
    /// started yet is canceled outright: always when unallocated, and on
    /// force-cancel when allocated. Terminal jobs are left untouched.
    pub fn cancel(&mut self, run: &Run) -> Result<Option<bool>> {
        match self.status {
            JobStatus::Unallocated => {
                self.status = JobStatus::Canceled;
                Ok(None)
            }
            JobStatus::Allocated => {
                if run.force_canceled {
                    self.status = JobStatus::Canceled;
                }
                Ok(None)
            }
            JobStatus::Running => {
                self.signaled = Some(run.force_canceled);
                Ok(self.signaled)
            }
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Errored => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run {
            id: Uuid::new_v4(),
            phase: Phase::Plan,
            workspace_id: Uuid::new_v4(),
            organization: "acme".to_string(),
            agent_pool_id: None,
            force_canceled: false,
        }
    }

    #[test]
    fn spec_string_round_trip() {
        let spec = JobSpec {
            run_id: Uuid::new_v4(),
            phase: Phase::Apply,
        };
        let parsed: JobSpec = spec.to_string().parse().unwrap();
        assert_eq!(parsed, spec);
        assert!("not-a-spec".parse::<JobSpec>().is_err());
        assert!("bad-uuid/plan".parse::<JobSpec>().is_err());
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = Job::new(&run());
        assert_eq!(job.status, JobStatus::Unallocated);
        assert!(job.agent_id.is_none());

        let agent = Uuid::new_v4();
        job.allocate(agent).unwrap();
        assert_eq!(job.status, JobStatus::Allocated);
        assert_eq!(job.agent_id, Some(agent));

        job.start().unwrap();
        assert_eq!(job.status, JobStatus::Running);

        job.finish(JobStatus::Finished).unwrap();
        assert_eq!(job.status, JobStatus::Finished);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut job = Job::new(&run());
        assert!(job.start().is_err());
        assert!(job.finish(JobStatus::Finished).is_err());

        job.allocate(Uuid::new_v4()).unwrap();
        assert!(job.allocate(Uuid::new_v4()).is_err());
        assert!(job.finish(JobStatus::Errored).is_err());

        job.start().unwrap();
        assert!(job.start().is_err());
        // finish target must be terminal
        assert!(job.finish(JobStatus::Allocated).is_err());

        job.finish(JobStatus::Errored).unwrap();
        assert!(job.start().is_err());
        assert!(job.reallocate(Uuid::new_v4()).is_err());
    }

    #[test]
    fn reallocate_resets_running_job() {
        let mut job = Job::new(&run());
        job.allocate(Uuid::new_v4()).unwrap();
        job.start().unwrap();
        job.signaled = Some(false);

        let replacement = Uuid::new_v4();
        job.reallocate(replacement).unwrap();
        assert_eq!(job.status, JobStatus::Allocated);
        assert_eq!(job.agent_id, Some(replacement));
        assert!(job.signaled.is_none());
    }

    #[test]
    fn cancel_unallocated_job_is_terminal() {
        let mut job = Job::new(&run());
        assert_eq!(job.cancel(&run()).unwrap(), None);
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[test]
    fn cancel_allocated_job_requires_force() {
        let mut job = Job::new(&run());
        job.allocate(Uuid::new_v4()).unwrap();

        assert_eq!(job.cancel(&run()).unwrap(), None);
        assert_eq!(job.status, JobStatus::Allocated);

        let mut forced = run();
        forced.force_canceled = true;
        assert_eq!(job.cancel(&forced).unwrap(), None);
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[test]
    fn cancel_running_job_signals() {
        let mut job = Job::new(&run());
        job.allocate(Uuid::new_v4()).unwrap();
        job.start().unwrap();

        assert_eq!(job.cancel(&run()).unwrap(), Some(false));
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.signaled, Some(false));

        let mut forced = run();
        forced.force_canceled = true;
        assert_eq!(job.cancel(&forced).unwrap(), Some(true));
        assert_eq!(job.signaled, Some(true));
    }

    #[test]
    fn cancel_terminal_job_is_a_noop() {
        let mut job = Job::new(&run());
        job.cancel(&run()).unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.cancel(&run()).unwrap(), None);
        assert_eq!(job.status, JobStatus::Canceled);
    }
}
