//! Spawn lifecycle
//!
//! A lead or manager turn spawns children: each child is a [`SpawnRecord`]
//! plus its own [`Turn`](crate::domain::Turn), driven to completion by a
//! [`SpawnDriver`] that a [`ChildLauncher`] starts. The
//! [`SpawnCoordinator`] is the parent-facing side: admission, waiting,
//! merge/reject, messaging, questions and handoff.

pub mod admission;
mod branch;
mod coordinator;
mod driver;
mod launcher;
mod poller;

pub use branch::{BranchManager, GitWorktrees, SpawnBranch};
pub use coordinator::SpawnCoordinator;
pub use driver::SpawnDriver;
pub use launcher::{ChildLauncher, ProcessLauncher, TaskLauncher};
pub use poller::{PollerHandle, SpawnPoller, SpawnSnapshot};

use thiserror::Error;

use crate::domain::SpawnRecord;
use crate::policy::Position;

/// A spawn request exceeded one of the three capacity counters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("run-wide spawn limit reached ({active}/{max} active)")]
    RunWide { active: u32, max: u32 },

    #[error("delegation option {profile:?} is at its limit ({active}/{max} active)")]
    PerOption { profile: String, active: u32, max: u32 },

    #[error("profile {profile:?} is at its limit ({active}/{max} active)")]
    PerProfile { profile: String, active: u32, max: u32 },
}

/// What a parent asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub profile: String,
    pub role: Option<String>,
    pub position: Option<Position>,
    pub task: String,
}

impl SpawnRequest {
    pub fn new(profile: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            role: None,
            position: None,
            task: task.into(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

/// Result of waiting on a turn's children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitResult {
    /// Children that became terminal since the parent last heard about them
    pub finished: Vec<SpawnRecord>,
    /// Children with a new question, or every blocked child when nothing else is running
    pub awaiting: Vec<SpawnRecord>,
    /// Whether any child is still running
    pub more_pending: bool,
    pub timed_out: bool,
}

impl WaitResult {
    pub fn is_empty(&self) -> bool {
        self.finished.is_empty() && self.awaiting.is_empty()
    }
}
