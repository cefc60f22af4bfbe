//! Turn: one agent execution.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::delegation::DelegationConfig;
use crate::id::{generate_turn_id, now_ms};
use crate::policy::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Running,
    Completed,
    Failed,
    /// Ended early by an interrupt signal
    Interrupted,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnStatus::Running)
    }
}

/// Where a turn came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TurnOrigin {
    /// An iteration of a loop step
    Step { run_id: String, cycle: u32, step_index: usize, iteration: u32 },
    /// The child side of a spawn
    Spawn { spawn_id: String },
    /// Started directly, outside any loop
    Standalone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub origin: TurnOrigin,

    /// Capacity scope shared by every spawn under the same run
    pub scope_id: String,

    pub profile: String,
    pub agent: String,
    pub position: Position,
    pub role: Option<String>,

    /// Delegation policy this turn spawns under
    pub delegation: Option<DelegationConfig>,

    pub workdir: PathBuf,
    pub session_id: Option<String>,
    pub status: TurnStatus,
    pub exit_code: Option<i32>,

    /// Pending interrupt reason, consumed by the running turn
    pub interrupt: Option<String>,

    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl Turn {
    fn base(origin: TurnOrigin, scope_id: Option<String>, profile: &str, agent: &str, position: Position) -> Self {
        let id = generate_turn_id();
        Self {
            scope_id: scope_id.unwrap_or_else(|| id.clone()),
            id,
            origin,
            profile: profile.to_string(),
            agent: agent.to_string(),
            position,
            role: None,
            delegation: None,
            workdir: PathBuf::new(),
            session_id: None,
            status: TurnStatus::Running,
            exit_code: None,
            interrupt: None,
            started_at: now_ms(),
            ended_at: None,
        }
    }

    /// A turn for one iteration of a loop step.
    pub fn for_step(
        run_id: &str,
        cycle: u32,
        step_index: usize,
        iteration: u32,
        profile: &str,
        agent: &str,
        position: Position,
    ) -> Self {
        let origin = TurnOrigin::Step {
            run_id: run_id.to_string(),
            cycle,
            step_index,
            iteration,
        };
        Self::base(origin, Some(run_id.to_string()), profile, agent, position)
    }

    /// The child turn of a spawn; shares the parent's capacity scope.
    pub fn for_spawn(spawn_id: &str, scope_id: &str, profile: &str, agent: &str, position: Position) -> Self {
        let origin = TurnOrigin::Spawn {
            spawn_id: spawn_id.to_string(),
        };
        Self::base(origin, Some(scope_id.to_string()), profile, agent, position)
    }

    /// A turn outside any loop; it is its own capacity scope.
    pub fn standalone(profile: &str, agent: &str, position: Position) -> Self {
        Self::base(TurnOrigin::Standalone, None, profile, agent, position)
    }

    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    pub fn with_delegation(mut self, delegation: Option<DelegationConfig>) -> Self {
        self.delegation = delegation;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn run_id(&self) -> Option<&str> {
        match &self.origin {
            TurnOrigin::Step { run_id, .. } => Some(run_id),
            _ => None,
        }
    }

    pub fn step_index(&self) -> Option<usize> {
        match &self.origin {
            TurnOrigin::Step { step_index, .. } => Some(*step_index),
            _ => None,
        }
    }

    pub fn spawn_id(&self) -> Option<&str> {
        match &self.origin {
            TurnOrigin::Spawn { spawn_id } => Some(spawn_id),
            _ => None,
        }
    }

    pub fn finish(&mut self, status: TurnStatus, exit_code: Option<i32>) {
        self.status = status;
        self.exit_code = exit_code;
        self.ended_at = Some(now_ms());
    }
}
