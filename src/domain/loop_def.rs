//! Loop definitions: a named, ordered list of steps.

use serde::{Deserialize, Serialize};

use crate::delegation::DelegationConfig;
use crate::error::{CrewError, Result};
use crate::policy::Position;

/// A named workflow that a [`LoopRun`](super::LoopRun) cycles through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoopDefinition {
    pub name: String,

    pub description: Option<String>,

    /// Default cycle limit for runs of this loop; 0 is unbounded.
    pub max_cycles: u32,

    pub steps: Vec<LoopStep>,
}

/// One step of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoopStep {
    /// Profile that runs this step
    pub profile: String,

    /// Position override; lead when unset
    pub position: Option<String>,

    pub role: Option<String>,

    /// Turns per visit
    pub turns: u32,

    pub instructions: String,

    /// A stop signal may end the run at this step
    pub can_stop: bool,

    /// The step may post loop messages
    pub can_message: bool,

    /// The step may send push notifications
    pub can_pushover: bool,

    /// Named team from the catalog
    pub team: Option<String>,

    /// Inline delegation; takes precedence over `team`
    pub delegation: Option<DelegationConfig>,

    /// Every turn starts a fresh session instead of resuming the previous one
    pub standalone_chat: bool,
}

impl Default for LoopStep {
    fn default() -> Self {
        Self {
            profile: String::new(),
            position: None,
            role: None,
            turns: 1,
            instructions: String::new(),
            can_stop: false,
            can_message: false,
            can_pushover: false,
            team: None,
            delegation: None,
            standalone_chat: false,
        }
    }
}

impl LoopStep {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Default::default()
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position.as_str().to_string());
        self
    }

    pub fn with_turns(mut self, turns: u32) -> Self {
        self.turns = turns;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_can_stop(mut self, can_stop: bool) -> Self {
        self.can_stop = can_stop;
        self
    }

    pub fn with_can_message(mut self, can_message: bool) -> Self {
        self.can_message = can_message;
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_delegation(mut self, delegation: DelegationConfig) -> Self {
        self.delegation = Some(delegation);
        self
    }

    pub fn effective_position(&self) -> Position {
        Position::for_step(self.position.as_deref())
    }

    /// Turns per visit, at least one.
    pub fn effective_turns(&self) -> u32 {
        self.turns.max(1)
    }

    /// Whether a team or inline delegation is attached.
    pub fn has_team(&self) -> bool {
        self.team.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.delegation.as_ref().is_some_and(|d| !d.is_empty())
    }
}

impl LoopDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<LoopStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            ..Default::default()
        }
    }

    pub fn with_max_cycles(mut self, max_cycles: u32) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    /// Indices of supervisor-position steps, in order.
    pub fn supervisor_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.effective_position() == Position::Supervisor)
            .map(|(i, _)| i)
            .collect()
    }

    /// Structural validation that needs no catalog: non-empty steps, known
    /// positions, team attachment rules and inline delegation trees.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(CrewError::Config(format!("loop {:?} has no steps", self.name)));
        }
        for (index, step) in self.steps.iter().enumerate() {
            let context = |msg: String| CrewError::Config(format!("loop {:?} step {}: {}", self.name, index, msg));
            if step.profile.trim().is_empty() {
                return Err(context("missing profile".to_string()));
            }
            if let Some(raw) = step.position.as_deref()
                && !raw.trim().is_empty()
                && Position::parse(raw).is_none()
            {
                return Err(context(format!("unknown position {raw:?}")));
            }
            step.effective_position()
                .check_step(step.has_team())
                .map_err(|e| context(e.to_string()))?;
            if let Some(delegation) = &step.delegation {
                delegation.validate().map_err(|e| context(e.to_string()))?;
            }
        }
        Ok(())
    }
}
