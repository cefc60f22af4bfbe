//! Signal management for loop coordination
//!
//! SignalManager applies the escalation rights of the position/role policy
//! before writing stop, wind-down, call-supervisor and message signals into
//! the store. Commands issued from inside an agent session act as the turn
//! that session belongs to; commands from a terminal act as the operator,
//! who is not bound by step rights.

use std::sync::Arc;

use crate::domain::{CallSupervisor, LoopMessage, LoopRun, LoopStep, Turn, TurnStatus};
use crate::error::{CrewError, Result};
use crate::id::now_ms;
use crate::policy::Position;
use crate::store::Store;

/// Who is asking.
#[derive(Debug, Clone, PartialEq)]
pub enum Caller {
    Operator,
    Turn(Turn),
}

impl Caller {
    /// Resolve the caller from an optional turn id (normally `CREWLOOP_TURN_ID`).
    pub fn resolve(store: &dyn Store, turn_id: Option<&str>) -> Result<Self> {
        match turn_id.map(str::trim).filter(|id| !id.is_empty()) {
            None => Ok(Caller::Operator),
            Some(id) => store
                .get_turn(id)?
                .map(Caller::Turn)
                .ok_or_else(|| CrewError::NotFound(format!("turn {id}"))),
        }
    }

    pub fn turn(&self) -> Option<&Turn> {
        match self {
            Caller::Operator => None,
            Caller::Turn(turn) => Some(turn),
        }
    }

    /// Explicit run id, else the run the calling step turn belongs to.
    pub fn run_id(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        self.turn()
            .and_then(Turn::run_id)
            .map(String::from)
            .ok_or_else(|| CrewError::InvalidState("no loop run given and caller is not a loop step".to_string()))
    }

    fn label(&self) -> String {
        match self {
            Caller::Operator => "operator".to_string(),
            Caller::Turn(turn) => turn.profile.clone(),
        }
    }
}

/// Manages permission-checked signals against loop runs.
pub struct SignalManager {
    store: Arc<dyn Store>,
}

impl SignalManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn load_run(&self, run_id: &str) -> Result<LoopRun> {
        let run = self
            .store
            .get_loop_run(run_id)?
            .ok_or_else(|| CrewError::NotFound(format!("loop run {run_id}")))?;
        if run.status.is_terminal() {
            return Err(CrewError::InvalidState(format!("loop run {} is {}", run.id, run.status)));
        }
        Ok(run)
    }

    /// The step a turn caller runs, checked to belong to `run`.
    fn caller_step<'a>(&self, caller: &Turn, run: &'a LoopRun) -> Result<(usize, &'a LoopStep)> {
        if caller.run_id() != Some(run.id.as_str()) {
            return Err(CrewError::Policy(format!(
                "turn {} is not a step of loop run {}",
                caller.id, run.id
            )));
        }
        let index = caller.step_index().unwrap_or(run.step_index);
        run.definition
            .steps
            .get(index)
            .map(|step| (index, step))
            .ok_or_else(|| CrewError::InvalidState(format!("loop run {} has no step {}", run.id, index)))
    }

    /// Request that the run stop after the current step.
    pub fn stop(&self, caller: &Caller, run_id: &str) -> Result<()> {
        let run = self.load_run(run_id)?;
        if let Caller::Turn(turn) = caller {
            let (index, step) = self.caller_step(turn, &run)?;
            if !turn.position.can_stop_loop() {
                return Err(CrewError::Policy(format!("{} position cannot stop the loop", turn.position)));
            }
            if !step.can_stop {
                return Err(CrewError::Policy(format!("step {index} is not allowed to stop the loop")));
            }
        }
        self.store.signal_loop_stop(&run.id)?;
        tracing::info!(run_id = %run.id, caller = %caller.label(), "Stop requested");
        Ok(())
    }

    /// Request that the run finish its current step and then stop.
    pub fn wind_down(&self, caller: &Caller, run_id: &str) -> Result<()> {
        let run = self.load_run(run_id)?;
        if let Caller::Turn(turn) = caller {
            self.caller_step(turn, &run)?;
            if turn.position != Position::Supervisor {
                return Err(CrewError::Policy(format!("{} position cannot wind down the loop", turn.position)));
            }
        }
        self.store.signal_loop_wind_down(&run.id)?;
        tracing::info!(run_id = %run.id, caller = %caller.label(), "Wind-down requested");
        Ok(())
    }

    /// Post an inter-step message.
    pub fn post_message(&self, caller: &Caller, run_id: &str, body: &str) -> Result<LoopMessage> {
        if body.trim().is_empty() {
            return Err(CrewError::InvalidState("message body is empty".to_string()));
        }
        let run = self.load_run(run_id)?;
        let step_index = match caller {
            Caller::Operator => run.step_index,
            Caller::Turn(turn) => {
                let (index, step) = self.caller_step(turn, &run)?;
                if !turn.position.can_post_messages() {
                    return Err(CrewError::Policy(format!("{} position cannot post loop messages", turn.position)));
                }
                if !step.can_message {
                    return Err(CrewError::Policy(format!("step {index} is not allowed to post loop messages")));
                }
                index
            }
        };
        let message = self
            .store
            .post_loop_message(&run.id, step_index, &caller.label(), body.trim())?;
        tracing::info!(run_id = %run.id, message_id = message.id, author = %message.author, "Loop message posted");
        Ok(message)
    }

    /// Escalate to a supervisor step.
    ///
    /// `target` must name a supervisor step; without it the controller jumps
    /// to the nearest following one. The calling turn is interrupted so the
    /// jump happens without waiting for the session to finish on its own.
    pub fn call_supervisor(
        &self,
        caller: &Caller,
        run_id: &str,
        target: Option<usize>,
        reason: &str,
    ) -> Result<()> {
        let run = self.load_run(run_id)?;
        if let Some(target) = target {
            let is_supervisor = run
                .definition
                .steps
                .get(target)
                .is_some_and(|s| s.effective_position() == Position::Supervisor);
            if !is_supervisor {
                return Err(CrewError::Policy(format!("step {target} is not a supervisor step")));
            }
        }

        let (from_step, interrupt_turn) = match caller {
            Caller::Turn(turn) => {
                let (index, _) = self.caller_step(turn, &run)?;
                if !turn.position.can_call_supervisor() {
                    return Err(CrewError::Policy(format!("{} position cannot call the supervisor", turn.position)));
                }
                (index, Some(turn.id.clone()))
            }
            Caller::Operator => {
                let running = self
                    .store
                    .list_turns(&run.id)?
                    .into_iter()
                    .rev()
                    .find(|t| t.status == TurnStatus::Running)
                    .map(|t| t.id);
                (run.step_index, running)
            }
        };

        let call = CallSupervisor {
            from_step,
            target,
            reason: reason.to_string(),
            requested_at: now_ms(),
        };
        self.store.signal_loop_call_supervisor(&run.id, call)?;
        if let Some(turn_id) = interrupt_turn {
            let note = if reason.is_empty() { "supervisor called" } else { reason };
            self.store.signal_interrupt(&turn_id, note)?;
        }
        tracing::info!(run_id = %run.id, from_step, target = ?target, caller = %caller.label(), "Supervisor called");
        Ok(())
    }
}
