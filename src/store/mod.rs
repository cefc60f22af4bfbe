//! Storage layer for crewloop.
//!
//! The [`Store`] trait is the authoritative state shared by the controller,
//! the spawn coordinator and CLI commands issued from inside agent sessions.
//! Every operation is an atomic single-record read or update; the `modify_*`
//! methods apply a closure under the same lock (or transaction) that reads
//! the record, so concurrent writers never lose each other's fields.
//!
//! Two implementations:
//! - [`MemoryStore`]: in-process, for tests and embedding
//! - [`SqliteStore`]: JSON payload columns with indexed keys, one database per project

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, compute_project_hash};

use crate::domain::{CallSupervisor, LoopMessage, LoopRun, SpawnRecord, Turn};
use crate::error::{CrewError, Result};

pub trait Store: Send + Sync {
    //=== Loop runs ===
    fn create_loop_run(&self, run: &LoopRun) -> Result<()>;
    fn update_loop_run(&self, run: &LoopRun) -> Result<()>;
    fn get_loop_run(&self, id: &str) -> Result<Option<LoopRun>>;
    /// All runs, oldest first.
    fn list_loop_runs(&self) -> Result<Vec<LoopRun>>;
    fn modify_loop_run(&self, id: &str, f: &mut dyn FnMut(&mut LoopRun)) -> Result<LoopRun>;

    //=== Turns ===
    fn create_turn(&self, turn: &Turn) -> Result<()>;
    fn update_turn(&self, turn: &Turn) -> Result<()>;
    fn get_turn(&self, id: &str) -> Result<Option<Turn>>;
    /// Step turns of a run, in creation order.
    fn list_turns(&self, run_id: &str) -> Result<Vec<Turn>>;
    fn modify_turn(&self, id: &str, f: &mut dyn FnMut(&mut Turn)) -> Result<Turn>;

    //=== Spawns ===
    fn create_spawn(&self, spawn: &SpawnRecord) -> Result<()>;
    fn update_spawn(&self, spawn: &SpawnRecord) -> Result<()>;
    fn get_spawn(&self, id: &str) -> Result<Option<SpawnRecord>>;
    fn spawns_by_parent(&self, turn_id: &str) -> Result<Vec<SpawnRecord>>;
    fn spawns_in_scope(&self, scope_id: &str) -> Result<Vec<SpawnRecord>>;
    /// Apply `f` atomically. The closure may refuse the change by returning an error.
    fn modify_spawn(&self, id: &str, f: &mut dyn FnMut(&mut SpawnRecord) -> Result<()>) -> Result<SpawnRecord>;

    //=== Loop messages ===
    /// Messages of a run with id greater than `after_id`, ascending.
    fn list_loop_messages(&self, run_id: &str, after_id: i64) -> Result<Vec<LoopMessage>>;
    fn post_loop_message(&self, run_id: &str, step_index: usize, author: &str, body: &str) -> Result<LoopMessage>;

    //=== Signals ===
    fn signal_loop_stop(&self, run_id: &str) -> Result<()> {
        self.modify_loop_run(run_id, &mut |run| run.signals.stop = true)?;
        Ok(())
    }

    fn signal_loop_wind_down(&self, run_id: &str) -> Result<()> {
        self.modify_loop_run(run_id, &mut |run| run.signals.wind_down = true)?;
        Ok(())
    }

    fn signal_loop_call_supervisor(&self, run_id: &str, call: CallSupervisor) -> Result<()> {
        self.modify_loop_run(run_id, &mut |run| run.signals.call_supervisor = Some(call.clone()))?;
        Ok(())
    }

    fn signal_interrupt(&self, turn_id: &str, reason: &str) -> Result<()> {
        self.modify_turn(turn_id, &mut |turn| turn.interrupt = Some(reason.to_string()))?;
        Ok(())
    }

    /// Consume a pending interrupt for a turn.
    fn take_interrupt(&self, turn_id: &str) -> Result<Option<String>> {
        let mut taken = None;
        self.modify_turn(turn_id, &mut |turn| taken = turn.interrupt.take())?;
        Ok(taken)
    }

    fn is_loop_stopped(&self, run_id: &str) -> Result<bool> {
        let run = self
            .get_loop_run(run_id)?
            .ok_or_else(|| CrewError::NotFound(format!("loop run {run_id}")))?;
        Ok(run.signals.stop || run.status.is_terminal())
    }
}
