//! In-memory Store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::Store;
use crate::domain::{LoopMessage, LoopRun, SpawnRecord, Turn};
use crate::error::{CrewError, Result};
use crate::id::now_ms;

#[derive(Default)]
struct Inner {
    runs: HashMap<String, LoopRun>,
    turns: HashMap<String, Turn>,
    spawns: HashMap<String, SpawnRecord>,
    messages: Vec<LoopMessage>,
    // Insertion order, used to list records oldest first
    run_order: Vec<String>,
    turn_order: Vec<String>,
    spawn_order: Vec<String>,
    next_message_id: i64,
}

/// Store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| CrewError::Storage("memory store lock poisoned".to_string()))
    }
}

fn not_found(kind: &str, id: &str) -> CrewError {
    CrewError::NotFound(format!("{kind} {id}"))
}

impl Store for MemoryStore {
    fn create_loop_run(&self, run: &LoopRun) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.runs.insert(run.id.clone(), run.clone()).is_none() {
            inner.run_order.push(run.id.clone());
        }
        Ok(())
    }

    fn update_loop_run(&self, run: &LoopRun) -> Result<()> {
        let mut inner = self.lock()?;
        let slot = inner.runs.get_mut(&run.id).ok_or_else(|| not_found("loop run", &run.id))?;
        *slot = run.clone();
        Ok(())
    }

    fn get_loop_run(&self, id: &str) -> Result<Option<LoopRun>> {
        Ok(self.lock()?.runs.get(id).cloned())
    }

    fn list_loop_runs(&self) -> Result<Vec<LoopRun>> {
        let inner = self.lock()?;
        Ok(inner.run_order.iter().filter_map(|id| inner.runs.get(id).cloned()).collect())
    }

    fn modify_loop_run(&self, id: &str, f: &mut dyn FnMut(&mut LoopRun)) -> Result<LoopRun> {
        let mut inner = self.lock()?;
        let run = inner.runs.get_mut(id).ok_or_else(|| not_found("loop run", id))?;
        f(run);
        run.updated_at = now_ms();
        Ok(run.clone())
    }

    fn create_turn(&self, turn: &Turn) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.turns.insert(turn.id.clone(), turn.clone()).is_none() {
            inner.turn_order.push(turn.id.clone());
        }
        Ok(())
    }

    fn update_turn(&self, turn: &Turn) -> Result<()> {
        let mut inner = self.lock()?;
        let slot = inner.turns.get_mut(&turn.id).ok_or_else(|| not_found("turn", &turn.id))?;
        *slot = turn.clone();
        Ok(())
    }

    fn get_turn(&self, id: &str) -> Result<Option<Turn>> {
        Ok(self.lock()?.turns.get(id).cloned())
    }

    fn list_turns(&self, run_id: &str) -> Result<Vec<Turn>> {
        let inner = self.lock()?;
        Ok(inner
            .turn_order
            .iter()
            .filter_map(|id| inner.turns.get(id))
            .filter(|t| t.run_id() == Some(run_id))
            .cloned()
            .collect())
    }

    fn modify_turn(&self, id: &str, f: &mut dyn FnMut(&mut Turn)) -> Result<Turn> {
        let mut inner = self.lock()?;
        let turn = inner.turns.get_mut(id).ok_or_else(|| not_found("turn", id))?;
        f(turn);
        Ok(turn.clone())
    }

    fn create_spawn(&self, spawn: &SpawnRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.spawns.insert(spawn.id.clone(), spawn.clone()).is_none() {
            inner.spawn_order.push(spawn.id.clone());
        }
        Ok(())
    }

    fn update_spawn(&self, spawn: &SpawnRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let slot = inner.spawns.get_mut(&spawn.id).ok_or_else(|| not_found("spawn", &spawn.id))?;
        *slot = spawn.clone();
        Ok(())
    }

    fn get_spawn(&self, id: &str) -> Result<Option<SpawnRecord>> {
        Ok(self.lock()?.spawns.get(id).cloned())
    }

    fn spawns_by_parent(&self, turn_id: &str) -> Result<Vec<SpawnRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .spawn_order
            .iter()
            .filter_map(|id| inner.spawns.get(id))
            .filter(|s| s.parent_turn_id == turn_id)
            .cloned()
            .collect())
    }

    fn spawns_in_scope(&self, scope_id: &str) -> Result<Vec<SpawnRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .spawn_order
            .iter()
            .filter_map(|id| inner.spawns.get(id))
            .filter(|s| s.scope_id == scope_id)
            .cloned()
            .collect())
    }

    fn modify_spawn(&self, id: &str, f: &mut dyn FnMut(&mut SpawnRecord) -> Result<()>) -> Result<SpawnRecord> {
        let mut inner = self.lock()?;
        let current = inner.spawns.get(id).ok_or_else(|| not_found("spawn", id))?;
        let mut draft = current.clone();
        f(&mut draft)?;
        inner.spawns.insert(id.to_string(), draft.clone());
        Ok(draft)
    }

    fn list_loop_messages(&self, run_id: &str, after_id: i64) -> Result<Vec<LoopMessage>> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.run_id == run_id && m.id > after_id)
            .cloned()
            .collect())
    }

    fn post_loop_message(&self, run_id: &str, step_index: usize, author: &str, body: &str) -> Result<LoopMessage> {
        let mut inner = self.lock()?;
        inner.next_message_id += 1;
        let message = LoopMessage {
            id: inner.next_message_id,
            run_id: run_id.to_string(),
            step_index,
            author: author.to_string(),
            body: body.to_string(),
            created_at: now_ms(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }
}
