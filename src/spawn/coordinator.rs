//! Parent-facing spawn operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::admission::{self, Limits};
use super::{BranchManager, ChildLauncher, SpawnRequest, WaitResult};
use crate::config::Catalog;
use crate::delegation::{DelegationError, SpawnQuery};
use crate::domain::{InboxKind, SpawnRecord, SpawnStatus, Turn};
use crate::error::{CrewError, Result};
use crate::store::Store;

/// Terminal children of `turn_id` the turn has not been told about; marks them reported.
pub(crate) fn take_finished(store: &dyn Store, turn_id: &str) -> Result<Vec<SpawnRecord>> {
    let mut finished = Vec::new();
    for spawn in store.spawns_by_parent(turn_id)? {
        if spawn.status.is_terminal() && !spawn.reported {
            finished.push(store.modify_spawn(&spawn.id, &mut |s| {
                s.reported = true;
                Ok(())
            })?);
        }
    }
    Ok(finished)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    Any,
    All,
}

pub struct SpawnCoordinator {
    store: Arc<dyn Store>,
    catalog: Arc<Catalog>,
    launcher: Arc<dyn ChildLauncher>,
    branches: Option<Arc<dyn BranchManager>>,
    poll_interval: Duration,
}

impl SpawnCoordinator {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<Catalog>, launcher: Arc<dyn ChildLauncher>) -> Self {
        let poll_interval = catalog.poll_interval();
        Self {
            store,
            catalog,
            launcher,
            branches: None,
            poll_interval,
        }
    }

    /// Give writable spawns isolated branches.
    pub fn with_branches(mut self, branches: Arc<dyn BranchManager>) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn turn(&self, turn_id: &str) -> Result<Turn> {
        self.store
            .get_turn(turn_id)?
            .ok_or_else(|| CrewError::NotFound(format!("turn {turn_id}")))
    }

    /// Load a spawn, checking that `owner` (when given) is its parent turn.
    fn owned(&self, spawn_id: &str, owner: Option<&str>) -> Result<SpawnRecord> {
        let spawn = self
            .store
            .get_spawn(spawn_id)?
            .ok_or_else(|| CrewError::NotFound(format!("spawn {spawn_id}")))?;
        if let Some(owner) = owner
            && spawn.parent_turn_id != owner
        {
            return Err(CrewError::Policy(format!(
                "spawn {} does not belong to turn {}",
                spawn.id, owner
            )));
        }
        Ok(spawn)
    }

    /// Authorize, admit and start a child of `parent_turn_id`.
    pub fn spawn(&self, parent_turn_id: &str, request: SpawnRequest) -> Result<SpawnRecord> {
        let parent = self.turn(parent_turn_id)?;
        if !parent.position.can_spawn() {
            return Err(CrewError::Policy(format!("{} position cannot spawn", parent.position)));
        }
        let delegation = parent
            .delegation
            .as_ref()
            .filter(|d| !d.is_empty())
            .ok_or(DelegationError::NoDelegation)?;

        let mut query = SpawnQuery::new(&request.profile);
        if let Some(role) = request.role.as_deref() {
            query = query.role(role);
        }
        if let Some(position) = request.position {
            query = query.position(position);
        }
        let resolved = self.catalog.resolver().resolve(delegation, query)?;
        let (profile_name, profile) = self
            .catalog
            .profile(&resolved.option.profile)
            .ok_or_else(|| CrewError::Config(format!("unknown profile {:?}", resolved.option.profile)))?;

        let limits = Limits {
            max_parallel: self.catalog.effective_max_parallel(delegation),
            option_max: resolved.option.max_instances,
            profile_max: profile.max_instances,
        };
        admission::check(&self.store.spawns_in_scope(&parent.scope_id)?, &resolved, limits)?;

        let can_write = resolved
            .position
            .can_write(self.catalog.role_can_write(resolved.role.as_deref()));
        let mut record = SpawnRecord::new(
            &parent.id,
            &parent.scope_id,
            profile_name,
            resolved.position,
            &request.task,
        );
        record.role = resolved.role.clone();
        record.handoff = resolved.option.handoff;
        record.read_only = !can_write;

        let mut workdir = parent.workdir.clone();
        if can_write && let Some(branches) = &self.branches {
            let branch = branches.create(&record.id)?;
            workdir = branch.worktree.clone();
            record.branch = Some(branch.name);
            record.worktree = Some(branch.worktree);
        }

        let child = Turn::for_spawn(&record.id, &parent.scope_id, profile_name, &profile.agent, resolved.position)
            .with_role(resolved.role.clone())
            .with_delegation(resolved.option.delegation.clone())
            .with_workdir(workdir);
        record.child_turn_id = Some(child.id.clone());

        self.store.create_turn(&child)?;
        self.store.create_spawn(&record)?;
        tracing::info!(
            spawn_id = %record.id,
            parent_turn = %parent.id,
            profile = %record.profile,
            position = %record.position,
            role = ?record.role,
            read_only = record.read_only,
            "Spawn admitted"
        );

        if let Err(e) = self.launcher.launch(&record.id) {
            tracing::error!(spawn_id = %record.id, error = %e, "Spawn launch failed");
            self.store.modify_spawn(&record.id, &mut |s| {
                s.summary = Some(format!("launch failed: {e}"));
                s.transition(SpawnStatus::Failed)
            })?;
            return Err(e);
        }
        Ok(record)
    }

    /// Block until at least one child of `parent_turn_id` finishes or asks a new question.
    ///
    /// Returns at once when finished-but-unreported children exist, or when
    /// nothing is left running. Cancellation returns an empty result.
    pub async fn wait_any(
        &self,
        parent_turn_id: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitResult> {
        self.wait(parent_turn_id, timeout, cancel, WaitMode::Any).await
    }

    /// Block until every child of `parent_turn_id` is terminal.
    ///
    /// A new question from a child still ends the wait, since only the parent
    /// can unblock it. Children that finished before a timeout or
    /// cancellation are returned with it.
    pub async fn wait_all(
        &self,
        parent_turn_id: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitResult> {
        self.wait(parent_turn_id, timeout, cancel, WaitMode::All).await
    }

    async fn wait(
        &self,
        parent_turn_id: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mode: WaitMode,
    ) -> Result<WaitResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut finished = Vec::new();
        loop {
            finished.extend(take_finished(self.store.as_ref(), parent_turn_id)?);
            let mut awaiting = self.take_questions(parent_turn_id)?;
            let pending: Vec<SpawnRecord> = self
                .store
                .spawns_by_parent(parent_turn_id)?
                .into_iter()
                .filter(|s| !s.status.is_terminal())
                .collect();
            let more_pending = !pending.is_empty();

            // Every pending child is blocked on the parent, so nothing can change
            if awaiting.is_empty() && more_pending && pending.iter().all(|s| s.status == SpawnStatus::AwaitingInput) {
                awaiting = pending;
            }

            let satisfied = match mode {
                WaitMode::Any => !finished.is_empty(),
                WaitMode::All => !more_pending,
            };
            if satisfied || !awaiting.is_empty() || !more_pending {
                return Ok(WaitResult {
                    finished,
                    awaiting,
                    more_pending,
                    timed_out: false,
                });
            }

            let sleep = tokio::time::sleep(self.poll_interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(WaitResult { finished, more_pending, ..Default::default() });
                }
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    return Ok(WaitResult { finished, more_pending, timed_out: true, ..Default::default() });
                }
                _ = sleep => {}
            }
        }
    }

    /// Children awaiting input whose question the parent has not seen; marks them seen.
    fn take_questions(&self, parent_turn_id: &str) -> Result<Vec<SpawnRecord>> {
        let mut asked = Vec::new();
        for spawn in self.store.spawns_by_parent(parent_turn_id)? {
            if spawn.status == SpawnStatus::AwaitingInput && !spawn.question_reported {
                asked.push(self.store.modify_spawn(&spawn.id, &mut |s| {
                    s.question_reported = true;
                    Ok(())
                })?);
            }
        }
        Ok(asked)
    }

    /// Children of a turn, in creation order.
    pub fn status(&self, parent_turn_id: &str) -> Result<Vec<SpawnRecord>> {
        self.store.spawns_by_parent(parent_turn_id)
    }

    pub fn get(&self, spawn_id: &str, owner: Option<&str>) -> Result<SpawnRecord> {
        self.owned(spawn_id, owner)
    }

    /// Merge a completed writable spawn's branch into the project.
    pub fn merge(&self, spawn_id: &str, owner: Option<&str>) -> Result<SpawnRecord> {
        let spawn = self.owned(spawn_id, owner)?;
        if spawn.status != SpawnStatus::Completed {
            return Err(CrewError::InvalidState(format!("spawn {} is {}, not completed", spawn.id, spawn.status)));
        }
        if spawn.read_only || spawn.branch.is_none() {
            return Err(CrewError::InvalidState(format!("spawn {} has no branch to merge", spawn.id)));
        }
        let branches = self
            .branches
            .as_ref()
            .ok_or_else(|| CrewError::Branch("no branch manager configured".to_string()))?;
        branches.merge(&spawn.id)?;
        let merged = self.store.modify_spawn(&spawn.id, &mut |s| s.transition(SpawnStatus::Merged))?;
        tracing::info!(spawn_id = %spawn.id, "Spawn merged");
        Ok(merged)
    }

    /// Finalize a completed spawn as rejected, destroying its branch.
    pub fn reject(&self, spawn_id: &str, owner: Option<&str>) -> Result<SpawnRecord> {
        let spawn = self.owned(spawn_id, owner)?;
        if spawn.status != SpawnStatus::Completed {
            return Err(CrewError::InvalidState(format!("spawn {} is {}, not completed", spawn.id, spawn.status)));
        }
        if spawn.branch.is_some()
            && let Some(branches) = &self.branches
        {
            branches.discard(&spawn.id)?;
        }
        let rejected = self.store.modify_spawn(&spawn.id, &mut |s| s.transition(SpawnStatus::Rejected))?;
        tracing::info!(spawn_id = %spawn.id, "Spawn rejected");
        Ok(rejected)
    }

    /// Queue guidance for a running child; it is delivered when the child's session resumes.
    pub fn message(&self, spawn_id: &str, owner: Option<&str>, body: &str) -> Result<SpawnRecord> {
        let spawn = self.owned(spawn_id, owner)?;
        self.store.modify_spawn(&spawn.id, &mut |s| {
            if s.status.is_terminal() {
                return Err(CrewError::InvalidState(format!("spawn {} is {}", s.id, s.status)));
            }
            s.push_inbox(InboxKind::Message, body);
            Ok(())
        })
    }

    /// Preempt the child's current session. `reason` is delivered when it resumes.
    pub fn interrupt(&self, spawn_id: &str, owner: Option<&str>, reason: &str) -> Result<()> {
        let spawn = self.owned(spawn_id, owner)?;
        if spawn.status != SpawnStatus::Running {
            return Err(CrewError::InvalidState(format!("spawn {} is {}, not running", spawn.id, spawn.status)));
        }
        let child_turn = spawn
            .child_turn_id
            .as_deref()
            .ok_or_else(|| CrewError::InvalidState(format!("spawn {} has no child turn", spawn.id)))?;
        self.store.signal_interrupt(child_turn, reason)?;
        tracing::info!(spawn_id = %spawn.id, reason, "Spawn interrupted");
        Ok(())
    }

    /// Child side: suspend the spawn owning `child_turn_id` until the parent replies.
    pub fn ask(&self, child_turn_id: &str, question: &str) -> Result<SpawnRecord> {
        let turn = self.turn(child_turn_id)?;
        let spawn_id = turn
            .spawn_id()
            .ok_or_else(|| CrewError::InvalidState(format!("turn {} is not a spawn", turn.id)))?;
        let spawn = self.store.modify_spawn(spawn_id, &mut |s| {
            s.transition(SpawnStatus::AwaitingInput)?;
            s.question = Some(question.to_string());
            s.question_reported = false;
            Ok(())
        })?;
        tracing::info!(spawn_id = %spawn.id, "Spawn awaiting input");
        Ok(spawn)
    }

    /// Answer a child's pending question and let it continue.
    pub fn reply(&self, spawn_id: &str, owner: Option<&str>, body: &str) -> Result<SpawnRecord> {
        let spawn = self.owned(spawn_id, owner)?;
        self.store.modify_spawn(&spawn.id, &mut |s| {
            if s.status != SpawnStatus::AwaitingInput {
                return Err(CrewError::InvalidState(format!("spawn {} is {}, not awaiting input", s.id, s.status)));
            }
            s.transition(SpawnStatus::Running)?;
            s.question = None;
            s.question_reported = false;
            s.push_inbox(InboxKind::Reply, body);
            Ok(())
        })
    }

    /// Terminate a child. Its driver notices the status change and stops the session.
    pub fn cancel(&self, spawn_id: &str, owner: Option<&str>) -> Result<SpawnRecord> {
        let spawn = self.owned(spawn_id, owner)?;
        let canceled = self.store.modify_spawn(&spawn.id, &mut |s| s.transition(SpawnStatus::Canceled))?;
        if canceled.branch.is_some()
            && let Some(branches) = &self.branches
            && let Err(e) = branches.discard(&spawn.id)
        {
            tracing::warn!(spawn_id = %spawn.id, error = %e, "Branch cleanup failed");
        }
        tracing::info!(spawn_id = %spawn.id, "Spawn canceled");
        Ok(canceled)
    }

    /// Running, handoff-eligible children of a finished step turn. Read-only, so repeatable.
    pub fn collect_handoffs(&self, turn_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .spawns_by_parent(turn_id)?
            .into_iter()
            .filter(|s| s.handoff && !s.status.is_terminal())
            .map(|s| s.id)
            .collect())
    }

    /// Re-parent spawns onto `turn_id`. Already-reported spawns stay where they are.
    pub fn adopt(&self, spawn_ids: &[String], turn_id: &str) -> Result<Vec<SpawnRecord>> {
        let mut adopted = Vec::new();
        for id in spawn_ids {
            let Some(spawn) = self.store.get_spawn(id)? else {
                tracing::warn!(spawn_id = %id, "Handoff spawn vanished");
                continue;
            };
            if spawn.reported {
                continue;
            }
            adopted.push(self.store.modify_spawn(id, &mut |s| {
                s.parent_turn_id = turn_id.to_string();
                Ok(())
            })?);
        }
        if !adopted.is_empty() {
            tracing::debug!(turn_id, count = adopted.len(), "Adopted handoff spawns");
        }
        Ok(adopted)
    }

    /// Move every child of `from` the parent still needs to hear about onto `to`.
    pub fn carry_over(&self, from: &str, to: &str) -> Result<Vec<SpawnRecord>> {
        let ids: Vec<String> = self
            .store
            .spawns_by_parent(from)?
            .into_iter()
            .filter(|s| !s.status.is_terminal() || !s.reported)
            .map(|s| s.id)
            .collect();
        self.adopt(&ids, to)
    }

    /// Finished, unreported children of `turn_id`; marks them reported.
    pub fn take_finished(&self, turn_id: &str) -> Result<Vec<SpawnRecord>> {
        take_finished(self.store.as_ref(), turn_id)
    }
}
