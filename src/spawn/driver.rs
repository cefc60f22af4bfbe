//! Child side of a spawn.
//!
//! The driver runs the child's sessions until the spawn settles: it resumes
//! the session whenever parent notes arrive, sits out `awaiting_input`
//! until a reply lands, and finally records completed or failed from the
//! last session's exit code.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::coordinator::take_finished;
use crate::agent::{AgentRunner, NoopObserver, TurnResult, run_interruptible};
use crate::config::Catalog;
use crate::domain::{InboxEntry, InboxKind, SpawnRecord, SpawnStatus, Turn, TurnStatus};
use crate::error::{CrewError, Result};
use crate::id::now_ms;
use crate::prompt::{PromptBuilder, PromptContext};
use crate::store::Store;

pub struct SpawnDriver {
    store: Arc<dyn Store>,
    catalog: Arc<Catalog>,
    runner: Arc<dyn AgentRunner>,
    prompts: Arc<dyn PromptBuilder>,
    poll_interval: Duration,
    turn_timeout: Option<Duration>,
}

impl SpawnDriver {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<Catalog>,
        runner: Arc<dyn AgentRunner>,
        prompts: Arc<dyn PromptBuilder>,
    ) -> Self {
        let poll_interval = catalog.poll_interval();
        let turn_timeout = catalog.turn_timeout();
        Self {
            store,
            catalog,
            runner,
            prompts,
            poll_interval,
            turn_timeout,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn load(&self, spawn_id: &str) -> Result<SpawnRecord> {
        self.store
            .get_spawn(spawn_id)?
            .ok_or_else(|| CrewError::NotFound(format!("spawn {spawn_id}")))
    }

    fn child_turn(&self, spawn: &SpawnRecord) -> Result<Turn> {
        let id = spawn
            .child_turn_id
            .as_deref()
            .ok_or_else(|| CrewError::InvalidState(format!("spawn {} has no child turn", spawn.id)))?;
        self.store
            .get_turn(id)?
            .ok_or_else(|| CrewError::NotFound(format!("turn {id}")))
    }

    /// Drive a spawn until it settles and return its final status.
    pub async fn drive(&self, spawn_id: &str, cancel: CancellationToken) -> Result<SpawnStatus> {
        let mut session: Option<String> = None;
        let mut notes: Vec<InboxEntry> = Vec::new();
        let mut last: Option<TurnResult> = None;

        loop {
            let spawn = self.load(spawn_id)?;
            if spawn.status.is_terminal() {
                self.close_turn(&spawn, last.as_ref())?;
                return Ok(spawn.status);
            }
            if spawn.status == SpawnStatus::AwaitingInput {
                self.wait_for_reply(spawn_id, &cancel).await?;
                continue;
            }

            let mut inbox = Vec::new();
            if spawn.has_undelivered() {
                self.store.modify_spawn(spawn_id, &mut |s| {
                    inbox = s.drain_inbox();
                    Ok(())
                })?;
            }
            inbox.append(&mut notes);

            if let Some(result) = &last
                && inbox.is_empty()
            {
                return self.finalize(spawn_id, result);
            }

            let turn = self.child_turn(&spawn)?;
            match self.run_session(&spawn, &turn, session.as_deref(), inbox, &cancel).await {
                Ok((result, interrupt)) => {
                    if result.session_id.is_some() {
                        session = result.session_id.clone();
                    }
                    if let Some(reason) = interrupt {
                        notes.push(InboxEntry {
                            kind: InboxKind::Message,
                            body: reason,
                            sent_at: now_ms(),
                            delivered: true,
                        });
                    }
                    last = Some(result);
                }
                Err(e) if e.is_cancelled() => {
                    if cancel.is_cancelled() {
                        // Shutting down: nobody is left to drive this child
                        self.abandon(spawn_id);
                        return Err(CrewError::Cancelled);
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(spawn_id, error = %e, "Spawn session failed");
                    let status = self.settle(spawn_id, SpawnStatus::Failed, Some(e.to_string()), None)?;
                    self.close_turn(&self.load(spawn_id)?, None)?;
                    return Ok(status);
                }
            }
        }
    }

    async fn run_session(
        &self,
        spawn: &SpawnRecord,
        turn: &Turn,
        resume: Option<&str>,
        inbox: Vec<InboxEntry>,
        cancel: &CancellationToken,
    ) -> Result<(TurnResult, Option<String>)> {
        let mut ctx = PromptContext::new(&spawn.profile, spawn.position);
        ctx.role = spawn.role.clone();
        ctx.can_write = !spawn.read_only;
        ctx.profile_instructions = self.catalog.profile_instructions(&spawn.profile);
        ctx.skills = self.catalog.profile_skills(&spawn.profile);
        ctx.delegation = turn.delegation.clone();
        if resume.is_none() {
            ctx.task = Some(spawn.task.clone());
        }
        ctx.inbox = inbox;
        ctx.wait_results = take_finished(self.store.as_ref(), &turn.id)?;
        let prompt = self.prompts.build(&ctx);

        let runtime = self.catalog.runtime_config(&spawn.profile, &turn.workdir)?;
        let request = runtime.request(&turn.id, &prompt, resume);

        let session_token = cancel.child_token();
        let watcher = self.watch_status(&spawn.id, &session_token);
        tracing::debug!(spawn_id = %spawn.id, turn_id = %turn.id, resume = ?resume, "Starting spawn session");
        let outcome = run_interruptible(
            self.runner.as_ref(),
            self.store.clone(),
            &turn.id,
            request,
            &NoopObserver,
            &session_token,
            self.poll_interval,
            self.turn_timeout,
        )
        .await;
        session_token.cancel();
        let _ = watcher.await;
        let outcome = outcome?;

        if let Some(session_id) = outcome.result.session_id.clone() {
            self.store.modify_turn(&turn.id, &mut |t| t.session_id = Some(session_id.clone()))?;
        }
        Ok((outcome.result, outcome.interrupt))
    }

    /// Cancel `token` when the spawn is canceled from outside.
    fn watch_status(&self, spawn_id: &str, token: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let spawn_id = spawn_id.to_string();
        let token = token.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Ok(Some(spawn)) = store.get_spawn(&spawn_id)
                            && spawn.status == SpawnStatus::Canceled
                        {
                            token.cancel();
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn wait_for_reply(&self, spawn_id: &str, cancel: &CancellationToken) -> Result<()> {
        tracing::debug!(spawn_id, "Waiting for reply");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abandon(spawn_id);
                    return Err(CrewError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if self.load(spawn_id)?.status != SpawnStatus::AwaitingInput {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn finalize(&self, spawn_id: &str, result: &TurnResult) -> Result<SpawnStatus> {
        let to = if result.success() {
            SpawnStatus::Completed
        } else {
            SpawnStatus::Failed
        };
        let status = self.settle(spawn_id, to, result.summary(), Some(result.exit_code))?;
        self.close_turn(&self.load(spawn_id)?, Some(result))?;
        tracing::info!(spawn_id, status = %status, exit_code = result.exit_code, "Spawn finished");
        Ok(status)
    }

    /// Move to a terminal status unless something else settled the spawn first.
    fn settle(
        &self,
        spawn_id: &str,
        to: SpawnStatus,
        summary: Option<String>,
        exit_code: Option<i32>,
    ) -> Result<SpawnStatus> {
        let updated = self.store.modify_spawn(spawn_id, &mut |s| {
            s.transition(to)?;
            s.summary = summary.clone();
            s.exit_code = exit_code;
            Ok(())
        });
        match updated {
            Ok(spawn) => Ok(spawn.status),
            Err(CrewError::InvalidState(_)) => Ok(self.load(spawn_id)?.status),
            Err(e) => Err(e),
        }
    }

    /// Mark the spawn canceled on shutdown. Store failures are logged, the caller is already leaving.
    fn abandon(&self, spawn_id: &str) {
        let closed = self
            .settle(spawn_id, SpawnStatus::Canceled, None, None)
            .and_then(|_| self.close_turn(&self.load(spawn_id)?, None));
        if let Err(e) = closed {
            tracing::warn!(spawn_id, error = %e, "Failed to record spawn shutdown");
        }
    }

    fn close_turn(&self, spawn: &SpawnRecord, result: Option<&TurnResult>) -> Result<()> {
        let Some(turn_id) = spawn.child_turn_id.as_deref() else {
            return Ok(());
        };
        let status = match spawn.status {
            SpawnStatus::Canceled => TurnStatus::Cancelled,
            SpawnStatus::Failed => TurnStatus::Failed,
            _ => TurnStatus::Completed,
        };
        let exit_code = result.map(|r| r.exit_code);
        self.store.modify_turn(turn_id, &mut |t| {
            if !t.status.is_terminal() {
                t.finish(status, exit_code);
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedRunner;
    use crate::config::{GlobalConfig, ProfileConfig};
    use crate::policy::Position;
    use crate::prompt::PlainPromptBuilder;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<dyn Store>,
        runner: Arc<ScriptedRunner>,
        driver: Arc<SpawnDriver>,
    }

    fn fixture(delay_ms: u64, exit_code: i32) -> Fixture {
        let mut config = GlobalConfig::default();
        config.profiles.insert(
            "coder".to_string(),
            ProfileConfig {
                agent: "claude".to_string(),
                ..Default::default()
            },
        );
        let catalog = Arc::new(Catalog::from_config(config).unwrap());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(delay_ms), exit_code));
        let driver = Arc::new(
            SpawnDriver::new(store.clone(), catalog, runner.clone(), Arc::new(PlainPromptBuilder))
                .with_poll_interval(Duration::from_millis(10)),
        );
        Fixture { store, runner, driver }
    }

    fn seed(store: &Arc<dyn Store>) -> SpawnRecord {
        let mut spawn = SpawnRecord::new("turn-parent", "run-1", "coder", Position::Worker, "write the parser");
        let child = Turn::for_spawn(&spawn.id, "run-1", "coder", "claude", Position::Worker).with_workdir("/tmp");
        spawn.child_turn_id = Some(child.id.clone());
        store.create_turn(&child).unwrap();
        store.create_spawn(&spawn).unwrap();
        spawn
    }

    #[tokio::test]
    async fn test_drive_completes() {
        let f = fixture(5, 0);
        let spawn = seed(&f.store);
        let status = f.driver.drive(&spawn.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, SpawnStatus::Completed);

        let stored = f.store.get_spawn(&spawn.id).unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("done"));
        assert_eq!(stored.exit_code, Some(0));
        let turn = f.store.get_turn(spawn.child_turn_id.as_deref().unwrap()).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.session_id.as_deref(), Some("session-1"));

        let requests = f.runner.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("write the parser"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let f = fixture(5, 2);
        let spawn = seed(&f.store);
        let status = f.driver.drive(&spawn.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, SpawnStatus::Failed);
    }

    #[tokio::test]
    async fn test_message_resumes_session() {
        let f = fixture(60, 0);
        let spawn = seed(&f.store);
        let store = f.store.clone();
        let id = spawn.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store
                .modify_spawn(&id, &mut |s| {
                    s.push_inbox(InboxKind::Message, "also cover errors");
                    Ok(())
                })
                .unwrap();
        });

        let status = f.driver.drive(&spawn.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, SpawnStatus::Completed);
        let requests = f.runner.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].resume_session.as_deref(), Some("session-1"));
        assert!(requests[1].prompt.contains("also cover errors"));
        assert!(!requests[1].prompt.contains("write the parser"));
    }

    #[tokio::test]
    async fn test_waits_for_reply_before_running() {
        let f = fixture(5, 0);
        let spawn = seed(&f.store);
        f.store
            .modify_spawn(&spawn.id, &mut |s| {
                s.question = Some("sqlite or postgres?".to_string());
                s.transition(SpawnStatus::AwaitingInput)
            })
            .unwrap();

        let store = f.store.clone();
        let id = spawn.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store
                .modify_spawn(&id, &mut |s| {
                    s.transition(SpawnStatus::Running)?;
                    s.question = None;
                    s.push_inbox(InboxKind::Reply, "use sqlite");
                    Ok(())
                })
                .unwrap();
        });

        let status = f.driver.drive(&spawn.id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, SpawnStatus::Completed);
        let requests = f.runner.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("reply: use sqlite"));
    }

    #[tokio::test]
    async fn test_external_cancel_stops_session() {
        let f = fixture(30_000, 0);
        let spawn = seed(&f.store);
        let store = f.store.clone();
        let id = spawn.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.modify_spawn(&id, &mut |s| s.transition(SpawnStatus::Canceled)).unwrap();
        });

        let status = tokio::time::timeout(
            Duration::from_secs(2),
            f.driver.drive(&spawn.id, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status, SpawnStatus::Canceled);
        let turn = f.store.get_turn(spawn.child_turn_id.as_deref().unwrap()).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_marks_spawn_canceled() {
        let f = fixture(30_000, 0);
        let spawn = seed(&f.store);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = f.driver.drive(&spawn.id, cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(f.store.get_spawn(&spawn.id).unwrap().unwrap().status, SpawnStatus::Canceled);
    }

    #[tokio::test]
    async fn test_shutdown_while_awaiting_reply_closes_turn() {
        let f = fixture(5, 0);
        let spawn = seed(&f.store);
        f.store
            .modify_spawn(&spawn.id, &mut |s| {
                s.transition(SpawnStatus::AwaitingInput)?;
                s.question = Some("which db?".to_string());
                Ok(())
            })
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = f.driver.drive(&spawn.id, cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(f.store.get_spawn(&spawn.id).unwrap().unwrap().status, SpawnStatus::Canceled);
        let turn = f.store.get_turn(spawn.child_turn_id.as_deref().unwrap()).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Cancelled);
        assert!(f.runner.requests.lock().unwrap().is_empty());
    }
}
