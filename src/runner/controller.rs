//! LoopController - drives one loop run through its cycles and steps.
//!
//! Each step visit runs `turns` agent turns, then the controller settles the
//! step's bookkeeping (message watermark, handoff queue) and reads the run's
//! signals to pick the next step. The controller only ever writes the run
//! through `modify_loop_run`, touching the fields it owns, so signals set by
//! agents through the CLI are never overwritten.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{EVENT_CAPACITY, EventSink, LoopEvent, SinkObserver};
use super::next_step::{Advance, resolve_next_step};
use super::LoopOutcome;
use crate::agent::{AgentRunner, run_interruptible};
use crate::config::Catalog;
use crate::domain::{LoopMessage, LoopRun, LoopStep, RunStatus, SpawnRecord, Turn, TurnStatus};
use crate::error::{CrewError, Result};
use crate::prompt::{LoopContext, PromptBuilder, PromptContext};
use crate::spawn::{SpawnCoordinator, SpawnPoller};
use crate::store::Store;

/// A run started in the background with [`LoopController::start`].
pub struct RunHandle {
    pub run_id: String,
    pub events: tokio::sync::mpsc::Receiver<LoopEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<LoopOutcome>>,
}

/// What one step visit left behind.
struct StepReport {
    interrupted: bool,
}

pub struct LoopController {
    store: Arc<dyn Store>,
    catalog: Arc<Catalog>,
    runner: Arc<dyn AgentRunner>,
    prompts: Arc<dyn PromptBuilder>,
    spawns: Arc<SpawnCoordinator>,
    poll_interval: Duration,
    turn_timeout: Option<Duration>,
}

impl LoopController {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<Catalog>,
        runner: Arc<dyn AgentRunner>,
        prompts: Arc<dyn PromptBuilder>,
        spawns: Arc<SpawnCoordinator>,
    ) -> Self {
        let poll_interval = catalog.poll_interval();
        let turn_timeout = catalog.turn_timeout();
        Self {
            store,
            catalog,
            runner,
            prompts,
            spawns,
            poll_interval,
            turn_timeout,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// Persist a new run of a configured loop. `max_cycles` overrides the definition's.
    pub fn create_run(&self, loop_name: &str, workdir: &Path, max_cycles: Option<u32>) -> Result<LoopRun> {
        let definition = self.catalog.loop_definition(loop_name)?.clone();
        definition.validate()?;
        let max_cycles = max_cycles.unwrap_or(definition.max_cycles);
        let run = LoopRun::new(definition, workdir, max_cycles);
        self.store.create_loop_run(&run)?;
        tracing::info!(run_id = %run.id, loop_name = %run.loop_name, max_cycles, "Loop run created");
        Ok(run)
    }

    /// Run in a background task, publishing events on the returned handle.
    pub fn start(self: &Arc<Self>, run_id: &str) -> RunHandle {
        self.spawn_task(run_id, false)
    }

    /// Like [`LoopController::start`], for [`LoopController::resume`].
    pub fn start_resume(self: &Arc<Self>, run_id: &str) -> RunHandle {
        self.spawn_task(run_id, true)
    }

    fn spawn_task(self: &Arc<Self>, run_id: &str, resume: bool) -> RunHandle {
        let (sink, events) = EventSink::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let controller = self.clone();
        let id = run_id.to_string();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            if resume {
                controller.resume(&id, sink, token).await
            } else {
                controller.run(&id, sink, token).await
            }
        });
        RunHandle {
            run_id: run_id.to_string(),
            events,
            cancel,
            join,
        }
    }

    /// Continue a persisted run from its stored cycle and step.
    ///
    /// Cancelled and failed runs may be resumed; turns left running by a
    /// dead controller are closed as cancelled first.
    pub async fn resume(&self, run_id: &str, sink: EventSink, cancel: CancellationToken) -> Result<LoopOutcome> {
        let run = self.load(run_id)?;
        if matches!(run.status, RunStatus::Completed | RunStatus::Stopped) {
            return Err(CrewError::InvalidState(format!("run {} is {}", run_id, run.status)));
        }
        for turn in self.store.list_turns(run_id)? {
            if !turn.status.is_terminal() {
                self.store.modify_turn(&turn.id, &mut |t| t.finish(TurnStatus::Cancelled, None))?;
            }
        }
        self.store.modify_loop_run(run_id, &mut |r| {
            r.status = RunStatus::Running;
            r.error = None;
            r.touch();
        })?;
        tracing::info!(run_id, cycle = run.cycle, step_index = run.step_index, "Resuming loop run");
        self.run(run_id, sink, cancel).await
    }

    /// Drive a run until it completes, stops, is cancelled, or a step fails.
    pub async fn run(&self, run_id: &str, sink: EventSink, cancel: CancellationToken) -> Result<LoopOutcome> {
        let mut run = self.load(run_id)?;
        if run.status.is_terminal() {
            return Err(CrewError::InvalidState(format!("run {} is {}", run_id, run.status)));
        }
        sink.emit(LoopEvent::RunStarted {
            run_id: run.id.clone(),
            loop_name: run.loop_name.clone(),
            cycle: run.cycle,
            step_index: run.step_index,
        });

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(LoopOutcome::Cancelled);
            }
            if run.max_cycles > 0 && run.cycle > run.max_cycles {
                break Ok(LoopOutcome::Completed {
                    cycles: run.max_cycles,
                });
            }
            let step_index = run.step_index;
            let Some(step) = run.definition.steps.get(step_index).cloned() else {
                break Err(CrewError::InvalidState(format!("run {} has no step {}", run.id, step_index)));
            };

            match self.execute_step(&run, &step, &sink, &cancel).await {
                Ok(report) => {
                    tracing::debug!(run_id, step_index, interrupted = report.interrupted, "Step finished");
                    sink.emit(LoopEvent::StepFinished {
                        cycle: run.cycle,
                        step_index,
                    });
                }
                Err(CrewError::Cancelled) => break Ok(LoopOutcome::Cancelled),
                Err(e) => break Err(e.at_step(step_index, &step.profile)),
            }

            match self.advance(run_id, &step, &sink) {
                Ok((next, None)) => run = next,
                Ok((_, Some(outcome))) => break Ok(outcome),
                Err(e) => break Err(e),
            }
        };

        self.finish(run_id, &outcome)?;
        if let Ok(outcome) = &outcome {
            sink.emit(LoopEvent::RunFinished {
                outcome: outcome.clone(),
            });
        }
        outcome
    }

    fn load(&self, run_id: &str) -> Result<LoopRun> {
        self.store
            .get_loop_run(run_id)?
            .ok_or_else(|| CrewError::NotFound(format!("loop run {run_id}")))
    }

    /// Read signals after a step and move the run on. Returns the outcome when the run ends.
    fn advance(&self, run_id: &str, step: &LoopStep, sink: &EventSink) -> Result<(LoopRun, Option<LoopOutcome>)> {
        let run = self.load(run_id)?;
        let (cycle, step_index) = (run.cycle, run.step_index);
        let signals = run.signals.clone();

        if signals.wind_down {
            tracing::info!(run_id, cycle, step_index, "Winding down");
            return Ok((run, Some(LoopOutcome::WoundDown { cycle, step_index })));
        }

        // A stop the current step cannot honor is dropped, whichever signal wins
        let clear_stop = signals.stop && !step.can_stop;
        if clear_stop {
            tracing::warn!(run_id, step_index, "Stop signal ignored: step cannot stop the loop");
        }

        let mut advance = Advance::Next;
        if let Some(call) = &signals.call_supervisor {
            advance = Advance::JumpToSupervisor { target: call.target };
        } else if signals.stop && step.can_stop {
            tracing::info!(run_id, cycle, step_index, "Stop signal honored");
            return Ok((run, Some(LoopOutcome::Stopped { cycle, step_index })));
        }

        let next = resolve_next_step(&run.definition.steps, cycle, step_index, advance);
        if let Advance::JumpToSupervisor { .. } = advance {
            if next.jumped {
                tracing::info!(run_id, from = step_index, cycle = next.cycle, to = next.step_index, "Supervisor called");
                sink.emit(LoopEvent::SupervisorCalled {
                    from_step: step_index,
                    cycle: next.cycle,
                    step_index: next.step_index,
                });
            } else {
                tracing::warn!(run_id, step_index, "No supervisor step to jump to, advancing normally");
            }
        }

        let run = self.store.modify_loop_run(run_id, &mut |r| {
            r.cycle = next.cycle;
            r.step_index = next.step_index;
            if advance != Advance::Next {
                r.signals.call_supervisor = None;
            }
            if clear_stop {
                r.signals.stop = false;
            }
            r.touch();
        })?;
        Ok((run, None))
    }

    /// Persist the terminal status of a run.
    fn finish(&self, run_id: &str, outcome: &Result<LoopOutcome>) -> Result<()> {
        let (status, error) = match outcome {
            Ok(LoopOutcome::Completed { .. }) => (RunStatus::Completed, None),
            Ok(LoopOutcome::Stopped { .. } | LoopOutcome::WoundDown { .. }) => (RunStatus::Stopped, None),
            Ok(LoopOutcome::Cancelled) => (RunStatus::Cancelled, None),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };
        self.store.modify_loop_run(run_id, &mut |r| {
            r.status = status;
            r.error = error.clone();
            r.touch();
        })?;
        match outcome {
            Ok(outcome) => tracing::info!(run_id, status = %status, "Loop run finished: {}", outcome),
            Err(e) => tracing::error!(run_id, error = %e, "Loop run failed"),
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        run: &LoopRun,
        step: &LoopStep,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        let step_index = run.step_index;
        let position = step.effective_position();
        let (profile_name, profile) = self
            .catalog
            .profile(&step.profile)
            .ok_or_else(|| CrewError::Config(format!("unknown profile {:?}", step.profile)))?;
        let profile_name = profile_name.to_string();
        let agent = profile.agent.clone();
        let delegation = self.catalog.step_delegation(step)?;
        let runtime = self.catalog.runtime_config(&profile_name, &run.workdir)?;
        let turns = step.effective_turns();

        tracing::info!(
            run_id = %run.id,
            cycle = run.cycle,
            step_index,
            profile = %profile_name,
            position = %position,
            turns,
            "Step started"
        );
        sink.emit(LoopEvent::StepStarted {
            cycle: run.cycle,
            step_index,
            profile: profile_name.clone(),
            position,
        });

        let mut seen = run.watermark(step_index);
        let mut session: Option<String> = None;
        let mut last_turn: Option<String> = None;
        let mut interrupted = false;

        for iteration in 0..turns {
            let turn = Turn::for_step(&run.id, run.cycle, step_index, iteration, &profile_name, &agent, position)
                .with_role(step.role.clone())
                .with_delegation(delegation.clone())
                .with_workdir(&run.workdir);
            self.store.create_turn(&turn)?;

            let handoffs = match &last_turn {
                Some(previous) => self.spawns.carry_over(previous, &turn.id)?,
                None => self.adopt_pending(&run.id, &turn.id)?,
            };
            last_turn = Some(turn.id.clone());

            let messages = self.unseen_messages(&run.id, step_index, &profile_name, &mut seen)?;
            let ctx = self.prompt_context(run, step, &profile_name, iteration, messages, handoffs, &turn.id)?;
            let prompt = self.prompts.build(&ctx);
            let resume = if step.standalone_chat { None } else { session.as_deref() };
            let request = runtime.request(&turn.id, &prompt, resume);

            sink.emit(LoopEvent::TurnStarted {
                turn_id: turn.id.clone(),
                iteration,
            });
            tracing::debug!(turn_id = %turn.id, iteration, resume = ?resume, "Turn started");

            let poller = {
                let sink = sink.clone();
                let turn_id = turn.id.clone();
                SpawnPoller::start(self.store.clone(), turn.id.clone(), self.poll_interval, cancel, move |spawns| {
                    sink.emit(LoopEvent::Spawns {
                        turn_id: turn_id.clone(),
                        spawns,
                    })
                })
            };
            let observer = SinkObserver {
                sink,
                turn_id: &turn.id,
            };
            let outcome = run_interruptible(
                self.runner.as_ref(),
                self.store.clone(),
                &turn.id,
                request,
                &observer,
                cancel,
                self.poll_interval,
                self.turn_timeout,
            )
            .await;
            poller.stop().await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    let status = if e.is_cancelled() {
                        TurnStatus::Cancelled
                    } else {
                        TurnStatus::Failed
                    };
                    self.store.modify_turn(&turn.id, &mut |t| t.finish(status, None))?;
                    self.settle_step(&run.id, step_index, seen, last_turn.as_deref())?;
                    return Err(e);
                }
            };

            let result = &outcome.result;
            if let Some(id) = &result.session_id {
                session = Some(id.clone());
            }
            let status = if outcome.interrupt.is_some() {
                TurnStatus::Interrupted
            } else if result.success() {
                TurnStatus::Completed
            } else {
                TurnStatus::Failed
            };
            let session_id = result.session_id.clone();
            self.store.modify_turn(&turn.id, &mut |t| {
                t.session_id = session_id.clone().or(t.session_id.take());
                t.finish(status, Some(outcome.result.exit_code));
            })?;
            if let Some(id) = &session_id {
                self.store.modify_loop_run(&run.id, &mut |r| {
                    if !r.session_ids.contains(id) {
                        r.session_ids.push(id.clone());
                    }
                })?;
            }
            sink.emit(LoopEvent::TurnFinished {
                turn_id: turn.id.clone(),
                exit_code: result.exit_code,
                interrupted: outcome.interrupt.is_some(),
            });

            if status == TurnStatus::Failed {
                self.settle_step(&run.id, step_index, seen, last_turn.as_deref())?;
                return Err(CrewError::Agent(format!("agent exited with code {}", result.exit_code)));
            }
            if let Some(reason) = &outcome.interrupt {
                tracing::info!(turn_id = %turn.id, reason = %reason, "Turn interrupted, ending step");
                interrupted = true;
                break;
            }
        }

        self.settle_step(&run.id, step_index, seen, last_turn.as_deref())?;
        Ok(StepReport { interrupted })
    }

    /// Hand every queued handoff to the first turn of a step and clear the queue.
    fn adopt_pending(&self, run_id: &str, turn_id: &str) -> Result<Vec<SpawnRecord>> {
        let pending = self.load(run_id)?.pending_handoffs;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let adopted = self.spawns.adopt(&pending, turn_id)?;
        self.store.modify_loop_run(run_id, &mut |r| {
            r.pending_handoffs.retain(|id| !pending.contains(id));
        })?;
        Ok(adopted.into_iter().filter(|s| !s.status.is_terminal()).collect())
    }

    /// Messages newer than `seen`, minus the ones this step posted itself. Raises `seen`.
    fn unseen_messages(&self, run_id: &str, step_index: usize, author: &str, seen: &mut i64) -> Result<Vec<LoopMessage>> {
        let messages = self.store.list_loop_messages(run_id, *seen)?;
        if let Some(last) = messages.last() {
            *seen = (*seen).max(last.id);
        }
        Ok(messages
            .into_iter()
            .filter(|m| !(m.step_index == step_index && m.author == author))
            .collect())
    }

    /// Advance the step's watermark to the newest message visible now and
    /// queue the last turn's running handoff spawns for the next step.
    fn settle_step(&self, run_id: &str, step_index: usize, seen: i64, last_turn: Option<&str>) -> Result<()> {
        let newest = self
            .store
            .list_loop_messages(run_id, seen)?
            .last()
            .map_or(seen, |m| m.id);
        let handoffs = match last_turn {
            Some(turn_id) => self.spawns.collect_handoffs(turn_id)?,
            None => Vec::new(),
        };
        if !handoffs.is_empty() {
            tracing::debug!(run_id, step_index, count = handoffs.len(), "Queued handoff spawns");
        }
        self.store.modify_loop_run(run_id, &mut |r| {
            r.advance_watermark(step_index, newest);
            r.queue_handoffs(handoffs.iter().cloned());
            r.touch();
        })?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn prompt_context(
        &self,
        run: &LoopRun,
        step: &LoopStep,
        profile: &str,
        iteration: u32,
        messages: Vec<LoopMessage>,
        handoffs: Vec<SpawnRecord>,
        turn_id: &str,
    ) -> Result<PromptContext> {
        let position = step.effective_position();
        let mut ctx = PromptContext::new(profile, position);
        ctx.role = step.role.clone();
        ctx.can_write = position.can_write(self.catalog.role_can_write(step.role.as_deref()));
        ctx.profile_instructions = self.catalog.profile_instructions(profile);
        ctx.skills = self.catalog.profile_skills(profile);
        ctx.delegation = self.catalog.step_delegation(step)?;
        ctx.loop_ctx = Some(LoopContext {
            loop_name: run.loop_name.clone(),
            cycle: run.cycle,
            max_cycles: run.max_cycles,
            step_index: run.step_index,
            step_count: run.definition.steps.len(),
            iteration,
            turns: step.effective_turns(),
            instructions: step.instructions.clone(),
            can_stop: step.can_stop && position.can_stop_loop(),
            can_message: step.can_message && position.can_post_messages(),
            can_pushover: step.can_pushover,
            can_call_supervisor: position.can_call_supervisor(),
            standalone: step.standalone_chat,
        });
        ctx.messages = messages;
        ctx.handoffs = handoffs;
        ctx.wait_results = self.spawns.take_finished(turn_id)?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedRunner;
    use crate::config::{GlobalConfig, ProfileConfig};
    use crate::domain::{CallSupervisor, LoopDefinition, SpawnStatus};
    use crate::policy::Position;
    use crate::prompt::PlainPromptBuilder;
    use crate::spawn::testing::RecordingLauncher;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<dyn Store>,
        runner: Arc<ScriptedRunner>,
        controller: LoopController,
    }

    fn fixture(definition: LoopDefinition, exit_code: i32) -> Fixture {
        let mut config = GlobalConfig::default();
        for name in ["boss", "planner", "builder"] {
            config.profiles.insert(
                name.to_string(),
                ProfileConfig {
                    agent: "claude".to_string(),
                    ..Default::default()
                },
            );
        }
        config.loops.insert(definition.name.clone(), definition);
        let catalog = Arc::new(Catalog::from_config(config).unwrap());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(5), exit_code));
        let spawns = Arc::new(SpawnCoordinator::new(
            store.clone(),
            catalog.clone(),
            Arc::new(RecordingLauncher::default()),
        ));
        let controller = LoopController::new(
            store.clone(),
            catalog,
            runner.clone(),
            Arc::new(PlainPromptBuilder),
            spawns,
        )
        .with_poll_interval(Duration::from_millis(10));
        Fixture {
            store,
            runner,
            controller,
        }
    }

    fn two_steps(max_cycles: u32) -> LoopDefinition {
        LoopDefinition::new("pair", vec![LoopStep::new("planner"), LoopStep::new("builder")]).with_max_cycles(max_cycles)
    }

    async fn run_to_end(f: &Fixture, name: &str) -> (LoopRun, Result<LoopOutcome>) {
        let run = f.controller.create_run(name, Path::new("/tmp"), None).unwrap();
        let outcome = f.controller.run(&run.id, EventSink::none(), CancellationToken::new()).await;
        (f.store.get_loop_run(&run.id).unwrap().unwrap(), outcome)
    }

    #[tokio::test]
    async fn test_completes_after_max_cycles() {
        let f = fixture(two_steps(2), 0);
        let (run, outcome) = run_to_end(&f, "pair").await;
        assert_eq!(outcome.unwrap(), LoopOutcome::Completed { cycles: 2 });
        assert_eq!(run.status, RunStatus::Completed);
        let profiles: Vec<String> = f.store.list_turns(&run.id).unwrap().into_iter().map(|t| t.profile).collect();
        assert_eq!(profiles, ["planner", "builder", "planner", "builder"]);
    }

    #[tokio::test]
    async fn test_turns_resume_session_within_step() {
        let def = LoopDefinition::new("multi", vec![LoopStep::new("planner").with_turns(3)]).with_max_cycles(1);
        let f = fixture(def, 0);
        let (run, _) = run_to_end(&f, "multi").await;
        let requests = f.runner.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].resume_session, None);
        assert!(requests[1].resume_session.is_some());
        assert_eq!(run.session_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_standalone_chat_never_resumes() {
        let mut step = LoopStep::new("planner").with_turns(2);
        step.standalone_chat = true;
        let f = fixture(LoopDefinition::new("fresh", vec![step]).with_max_cycles(1), 0);
        run_to_end(&f, "fresh").await;
        let requests = f.runner.requests.lock().unwrap();
        assert!(requests.iter().all(|r| r.resume_session.is_none()));
    }

    #[tokio::test]
    async fn test_agent_failure_fails_run() {
        let f = fixture(two_steps(1), 3);
        let (run, outcome) = run_to_end(&f, "pair").await;
        match outcome {
            Err(CrewError::Step { step_index, profile, .. }) => {
                assert_eq!(step_index, 0);
                assert_eq!(profile, "planner");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.is_some());
    }

    #[tokio::test]
    async fn test_wind_down_finishes_step_then_stops() {
        let f = fixture(two_steps(0), 0);
        let run = f.controller.create_run("pair", Path::new("/tmp"), None).unwrap();
        f.store.signal_loop_wind_down(&run.id).unwrap();
        let outcome = f
            .controller
            .run(&run.id, EventSink::none(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::WoundDown { cycle: 1, step_index: 0 });
        assert_eq!(f.store.list_turns(&run.id).unwrap().len(), 1);
        assert_eq!(f.store.get_loop_run(&run.id).unwrap().unwrap().status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_ignored_on_step_without_can_stop() {
        let f = fixture(two_steps(1), 0);
        let run = f.controller.create_run("pair", Path::new("/tmp"), None).unwrap();
        f.store.signal_loop_stop(&run.id).unwrap();
        let outcome = f
            .controller
            .run(&run.id, EventSink::none(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::Completed { cycles: 1 });
        assert!(!f.store.get_loop_run(&run.id).unwrap().unwrap().signals.stop);
    }

    #[tokio::test]
    async fn test_stop_dropped_when_supervisor_call_wins() {
        let def = LoopDefinition::new(
            "escalate",
            vec![
                LoopStep::new("planner"),
                LoopStep::new("boss").with_position(Position::Supervisor).with_can_stop(true),
            ],
        )
        .with_max_cycles(1);
        let f = fixture(def, 0);
        let run = f.controller.create_run("escalate", Path::new("/tmp"), None).unwrap();
        f.store.signal_loop_stop(&run.id).unwrap();
        f.store
            .signal_loop_call_supervisor(
                &run.id,
                CallSupervisor {
                    from_step: 0,
                    target: None,
                    reason: "blocked".to_string(),
                    requested_at: 0,
                },
            )
            .unwrap();

        let outcome = f
            .controller
            .run(&run.id, EventSink::none(), CancellationToken::new())
            .await
            .unwrap();
        // the planner saw the stop and could not honor it, so the boss step must not inherit it
        assert_eq!(outcome, LoopOutcome::Completed { cycles: 1 });
        let stored = f.store.get_loop_run(&run.id).unwrap().unwrap();
        assert!(!stored.signals.stop);
        assert!(stored.signals.call_supervisor.is_none());
    }

    #[tokio::test]
    async fn test_watermark_covers_messages_seen() {
        let f = fixture(two_steps(1), 0);
        let run = f.controller.create_run("pair", Path::new("/tmp"), None).unwrap();
        let first = f.store.post_loop_message(&run.id, 0, "operator", "hello").unwrap();
        f.controller
            .run(&run.id, EventSink::none(), CancellationToken::new())
            .await
            .unwrap();
        let stored = f.store.get_loop_run(&run.id).unwrap().unwrap();
        assert_eq!(stored.watermark(0), first.id);
        assert_eq!(stored.watermark(1), first.id);
        let prompts = f.runner.requests.lock().unwrap();
        assert!(prompts.iter().all(|r| r.prompt.contains("hello")));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let f = fixture(two_steps(0), 0);
        let run = f.controller.create_run("pair", Path::new("/tmp"), None).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = f.controller.run(&run.id, EventSink::none(), cancel).await.unwrap();
        assert_eq!(outcome, LoopOutcome::Cancelled);
        assert_eq!(f.store.get_loop_run(&run.id).unwrap().unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_resume_continues_from_stored_step() {
        let f = fixture(two_steps(1), 0);
        let run = f.controller.create_run("pair", Path::new("/tmp"), None).unwrap();
        f.store
            .modify_loop_run(&run.id, &mut |r| {
                r.step_index = 1;
                r.status = RunStatus::Cancelled;
            })
            .unwrap();
        let outcome = f
            .controller
            .resume(&run.id, EventSink::none(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::Completed { cycles: 1 });
        let turns = f.store.list_turns(&run.id).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].profile, "builder");
    }

    #[tokio::test]
    async fn test_resume_refuses_completed_run() {
        let f = fixture(two_steps(1), 0);
        let (run, _) = run_to_end(&f, "pair").await;
        let err = f
            .controller
            .resume(&run.id, EventSink::none(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrewError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_pending_handoffs_adopted_by_next_step() {
        let f = fixture(two_steps(1), 0);
        let run = f.controller.create_run("pair", Path::new("/tmp"), None).unwrap();
        let mut spawn = SpawnRecord::new("turn-gone", &run.id, "builder", Position::Worker, "keep going");
        spawn.handoff = true;
        spawn.status = SpawnStatus::Running;
        f.store.create_spawn(&spawn).unwrap();
        f.store
            .modify_loop_run(&run.id, &mut |r| r.queue_handoffs([spawn.id.clone()]))
            .unwrap();

        f.controller
            .run(&run.id, EventSink::none(), CancellationToken::new())
            .await
            .unwrap();

        let turns = f.store.list_turns(&run.id).unwrap();
        let adopted = f.store.get_spawn(&spawn.id).unwrap().unwrap();
        // first turn adopts, the second inherits it back through the handoff queue
        assert_eq!(adopted.parent_turn_id, turns[1].id);
        let prompts = f.runner.requests.lock().unwrap();
        assert!(prompts[0].prompt.contains(&spawn.id));
    }

    #[tokio::test]
    async fn test_events_published() {
        let f = fixture(two_steps(1), 0);
        let run = f.controller.create_run("pair", Path::new("/tmp"), None).unwrap();
        let (sink, mut rx) = EventSink::channel(EVENT_CAPACITY);
        f.controller.run(&run.id, sink, CancellationToken::new()).await.unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(LoopEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(LoopEvent::RunFinished {
                outcome: LoopOutcome::Completed { cycles: 1 }
            })
        ));
        let turns = events.iter().filter(|e| matches!(e, LoopEvent::TurnStarted { .. })).count();
        assert_eq!(turns, 2);
    }
}
