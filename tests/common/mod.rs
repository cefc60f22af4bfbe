//! Shared fixtures for scenario tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crewloop::agent::{AgentRunner, SessionObserver, TURN_ID_ENV, TranscriptEvent, TurnRequest, TurnResult};
use crewloop::config::{Catalog, GlobalConfig, ProfileConfig};
use crewloop::domain::{LoopDefinition, Turn};
use crewloop::error::{CrewError, Result};
use crewloop::prompt::PlainPromptBuilder;
use crewloop::runner::LoopController;
use crewloop::spawn::{SpawnCoordinator, SpawnDriver, TaskLauncher};
use crewloop::store::{MemoryStore, Store};

pub const POLL: Duration = Duration::from_millis(10);

type Hook = Box<dyn Fn(&Turn) + Send + Sync>;

/// Agent stand-in: looks up its turn, runs the hook, then finishes after `delay`.
pub struct HookRunner {
    store: Arc<dyn Store>,
    delay: Duration,
    hook: Mutex<Option<Hook>>,
    pub turns: Mutex<Vec<Turn>>,
    pub prompts: Mutex<Vec<String>>,
}

impl HookRunner {
    pub fn new(store: Arc<dyn Store>, delay: Duration) -> Self {
        Self {
            store,
            delay,
            hook: Mutex::new(None),
            turns: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_hook(&self, hook: impl Fn(&Turn) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn profiles(&self) -> Vec<String> {
        self.turns.lock().unwrap().iter().map(|t| t.profile.clone()).collect()
    }
}

#[async_trait]
impl AgentRunner for HookRunner {
    async fn run(&self, request: TurnRequest, observer: &dyn SessionObserver, cancel: CancellationToken) -> Result<TurnResult> {
        let turn_id = request.env.get(TURN_ID_ENV).cloned().unwrap_or_default();
        let turn = self
            .store
            .get_turn(&turn_id)?
            .ok_or_else(|| CrewError::NotFound(turn_id.clone()))?;
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.turns.lock().unwrap().push(turn.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(&turn);
        }

        let session_id = request
            .resume_session
            .clone()
            .unwrap_or_else(|| format!("session-{}", turn.id));
        observer.session_started(&session_id);
        tokio::select! {
            _ = cancel.cancelled() => Err(CrewError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(TurnResult {
                exit_code: 0,
                session_id: Some(session_id),
                transcript: vec![TranscriptEvent::text("result", &format!("{} finished", turn.profile))],
            }),
        }
    }
}

pub struct World {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<Catalog>,
    pub runner: Arc<HookRunner>,
    pub spawns: Arc<SpawnCoordinator>,
    pub controller: Arc<LoopController>,
    pub shutdown: CancellationToken,
}

/// Catalog with one profile per name, all on the claude agent, plus `loops`.
pub fn catalog(profiles: &[&str], loops: Vec<LoopDefinition>) -> Catalog {
    let mut config = GlobalConfig::default();
    for name in profiles {
        config.profiles.insert(
            name.to_string(),
            ProfileConfig {
                agent: "claude".to_string(),
                ..Default::default()
            },
        );
    }
    for def in loops {
        config.loops.insert(def.name.clone(), def);
    }
    Catalog::from_config(config).unwrap()
}

/// In-memory world whose spawns run as tasks on the test runtime.
pub fn world(profiles: &[&str], loops: Vec<LoopDefinition>) -> World {
    let catalog = Arc::new(catalog(profiles, loops));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let runner = Arc::new(HookRunner::new(store.clone(), Duration::from_millis(20)));
    let shutdown = CancellationToken::new();
    let driver = Arc::new(
        SpawnDriver::new(store.clone(), catalog.clone(), runner.clone(), Arc::new(PlainPromptBuilder))
            .with_poll_interval(POLL),
    );
    let launcher = TaskLauncher::new(driver, shutdown.clone()).unwrap();
    let spawns = Arc::new(
        SpawnCoordinator::new(store.clone(), catalog.clone(), Arc::new(launcher)).with_poll_interval(POLL),
    );
    let controller = Arc::new(
        LoopController::new(
            store.clone(),
            catalog.clone(),
            runner.clone(),
            Arc::new(PlainPromptBuilder),
            spawns.clone(),
        )
        .with_poll_interval(POLL),
    );
    World {
        store,
        catalog,
        runner,
        spawns,
        controller,
        shutdown,
    }
}
