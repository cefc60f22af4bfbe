//! Per-command application context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result, eyre};

use crewloop::agent::ProcessRunner;
use crewloop::config::{Catalog, GlobalConfig};
use crewloop::coordination::{Caller, SignalManager};
use crewloop::prompt::PlainPromptBuilder;
use crewloop::runner::LoopController;
use crewloop::spawn::{GitWorktrees, ProcessLauncher, SpawnCoordinator, SpawnDriver};
use crewloop::store::{SqliteStore, Store};

use super::Cli;

pub struct App {
    project_dir: PathBuf,
    catalog: Arc<Catalog>,
    store: Arc<dyn Store>,
    turn: Option<String>,
    forwarded: Vec<String>,
}

impl App {
    pub fn load(cli: &Cli) -> Result<Self> {
        let project_dir = match &cli.project {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Project directory not found: {}", project_dir.display()))?;

        let config = GlobalConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;
        let store_root = config.store_root();
        let catalog = Catalog::from_config(config).context("Invalid configuration")?;
        let store = SqliteStore::open(&store_root, &project_dir).context("Failed to open store")?;
        log::info!("Using store at {}", store.path().display());

        Ok(Self {
            project_dir,
            catalog: Arc::new(catalog),
            store: Arc::new(store),
            turn: cli.turn.clone().filter(|t| !t.trim().is_empty()),
            forwarded: cli.forwarded_args(),
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Turn issuing this command, if any. None means the operator.
    pub fn turn(&self) -> Option<&str> {
        self.turn.as_deref()
    }

    pub fn require_turn(&self) -> Result<&str> {
        self.turn()
            .ok_or_else(|| eyre!("No turn: run this from inside an agent session or pass --turn"))
    }

    pub fn caller(&self) -> Result<Caller> {
        Ok(Caller::resolve(self.store.as_ref(), self.turn())?)
    }

    pub fn signals(&self) -> SignalManager {
        SignalManager::new(self.store.clone())
    }

    /// Coordinator launching children as detached `spawn-run` processes.
    pub fn coordinator(&self) -> Result<SpawnCoordinator> {
        let launcher = ProcessLauncher::current(self.forwarded.clone(), &self.project_dir)?;
        let mut coordinator = SpawnCoordinator::new(self.store.clone(), self.catalog.clone(), Arc::new(launcher));
        if self.project_dir.join(".git").exists() {
            let worktrees = GitWorktrees::new(self.catalog.worktree_root(&self.project_dir)?, &self.project_dir);
            coordinator = coordinator.with_branches(Arc::new(worktrees));
        } else {
            log::debug!("{} is not a git repository, spawns share the project tree", self.project_dir.display());
        }
        Ok(coordinator)
    }

    pub fn driver(&self) -> SpawnDriver {
        SpawnDriver::new(
            self.store.clone(),
            self.catalog.clone(),
            Arc::new(ProcessRunner::new()),
            Arc::new(PlainPromptBuilder),
        )
    }

    pub fn controller(&self) -> Result<LoopController> {
        Ok(LoopController::new(
            self.store.clone(),
            self.catalog.clone(),
            Arc::new(ProcessRunner::new()),
            Arc::new(PlainPromptBuilder),
            Arc::new(self.coordinator()?),
        ))
    }
}
