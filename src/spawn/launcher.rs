//! Starting spawn drivers.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::SpawnDriver;
use crate::error::{CrewError, Result};

/// Starts the driver for a freshly admitted spawn without waiting for it.
pub trait ChildLauncher: Send + Sync {
    fn launch(&self, spawn_id: &str) -> Result<()>;
}

/// Drives children as tasks on the current tokio runtime.
pub struct TaskLauncher {
    driver: Arc<SpawnDriver>,
    cancel: CancellationToken,
    handle: Handle,
}

impl TaskLauncher {
    /// Must be called from inside a tokio runtime.
    pub fn new(driver: Arc<SpawnDriver>, cancel: CancellationToken) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| CrewError::Agent(format!("no tokio runtime: {e}")))?;
        Ok(Self { driver, cancel, handle })
    }
}

impl ChildLauncher for TaskLauncher {
    fn launch(&self, spawn_id: &str) -> Result<()> {
        let driver = self.driver.clone();
        let token = self.cancel.child_token();
        let spawn_id = spawn_id.to_string();
        self.handle.spawn(async move {
            match driver.drive(&spawn_id, token).await {
                Ok(status) => tracing::debug!(spawn_id = %spawn_id, status = %status, "Spawn driver done"),
                Err(e) if e.is_cancelled() => tracing::debug!(spawn_id = %spawn_id, "Spawn driver cancelled"),
                Err(e) => tracing::error!(spawn_id = %spawn_id, error = %e, "Spawn driver failed"),
            }
        });
        Ok(())
    }
}

/// Re-executes the `crewloop` binary as `spawn-run --spawn-id <id>`, detached.
///
/// The child process outlives the command that spawned it, so a CLI `spawn`
/// issued from inside an agent session returns immediately.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
    /// Global arguments placed before the subcommand, e.g. `--config`
    args: Vec<String>,
    workdir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: impl Into<PathBuf>, args: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            args,
            workdir: workdir.into(),
        }
    }

    /// Launcher re-running the current executable.
    pub fn current(args: Vec<String>, workdir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args, workdir))
    }
}

impl ChildLauncher for ProcessLauncher {
    fn launch(&self, spawn_id: &str) -> Result<()> {
        let child = tokio::process::Command::new(&self.exe)
            .args(&self.args)
            .args(["spawn-run", "--spawn-id", spawn_id])
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CrewError::Agent(format!("failed to launch spawn {}: {}", spawn_id, e)))?;
        tracing::info!(spawn_id, pid = ?child.id(), "Spawn process launched");
        Ok(())
    }
}
