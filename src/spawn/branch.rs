//! Isolated branches for writable spawns.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{CrewError, Result};

/// Where a spawn's work lives until it is merged or rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnBranch {
    pub name: String,
    pub worktree: PathBuf,
}

pub trait BranchManager: Send + Sync {
    /// Create a branch and working copy for a spawn.
    fn create(&self, spawn_id: &str) -> Result<SpawnBranch>;

    /// Commit outstanding work and merge the branch into the project.
    fn merge(&self, spawn_id: &str) -> Result<()>;

    /// Throw the branch and its working copy away.
    fn discard(&self, spawn_id: &str) -> Result<()>;
}

/// Git worktrees under `base_path`, one `crewloop/<spawn-id>` branch each.
#[derive(Debug)]
pub struct GitWorktrees {
    /// Base path where worktrees are created
    base_path: PathBuf,
    /// Project repository root
    repo_root: PathBuf,
}

fn git(dir: &Path, args: &[&str], what: &str) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| CrewError::Branch(format!("Failed to execute git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CrewError::Branch(format!("Failed to {}: {}", what, stderr.trim())));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl GitWorktrees {
    pub fn new(base_path: impl Into<PathBuf>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            repo_root: repo_root.into(),
        }
    }

    pub fn path(&self, spawn_id: &str) -> PathBuf {
        self.base_path.join(spawn_id)
    }

    fn branch_name(&self, spawn_id: &str) -> String {
        format!("crewloop/{}", spawn_id)
    }

    fn path_str(path: &Path) -> Result<&str> {
        path.to_str()
            .ok_or_else(|| CrewError::Branch(format!("Non UTF-8 path: {}", path.display())))
    }

    fn is_clean(&self, worktree: &Path) -> Result<bool> {
        Ok(git(worktree, &["status", "--porcelain"], "check status")?.trim().is_empty())
    }

    fn auto_commit(&self, spawn_id: &str, worktree: &Path) -> Result<()> {
        if self.is_clean(worktree)? {
            return Ok(());
        }
        git(worktree, &["add", "-A"], "stage changes")?;
        git(worktree, &["commit", "-m", &format!("crewloop: spawn {}", spawn_id)], "commit changes")?;
        Ok(())
    }

    fn remove_worktree(&self, worktree: &Path) -> Result<()> {
        if worktree.exists() {
            git(
                &self.repo_root,
                &["worktree", "remove", Self::path_str(worktree)?, "--force"],
                "remove worktree",
            )?;
        }
        Ok(())
    }
}

impl BranchManager for GitWorktrees {
    fn create(&self, spawn_id: &str) -> Result<SpawnBranch> {
        let worktree = self.path(spawn_id);
        let name = self.branch_name(spawn_id);

        std::fs::create_dir_all(&self.base_path)
            .map_err(|e| CrewError::Branch(format!("Failed to create base path: {}", e)))?;

        git(
            &self.repo_root,
            &["worktree", "add", Self::path_str(&worktree)?, "-b", &name, "HEAD"],
            "create worktree",
        )?;

        tracing::debug!(spawn_id, branch = %name, worktree = %worktree.display(), "Created spawn branch");
        Ok(SpawnBranch { name, worktree })
    }

    fn merge(&self, spawn_id: &str) -> Result<()> {
        let worktree = self.path(spawn_id);
        let name = self.branch_name(spawn_id);

        if worktree.exists() {
            self.auto_commit(spawn_id, &worktree)?;
        }
        self.remove_worktree(&worktree)?;

        let message = format!("Merge spawn {}", spawn_id);
        if let Err(e) = git(&self.repo_root, &["merge", "--no-ff", "-m", &message, &name], "merge branch") {
            let _ = git(&self.repo_root, &["merge", "--abort"], "abort merge");
            return Err(e);
        }
        git(&self.repo_root, &["branch", "-D", &name], "delete branch")?;

        tracing::info!(spawn_id, branch = %name, "Merged spawn branch");
        Ok(())
    }

    fn discard(&self, spawn_id: &str) -> Result<()> {
        let name = self.branch_name(spawn_id);
        self.remove_worktree(&self.path(spawn_id))?;

        // The branch may never have been created
        if let Err(e) = git(&self.repo_root, &["branch", "-D", &name], "delete branch") {
            tracing::warn!(spawn_id, error = %e, "Branch not deleted");
        }
        Ok(())
    }
}
