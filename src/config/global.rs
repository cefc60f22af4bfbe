//! Global configuration.
//!
//! Loaded from `--config`, `.crewloop.yml` or `~/.config/crewloop/crewloop.yml`.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::delegation::{DEFAULT_MAX_PARALLEL, DelegationConfig};
use crate::domain::LoopDefinition;
use crate::policy::DEFAULT_WORKER_ROLE;

/// Global configuration for crewloop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GlobalConfig {
    /// Root of per-project stores; defaults to `<data-local-dir>/crewloop`.
    pub store_dir: Option<PathBuf>,

    /// Where spawn worktrees are created; defaults to `<store>/<project-hash>/worktrees`.
    pub worktree_dir: Option<PathBuf>,

    /// Spawn status polling interval.
    pub poll_interval_ms: u64,

    /// Per-turn time budget; 0 disables it.
    pub turn_timeout_secs: u64,

    /// Run-wide spawn cap when a delegation config leaves it at 0.
    pub default_max_parallel: u32,

    pub default_worker_role: String,

    /// Agent CLIs by name.
    pub agents: BTreeMap<String, AgentConfig>,

    pub profiles: BTreeMap<String, ProfileConfig>,

    /// Worker roles; merged over the built-in ones.
    pub roles: BTreeMap<String, RoleConfig>,

    /// Named delegation configs steps refer to with `team:`.
    pub teams: BTreeMap<String, DelegationConfig>,

    /// Loop definitions by name.
    pub loops: BTreeMap<String, LoopDefinition>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            worktree_dir: None,
            poll_interval_ms: 1000,
            turn_timeout_secs: 0,
            default_max_parallel: DEFAULT_MAX_PARALLEL,
            default_worker_role: DEFAULT_WORKER_ROLE.to_string(),
            agents: BTreeMap::new(),
            profiles: BTreeMap::new(),
            roles: BTreeMap::new(),
            teams: BTreeMap::new(),
            loops: BTreeMap::new(),
        }
    }
}

/// One agent CLI.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AgentConfig {
    /// claude, codex or generic; inferred from the agent name when unset
    pub adapter: Option<String>,

    /// Executable; defaults per adapter
    pub command: Option<String>,

    /// Extra arguments on every invocation
    pub args: Vec<String>,

    pub env: BTreeMap<String, String>,
}

/// A named agent persona: which CLI, which model, how many at once.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProfileConfig {
    pub agent: String,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub env: BTreeMap<String, String>,

    /// Cap on active spawns of this profile across a run; 0 is unlimited
    pub max_instances: u32,

    /// Agent-side iteration bound for one turn
    pub max_turns: Option<u32>,

    pub instructions: Option<String>,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RoleConfig {
    pub can_write: bool,
    pub description: Option<String>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            can_write: true,
            description: None,
        }
    }
}

impl GlobalConfig {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .crewloop.yml in current directory
    /// 3. ~/.config/crewloop/crewloop.yml
    /// 4. Defaults
    ///
    /// Loop definitions found in `.crewloop/loops/*.yml` are merged in afterwards.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_base(config_path)?;
        let project_loops = PathBuf::from(".crewloop/loops");
        if project_loops.is_dir() {
            config.load_loops_from_dir(&project_loops)?;
        }
        Ok(config)
    }

    fn load_base(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_config = PathBuf::from(".crewloop.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from .crewloop.yml");
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load .crewloop.yml: {}", e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("crewloop").join("crewloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Add every `*.yml` / `*.yaml` loop definition in `dir`; files override
    /// loops of the same name.
    pub fn load_loops_from_dir(&mut self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("Failed to read dir: {}", dir.display()))? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "yml" || ext == "yaml") {
                continue;
            }
            let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            let mut def: LoopDefinition = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse loop file {}", path.display()))?;
            if def.name.is_empty()
                && let Some(stem) = path.file_stem()
            {
                def.name = stem.to_string_lossy().to_string();
            }
            log::debug!("Loaded loop '{}' from {}", def.name, path.display());
            self.loops.insert(def.name.clone(), def);
        }
        Ok(())
    }

    /// Resolved store root.
    pub fn store_root(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("crewloop")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = GlobalConfig::default();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.default_max_parallel, 4);
        assert_eq!(config.default_worker_role, "developer");
        assert!(config.loops.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
poll-interval-ms: 250
agents:
  claude:
    args: ["--dangerously-skip-permissions"]
profiles:
  planner:
    agent: claude
    model: opus
  coder:
    agent: claude
    max-instances: 2
roles:
  qa:
    can-write: false
teams:
  core:
    max-parallel: 3
    profiles:
      - profile: coder
loops:
  build:
    steps:
      - profile: planner
        team: core
"#;
        let config = GlobalConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.turn_timeout_secs, 0);
        assert_eq!(config.agents["claude"].args, vec!["--dangerously-skip-permissions"]);
        assert_eq!(config.profiles["coder"].max_instances, 2);
        assert!(!config.roles["qa"].can_write);
        assert_eq!(config.teams["core"].max_parallel, 3);
        assert_eq!(config.loops["build"].steps[0].team.as_deref(), Some("core"));
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("crewloop.yml");
        fs::write(&path, "turn-timeout-secs: 90\n").unwrap();
        let config = GlobalConfig::load(Some(&path)).unwrap();
        assert_eq!(config.turn_timeout_secs, 90);
    }

    #[test]
    fn test_load_explicit_missing_path_fails() {
        let missing = PathBuf::from("/nonexistent/crewloop.yml");
        assert!(GlobalConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_loops_from_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("review.yml"), "steps:\n  - profile: reviewer\n").unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();
        let mut config = GlobalConfig::default();
        config.load_loops_from_dir(temp.path()).unwrap();
        assert_eq!(config.loops.len(), 1);
        assert_eq!(config.loops["review"].steps[0].profile, "reviewer");
    }

    #[test]
    fn test_malformed_loop_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("broken.yml"), "steps: [unterminated\n").unwrap();
        let mut config = GlobalConfig::default();
        let err = config.load_loops_from_dir(temp.path()).unwrap_err();
        assert!(err.to_string().contains("broken.yml"));
        assert!(config.loops.is_empty());
    }
}
