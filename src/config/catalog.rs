//! Validated agent catalog.
//!
//! Built once from a [`GlobalConfig`] and passed by reference to everything
//! that needs profiles, roles, teams or loop definitions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::global::{GlobalConfig, ProfileConfig, RoleConfig};
use crate::agent::{AgentAdapter, RuntimeConfig};
use crate::delegation::{DelegationConfig, DelegationResolver};
use crate::domain::{LoopDefinition, LoopStep};
use crate::error::{CrewError, Result};
use crate::policy::normalize_role;

/// Roles available when the configuration does not override them.
const BUILTIN_ROLES: [(&str, bool); 4] = [("developer", true), ("qa", false), ("scout", false), ("researcher", false)];

#[derive(Debug, Clone)]
pub struct Catalog {
    config: GlobalConfig,
    roles: BTreeMap<String, RoleConfig>,
}

impl Catalog {
    /// Validate `config` and build the catalog.
    pub fn from_config(mut config: GlobalConfig) -> Result<Self> {
        let mut roles: BTreeMap<String, RoleConfig> = BUILTIN_ROLES
            .iter()
            .map(|(name, can_write)| {
                (
                    name.to_string(),
                    RoleConfig {
                        can_write: *can_write,
                        description: None,
                    },
                )
            })
            .collect();
        for (name, role) in &config.roles {
            roles.insert(normalize_role(name), role.clone());
        }

        for (key, def) in config.loops.iter_mut() {
            if def.name.is_empty() {
                def.name = key.clone();
            }
        }

        let catalog = Self { config, roles };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        for (name, profile) in &self.config.profiles {
            if profile.agent.trim().is_empty() {
                return Err(CrewError::Config(format!("profile {name}: no agent configured")));
            }
            if !self.config.agents.contains_key(&profile.agent) && !is_known_agent(&profile.agent) {
                return Err(CrewError::Config(format!(
                    "profile {name}: unknown agent {:?}",
                    profile.agent
                )));
            }
        }

        for (name, team) in &self.config.teams {
            team.validate()
                .map_err(|e| CrewError::Config(format!("team {name}: {e}")))?;
            self.check_delegation_profiles(team)
                .map_err(|e| CrewError::Config(format!("team {name}: {e}")))?;
        }

        for def in self.config.loops.values() {
            def.validate()?;
            for (i, step) in def.steps.iter().enumerate() {
                let context = |e: String| CrewError::Config(format!("loop {} step {}: {}", def.name, i, e));
                if self.profile(&step.profile).is_none() {
                    return Err(context(format!("unknown profile {:?}", step.profile)));
                }
                if step.delegation.is_none()
                    && let Some(team) = step.team.as_deref().filter(|t| !t.trim().is_empty())
                    && !self.config.teams.contains_key(team)
                {
                    return Err(context(format!("unknown team {team:?}")));
                }
                if let Some(delegation) = &step.delegation {
                    self.check_delegation_profiles(delegation).map_err(context)?;
                }
            }
        }
        Ok(())
    }

    /// Every option in the tree must name a configured profile.
    fn check_delegation_profiles(&self, config: &DelegationConfig) -> std::result::Result<(), String> {
        for option in &config.profiles {
            if self.profile(&option.profile).is_none() {
                return Err(format!("delegation names unknown profile {:?}", option.profile));
            }
            if let Some(nested) = &option.delegation {
                self.check_delegation_profiles(nested)?;
            }
        }
        Ok(())
    }

    /// Look a profile up by exact name, then case-insensitively.
    pub fn profile(&self, name: &str) -> Option<(&str, &ProfileConfig)> {
        let name = name.trim();
        self.config
            .profiles
            .get_key_value(name)
            .or_else(|| {
                self.config
                    .profiles
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
            })
            .map(|(key, profile)| (key.as_str(), profile))
    }

    fn require_profile(&self, name: &str) -> Result<(&str, &ProfileConfig)> {
        self.profile(name)
            .ok_or_else(|| CrewError::Config(format!("unknown profile {name:?}")))
    }

    /// Write flag of a role; None for roles the catalog does not know.
    pub fn role_can_write(&self, role: Option<&str>) -> Option<bool> {
        role.map(normalize_role)
            .and_then(|r| self.roles.get(&r))
            .map(|r| r.can_write)
    }

    pub fn loop_definition(&self, name: &str) -> Result<&LoopDefinition> {
        self.config
            .loops
            .get(name)
            .ok_or_else(|| CrewError::NotFound(format!("loop {name}")))
    }

    pub fn loop_names(&self) -> impl Iterator<Item = &str> {
        self.config.loops.keys().map(String::as_str)
    }

    /// A step's delegation: its inline config, else its named team.
    pub fn step_delegation(&self, step: &LoopStep) -> Result<Option<DelegationConfig>> {
        if let Some(inline) = step.delegation.as_ref().filter(|d| !d.is_empty()) {
            return Ok(Some(inline.clone()));
        }
        match step.team.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(team) => self
                .config
                .teams
                .get(team)
                .cloned()
                .map(Some)
                .ok_or_else(|| CrewError::Config(format!("unknown team {team:?}"))),
            None => Ok(None),
        }
    }

    pub fn resolver(&self) -> DelegationResolver {
        DelegationResolver::new(self.config.default_worker_role.clone())
    }

    pub fn effective_max_parallel(&self, delegation: &DelegationConfig) -> u32 {
        match delegation.max_parallel {
            0 if self.config.default_max_parallel > 0 => self.config.default_max_parallel,
            _ => delegation.effective_max_parallel(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(10))
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        (self.config.turn_timeout_secs > 0).then(|| Duration::from_secs(self.config.turn_timeout_secs))
    }

    pub fn profile_instructions(&self, profile: &str) -> Option<String> {
        self.profile(profile).and_then(|(_, p)| p.instructions.clone())
    }

    pub fn profile_skills(&self, profile: &str) -> Vec<String> {
        self.profile(profile).map(|(_, p)| p.skills.clone()).unwrap_or_default()
    }

    /// Resolve a profile's agent settings for a session in `workdir`.
    pub fn runtime_config(&self, profile: &str, workdir: &Path) -> Result<RuntimeConfig> {
        let (_, profile) = self.require_profile(profile)?;
        let agent_name = profile.agent.as_str();
        let agent = self.config.agents.get(agent_name).cloned().unwrap_or_default();
        let adapter = AgentAdapter::select(agent.adapter.as_deref(), agent_name);

        let mut env = agent.env;
        env.extend(profile.env.clone());

        Ok(RuntimeConfig {
            agent: agent_name.to_string(),
            adapter,
            command: agent.command.unwrap_or_else(|| adapter.default_command(agent_name)),
            args: agent.args,
            model: profile.model.clone(),
            reasoning: profile.reasoning.clone(),
            env,
            workdir: workdir.to_path_buf(),
            max_turns: profile.max_turns,
        })
    }

    /// Directory for spawn worktrees of the project at `project_dir`.
    pub fn worktree_root(&self, project_dir: &Path) -> Result<PathBuf> {
        Ok(match &self.config.worktree_dir {
            Some(dir) => dir.clone(),
            None => self
                .config
                .store_root()
                .join(crate::store::compute_project_hash(project_dir)?)
                .join("worktrees"),
        })
    }
}

/// Agents usable without an `agents:` entry.
fn is_known_agent(name: &str) -> bool {
    matches!(AgentAdapter::select(None, name), AgentAdapter::Claude | AgentAdapter::Codex)
}
