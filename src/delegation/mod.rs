//! Delegation policy
//!
//! A [`DelegationConfig`] lists the spawn options a turn may use. Options can
//! nest their own delegation (a lead or manager child that delegates further),
//! which makes the config a tree. Workers never carry child delegation, so the
//! tree is acyclic by construction and `Clone` is a full deep copy.

mod resolver;

pub use resolver::{DelegationResolver, ResolvedDelegation, SpawnQuery};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{Position, normalize_role};

/// Default run-wide cap on concurrently active spawns.
pub const DEFAULT_MAX_PARALLEL: u32 = 4;

/// Why a spawn request could not be authorized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    #[error("profile {profile:?} is not in delegation profiles")]
    NotInProfiles { profile: String },

    #[error("profile {profile:?} cannot be spawned as role {role}")]
    RoleNotAllowed { profile: String, role: String },

    #[error("profile {profile:?} cannot be spawned as position {position}")]
    PositionNotAllowed { profile: String, position: Position },

    #[error("profile {profile:?} has mixed positions ({}); specify a position", .positions.join(", "))]
    MixedPositions { profile: String, positions: Vec<String> },

    #[error("profile {profile:?} has multiple roles ({}); specify a role", .roles.join(", "))]
    AmbiguousRole { profile: String, roles: Vec<String> },

    #[error("profile {profile:?} matches {count} delegation options; make the options distinct")]
    AmbiguousOption { profile: String, count: usize },

    #[error("no delegation configured for this turn")]
    NoDelegation,

    #[error("invalid delegation: {0}")]
    Invalid(String),
}

/// Spawn options available to a step or turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DelegationConfig {
    /// Spawnable options.
    pub profiles: Vec<DelegationProfile>,

    /// Cap on concurrently active spawns; 0 means the default of 4.
    pub max_parallel: u32,

    /// Free-form delegation style directive handed to the prompt.
    pub style: Option<String>,
}

/// One spawn option.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DelegationProfile {
    /// Target profile name.
    pub profile: String,

    /// Allowed position; defaults to worker.
    pub position: Option<String>,

    /// Single allowed role (workers only).
    pub role: Option<String>,

    /// Allowed roles (workers only), used when `role` is unset.
    pub roles: Vec<String>,

    /// Cap on active spawns of this option; 0 is unlimited.
    pub max_instances: u32,

    /// Whether a still-running spawn moves to the next step's turn.
    pub handoff: bool,

    /// Nested options for a lead or manager child.
    pub delegation: Option<DelegationConfig>,
}

impl DelegationConfig {
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn effective_max_parallel(&self) -> u32 {
        if self.max_parallel == 0 {
            DEFAULT_MAX_PARALLEL
        } else {
            self.max_parallel
        }
    }

    /// Validate the whole tree.
    pub fn validate(&self) -> Result<(), DelegationError> {
        for option in &self.profiles {
            option.validate()?;
        }
        Ok(())
    }
}

impl DelegationProfile {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Default::default()
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position.as_str().to_string());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_instances(mut self, max: u32) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_handoff(mut self, handoff: bool) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_delegation(mut self, delegation: DelegationConfig) -> Self {
        self.delegation = Some(delegation);
        self
    }

    pub fn effective_position(&self) -> Position {
        Position::for_spawn(self.position.as_deref())
    }

    /// Roles this option can be spawned as.
    ///
    /// Explicit single role wins, then the deduplicated role list in
    /// first-seen order, then the catalog default. Non-workers have none.
    pub fn effective_roles(&self, default_role: &str) -> Vec<String> {
        if self.effective_position() != Position::Worker {
            return Vec::new();
        }
        if let Some(role) = self.role.as_deref().map(normalize_role).filter(|r| !r.is_empty()) {
            return vec![role];
        }
        let mut roles: Vec<String> = Vec::new();
        for role in self.roles.iter().map(|r| normalize_role(r)) {
            if !role.is_empty() && !roles.contains(&role) {
                roles.push(role);
            }
        }
        if roles.is_empty() {
            roles.push(normalize_role(default_role));
        }
        roles
    }

    pub fn has_child_delegation(&self) -> bool {
        self.delegation.as_ref().is_some_and(|d| !d.is_empty())
    }

    fn declares_roles(&self) -> bool {
        self.role.as_deref().is_some_and(|r| !r.trim().is_empty()) || !self.roles.is_empty()
    }

    fn validate(&self) -> Result<(), DelegationError> {
        if self.profile.trim().is_empty() {
            return Err(DelegationError::Invalid("delegation option without a profile".to_string()));
        }
        if let Some(raw) = self.position.as_deref()
            && !raw.trim().is_empty()
            && Position::parse(raw).is_none()
        {
            return Err(DelegationError::Invalid(format!(
                "profile {:?} has unknown position {:?}",
                self.profile, raw
            )));
        }

        let position = self.effective_position();
        match position {
            Position::Worker if self.has_child_delegation() => {
                return Err(DelegationError::Invalid(format!(
                    "worker profile {:?} cannot declare child delegation",
                    self.profile
                )));
            }
            Position::Supervisor => {
                return Err(DelegationError::Invalid(format!(
                    "profile {:?} cannot be spawned as supervisor",
                    self.profile
                )));
            }
            Position::Manager if !self.has_child_delegation() => {
                return Err(DelegationError::Invalid(format!(
                    "manager profile {:?} requires child delegation",
                    self.profile
                )));
            }
            _ => {}
        }
        if position != Position::Worker && self.declares_roles() {
            return Err(DelegationError::Invalid(format!(
                "{} profile {:?} cannot declare roles",
                position, self.profile
            )));
        }

        if let Some(child) = &self.delegation {
            child.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str) -> DelegationProfile {
        DelegationProfile::new(name)
    }

    fn team(profiles: Vec<DelegationProfile>) -> DelegationConfig {
        DelegationConfig {
            profiles,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_max_parallel() {
        assert_eq!(DelegationConfig::default().effective_max_parallel(), 4);
        let config = DelegationConfig {
            max_parallel: 2,
            ..Default::default()
        };
        assert_eq!(config.effective_max_parallel(), 2);
    }

    #[test]
    fn test_effective_roles_precedence() {
        let single = worker("dev").with_role("QA").with_roles(["scout"]);
        assert_eq!(single.effective_roles("developer"), vec!["qa"]);

        let list = worker("dev").with_roles(["scout", "qa", "Scout"]);
        assert_eq!(list.effective_roles("developer"), vec!["scout", "qa"]);

        let fallback = worker("dev");
        assert_eq!(fallback.effective_roles("developer"), vec!["developer"]);
    }

    #[test]
    fn test_non_worker_has_no_roles() {
        let lead = worker("planner").with_position(Position::Lead);
        assert!(lead.effective_roles("developer").is_empty());
    }

    #[test]
    fn test_worker_with_child_delegation_rejected() {
        let config = team(vec![worker("dev").with_delegation(team(vec![worker("helper")]))]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot declare child delegation"));
    }

    #[test]
    fn test_worker_with_empty_child_delegation_allowed() {
        let config = team(vec![worker("dev").with_delegation(DelegationConfig::default())]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_worker_violation_found_deep_in_tree() {
        let inner_lead = worker("inner")
            .with_position(Position::Lead)
            .with_delegation(team(vec![worker("bad").with_delegation(team(vec![worker("x")]))]));
        let config = team(vec![
            worker("outer")
                .with_position(Position::Manager)
                .with_delegation(team(vec![inner_lead])),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_manager_requires_child_delegation() {
        let config = team(vec![worker("boss").with_position(Position::Manager)]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requires child delegation"));
    }

    #[test]
    fn test_supervisor_option_rejected() {
        let config = team(vec![worker("sup").with_position(Position::Supervisor)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_worker_roles_rejected() {
        let config = team(vec![worker("planner").with_position(Position::Lead).with_role("qa")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_position_rejected() {
        let mut option = worker("dev");
        option.position = Some("captain".to_string());
        assert!(team(vec![option]).validate().is_err());
    }

    #[test]
    fn test_clone_is_deep() {
        let original = team(vec![
            worker("lead")
                .with_position(Position::Lead)
                .with_delegation(team(vec![worker("dev").with_roles(["developer", "qa"])])),
        ]);
        let mut copy = original.clone();
        copy.profiles[0].profile = "changed".to_string();
        let nested = copy.profiles[0].delegation.as_mut().unwrap();
        nested.profiles[0].roles.push("scout".to_string());
        nested.profiles.push(worker("extra"));

        assert_eq!(original.profiles[0].profile, "lead");
        let original_nested = original.profiles[0].delegation.as_ref().unwrap();
        assert_eq!(original_nested.profiles.len(), 1);
        assert_eq!(original_nested.profiles[0].roles, vec!["developer", "qa"]);
    }

    #[test]
    fn test_yaml_shape() {
        let yaml = r#"
max-parallel: 3
style: "prefer small tasks"
profiles:
  - profile: coder
    roles: [developer, qa]
    max-instances: 2
    handoff: true
  - profile: planner
    position: lead
    delegation:
      profiles:
        - profile: coder
"#;
        let config: DelegationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.profiles.len(), 2);
        assert!(config.profiles[0].handoff);
        assert_eq!(config.profiles[0].max_instances, 2);
        assert_eq!(config.profiles[1].effective_position(), Position::Lead);
        assert!(config.validate().is_ok());
    }
}
