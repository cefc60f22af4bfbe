//! Position and role policy
//!
//! Static rules over the four execution tiers (supervisor, manager, lead,
//! worker) and the open set of worker roles. Everything else consults these
//! functions instead of matching on position strings.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CrewError, Result};

/// Execution tier, ordered by authority (supervisor highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Supervisor,
    Manager,
    Lead,
    Worker,
}

/// Worker roles listed first when several roles have to be presented.
pub const ROLE_PRIORITY: [&str; 4] = ["developer", "qa", "scout", "researcher"];

/// Role used for worker options that name none.
pub const DEFAULT_WORKER_ROLE: &str = "developer";

impl Position {
    pub const ALL: [Position; 4] = [
        Position::Supervisor,
        Position::Manager,
        Position::Lead,
        Position::Worker,
    ];

    /// Parse a position name, case-insensitively. Empty or unknown names yield None.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "supervisor" => Some(Position::Supervisor),
            "manager" => Some(Position::Manager),
            "lead" => Some(Position::Lead),
            "worker" => Some(Position::Worker),
            _ => None,
        }
    }

    /// Position of a loop step; defaults to lead.
    pub fn for_step(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or(Position::Lead)
    }

    /// Position of a spawn option; defaults to worker.
    pub fn for_spawn(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or(Position::Worker)
    }

    /// Authority rank, 0 for supervisor.
    pub fn authority(self) -> u8 {
        match self {
            Position::Supervisor => 0,
            Position::Manager => 1,
            Position::Lead => 2,
            Position::Worker => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Position::Supervisor => "supervisor",
            Position::Manager => "manager",
            Position::Lead => "lead",
            Position::Worker => "worker",
        }
    }

    /// Whether work at this position may modify code.
    ///
    /// `role_can_write` is the resolved role's write flag; only consulted for
    /// workers, and an unknown role (None) counts as writable.
    pub fn can_write(self, role_can_write: Option<bool>) -> bool {
        match self {
            Position::Supervisor | Position::Manager => false,
            Position::Lead => true,
            Position::Worker => role_can_write.unwrap_or(true),
        }
    }

    pub fn can_stop_loop(self) -> bool {
        self == Position::Supervisor
    }

    pub fn can_post_messages(self) -> bool {
        self == Position::Supervisor
    }

    pub fn can_call_supervisor(self) -> bool {
        self == Position::Manager
    }

    pub fn can_spawn(self) -> bool {
        matches!(self, Position::Lead | Position::Manager)
    }

    /// Check that team attachment matches the position: managers need a
    /// non-empty team, supervisors and workers must not have one.
    pub fn check_team(self, has_team: bool) -> Result<()> {
        match (self, has_team) {
            (Position::Manager, false) => Err(CrewError::Policy(
                "manager position requires a non-empty team".to_string(),
            )),
            (Position::Supervisor, true) => Err(CrewError::Policy(
                "supervisor position cannot have a team".to_string(),
            )),
            (Position::Worker, true) => Err(CrewError::Policy(
                "worker position cannot have a team".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Validate a loop step's position and team attachment.
    pub fn check_step(self, has_team: bool) -> Result<()> {
        if self == Position::Worker {
            return Err(CrewError::Policy(
                "worker position cannot own a loop step".to_string(),
            ));
        }
        self.check_team(has_team)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a role name for comparison.
pub fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase()
}

/// Order roles by the fixed priority, then lexicographically.
pub fn compare_roles(a: &str, b: &str) -> Ordering {
    let rank = |r: &str| ROLE_PRIORITY.iter().position(|p| *p == r).unwrap_or(ROLE_PRIORITY.len());
    rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
}

/// Sort and dedupe roles for presentation in errors and prompts.
pub fn sort_roles(roles: &mut Vec<String>) {
    roles.sort_by(|a, b| compare_roles(a, b));
    roles.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positions() {
        assert_eq!(Position::parse("Supervisor"), Some(Position::Supervisor));
        assert_eq!(Position::parse(" lead "), Some(Position::Lead));
        assert_eq!(Position::parse(""), None);
        assert_eq!(Position::parse("captain"), None);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Position::for_step(None), Position::Lead);
        assert_eq!(Position::for_step(Some("")), Position::Lead);
        assert_eq!(Position::for_step(Some("manager")), Position::Manager);
        assert_eq!(Position::for_spawn(None), Position::Worker);
        assert_eq!(Position::for_spawn(Some("bogus")), Position::Worker);
    }

    #[test]
    fn test_authority_order() {
        let mut positions = vec![Position::Worker, Position::Supervisor, Position::Lead, Position::Manager];
        positions.sort_by_key(|p| p.authority());
        assert_eq!(positions, Position::ALL.to_vec());
    }

    #[test]
    fn test_write_capability() {
        assert!(!Position::Supervisor.can_write(Some(true)));
        assert!(!Position::Manager.can_write(None));
        assert!(Position::Lead.can_write(Some(false)));
        assert!(Position::Worker.can_write(None));
        assert!(!Position::Worker.can_write(Some(false)));
    }

    #[test]
    fn test_escalation_rights() {
        assert!(Position::Supervisor.can_stop_loop());
        assert!(!Position::Manager.can_stop_loop());
        assert!(Position::Supervisor.can_post_messages());
        assert!(!Position::Lead.can_post_messages());
        assert!(Position::Manager.can_call_supervisor());
        assert!(!Position::Lead.can_call_supervisor());
        assert!(Position::Lead.can_spawn());
        assert!(Position::Manager.can_spawn());
        assert!(!Position::Worker.can_spawn());
        assert!(!Position::Supervisor.can_spawn());
    }

    #[test]
    fn test_team_attachment() {
        assert!(Position::Manager.check_team(false).is_err());
        assert!(Position::Manager.check_team(true).is_ok());
        assert!(Position::Supervisor.check_team(true).is_err());
        assert!(Position::Worker.check_team(true).is_err());
        assert!(Position::Lead.check_team(true).is_ok());
        assert!(Position::Lead.check_team(false).is_ok());
    }

    #[test]
    fn test_worker_cannot_own_step() {
        let err = Position::Worker.check_step(false).unwrap_err();
        assert!(err.to_string().contains("cannot own a loop step"));
    }

    #[test]
    fn test_sort_roles_priority_then_lexicographic() {
        let mut roles = vec![
            "zeta".to_string(),
            "researcher".to_string(),
            "alpha".to_string(),
            "developer".to_string(),
            "qa".to_string(),
            "scout".to_string(),
        ];
        sort_roles(&mut roles);
        assert_eq!(roles, vec!["developer", "qa", "scout", "researcher", "alpha", "zeta"]);
    }
}
