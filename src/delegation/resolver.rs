//! Resolve a spawn request to exactly one delegation option.

use crate::policy::{Position, normalize_role, sort_roles};

use super::{DelegationConfig, DelegationError, DelegationProfile};

/// What the parent asked to spawn.
#[derive(Debug, Clone, Copy)]
pub struct SpawnQuery<'a> {
    pub profile: &'a str,
    pub role: Option<&'a str>,
    pub position: Option<Position>,
}

impl<'a> SpawnQuery<'a> {
    pub fn new(profile: &'a str) -> Self {
        Self {
            profile,
            role: None,
            position: None,
        }
    }

    pub fn role(mut self, role: &'a str) -> Self {
        self.role = Some(role);
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

/// The authorizing option with position and role settled.
///
/// `option` is a deep copy: its position and role are normalized, its role
/// list is cleared and nested delegation is copied along.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDelegation {
    pub option: DelegationProfile,
    pub position: Position,
    pub role: Option<String>,
}

#[derive(Debug)]
struct Candidate<'a> {
    option: &'a DelegationProfile,
    position: Position,
    roles: Vec<String>,
}

impl Candidate<'_> {
    fn allows_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    fn is_exact_role(&self, role: &str) -> bool {
        self.roles.len() == 1 && self.roles[0] == role
    }
}

/// Resolves spawn requests against a delegation policy.
#[derive(Debug, Clone)]
pub struct DelegationResolver {
    default_role: String,
}

impl DelegationResolver {
    /// `default_role` is the catalog's default worker role.
    pub fn new(default_role: impl Into<String>) -> Self {
        Self {
            default_role: normalize_role(&default_role.into()),
        }
    }

    pub fn resolve(
        &self,
        config: &DelegationConfig,
        query: SpawnQuery<'_>,
    ) -> Result<ResolvedDelegation, DelegationError> {
        let wanted = query.profile.trim();
        let mut candidates: Vec<Candidate<'_>> = config
            .profiles
            .iter()
            .filter(|option| option.profile.trim().eq_ignore_ascii_case(wanted))
            .map(|option| Candidate {
                option,
                position: option.effective_position(),
                roles: option.effective_roles(&self.default_role),
            })
            .collect();

        if candidates.is_empty() {
            return Err(DelegationError::NotInProfiles {
                profile: wanted.to_string(),
            });
        }

        if let Some(position) = query.position {
            candidates.retain(|c| c.position == position);
            if candidates.is_empty() {
                return Err(DelegationError::PositionNotAllowed {
                    profile: wanted.to_string(),
                    position,
                });
            }
        }

        let requested_role = query.role.map(normalize_role).filter(|r| !r.is_empty());
        if let Some(role) = &requested_role {
            candidates.retain(|c| c.position != Position::Worker || c.allows_role(role));
            if candidates.is_empty() {
                return Err(DelegationError::RoleNotAllowed {
                    profile: wanted.to_string(),
                    role: role.clone(),
                });
            }
        }

        let position = match query.position {
            Some(position) => position,
            None => infer_position(wanted, &candidates)?,
        };
        candidates.retain(|c| c.position == position);

        let role = if position == Position::Worker {
            Some(match requested_role {
                Some(role) => role,
                None => infer_role(wanted, &candidates)?,
            })
        } else {
            None
        };

        let mut finalists: Vec<&Candidate<'_>> = candidates
            .iter()
            .filter(|c| role.as_deref().is_none_or(|r| c.allows_role(r)))
            .collect();
        if let Some(role) = role.as_deref()
            && finalists.len() > 1
            && finalists.iter().any(|c| c.is_exact_role(role))
        {
            finalists.retain(|c| c.is_exact_role(role));
        }

        let chosen = match finalists.as_slice() {
            [only] => *only,
            [] => {
                return Err(DelegationError::RoleNotAllowed {
                    profile: wanted.to_string(),
                    role: role.unwrap_or_default(),
                });
            }
            many => {
                return Err(DelegationError::AmbiguousOption {
                    profile: wanted.to_string(),
                    count: many.len(),
                });
            }
        };

        let mut option = chosen.option.clone();
        option.position = Some(position.as_str().to_string());
        option.role = role.clone();
        option.roles.clear();

        Ok(ResolvedDelegation { option, position, role })
    }
}

fn infer_position(profile: &str, candidates: &[Candidate<'_>]) -> Result<Position, DelegationError> {
    let mut positions: Vec<Position> = Vec::new();
    for c in candidates {
        if !positions.contains(&c.position) {
            positions.push(c.position);
        }
    }
    match positions.as_slice() {
        [only] => Ok(*only),
        _ => {
            positions.sort_by_key(|p| p.authority());
            Err(DelegationError::MixedPositions {
                profile: profile.to_string(),
                positions: positions.iter().map(|p| p.as_str().to_string()).collect(),
            })
        }
    }
}

fn infer_role(profile: &str, candidates: &[Candidate<'_>]) -> Result<String, DelegationError> {
    let mut roles: Vec<String> = candidates.iter().flat_map(|c| c.roles.iter().cloned()).collect();
    sort_roles(&mut roles);
    if roles.len() == 1 {
        return Ok(roles.remove(0));
    }
    Err(DelegationError::AmbiguousRole {
        profile: profile.to_string(),
        roles,
    })
}
