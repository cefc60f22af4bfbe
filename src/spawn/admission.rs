//! Capacity admission.
//!
//! Three independent counters over the non-terminal spawns of one capacity
//! scope. Counting reads the store and acts on the result without a lock, so
//! two concurrent requests can both pass a nearly-full counter.

use crate::delegation::ResolvedDelegation;
use crate::domain::SpawnRecord;

use super::CapacityError;

/// Limits in force for one spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Run-wide cap from the delegation config
    pub max_parallel: u32,
    /// Cap from the authorizing option; 0 is unlimited
    pub option_max: u32,
    /// Cap from the profile's catalog entry; 0 is unlimited
    pub profile_max: u32,
}

fn same_option(spawn: &SpawnRecord, resolved: &ResolvedDelegation) -> bool {
    spawn.profile.eq_ignore_ascii_case(&resolved.option.profile)
        && spawn.position == resolved.position
        && spawn.role == resolved.role
}

/// Check a request against the active spawns of its scope.
pub fn check(active: &[SpawnRecord], resolved: &ResolvedDelegation, limits: Limits) -> Result<(), CapacityError> {
    let active: Vec<&SpawnRecord> = active.iter().filter(|s| !s.status.is_terminal()).collect();

    let total = active.len() as u32;
    if total >= limits.max_parallel {
        return Err(CapacityError::RunWide {
            active: total,
            max: limits.max_parallel,
        });
    }

    if limits.option_max > 0 {
        let count = active.iter().filter(|s| same_option(s, resolved)).count() as u32;
        if count >= limits.option_max {
            return Err(CapacityError::PerOption {
                profile: resolved.option.profile.clone(),
                active: count,
                max: limits.option_max,
            });
        }
    }

    if limits.profile_max > 0 {
        let count = active
            .iter()
            .filter(|s| s.profile.eq_ignore_ascii_case(&resolved.option.profile))
            .count() as u32;
        if count >= limits.profile_max {
            return Err(CapacityError::PerProfile {
                profile: resolved.option.profile.clone(),
                active: count,
                max: limits.profile_max,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::DelegationProfile;
    use crate::domain::SpawnStatus;
    use crate::policy::Position;

    fn resolved(profile: &str, role: &str) -> ResolvedDelegation {
        ResolvedDelegation {
            option: DelegationProfile::new(profile).with_role(role),
            position: Position::Worker,
            role: Some(role.to_string()),
        }
    }

    fn active(profile: &str, role: &str, status: SpawnStatus) -> SpawnRecord {
        let mut spawn = SpawnRecord::new("t", "run", profile, Position::Worker, "task");
        spawn.role = Some(role.to_string());
        spawn.status = status;
        spawn
    }

    fn limits(max_parallel: u32, option_max: u32, profile_max: u32) -> Limits {
        Limits {
            max_parallel,
            option_max,
            profile_max,
        }
    }

    #[test]
    fn test_run_wide_cap() {
        let spawns = vec![
            active("coder", "developer", SpawnStatus::Running),
            active("scout", "scout", SpawnStatus::AwaitingInput),
        ];
        let err = check(&spawns, &resolved("coder", "developer"), limits(2, 0, 0)).unwrap_err();
        assert_eq!(err, CapacityError::RunWide { active: 2, max: 2 });
        assert!(check(&spawns, &resolved("coder", "developer"), limits(3, 0, 0)).is_ok());
    }

    #[test]
    fn test_terminal_spawns_do_not_count() {
        let spawns = vec![
            active("coder", "developer", SpawnStatus::Completed),
            active("coder", "developer", SpawnStatus::Failed),
            active("coder", "developer", SpawnStatus::Merged),
        ];
        assert!(check(&spawns, &resolved("coder", "developer"), limits(1, 1, 1)).is_ok());
    }

    #[test]
    fn test_per_option_counts_matching_role_only() {
        let spawns = vec![active("coder", "qa", SpawnStatus::Running)];
        assert!(check(&spawns, &resolved("coder", "developer"), limits(4, 1, 0)).is_ok());
        let err = check(&spawns, &resolved("coder", "qa"), limits(4, 1, 0)).unwrap_err();
        assert!(matches!(err, CapacityError::PerOption { active: 1, max: 1, .. }));
    }

    #[test]
    fn test_per_profile_spans_roles() {
        let spawns = vec![
            active("coder", "qa", SpawnStatus::Running),
            active("Coder", "developer", SpawnStatus::Running),
        ];
        let err = check(&spawns, &resolved("coder", "scout"), limits(4, 0, 2)).unwrap_err();
        assert!(matches!(err, CapacityError::PerProfile { active: 2, max: 2, .. }));
    }
}
