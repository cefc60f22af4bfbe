//! Next-step resolution, kept apart from the iteration loop so jumps can be
//! tested on their own.

use crate::domain::LoopStep;
use crate::policy::Position;

/// How the run leaves the step it just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Following step, wrapping to the next cycle after the last
    Next,
    /// Escalate: `target` if given, else the nearest following supervisor step
    JumpToSupervisor { target: Option<usize> },
}

/// Where the run goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextStep {
    pub cycle: u32,
    pub step_index: usize,
    /// Whether a supervisor jump was taken
    pub jumped: bool,
}

fn next(step_count: usize, cycle: u32, step_index: usize) -> NextStep {
    if step_index + 1 >= step_count {
        NextStep {
            cycle: cycle + 1,
            step_index: 0,
            jumped: false,
        }
    } else {
        NextStep {
            cycle,
            step_index: step_index + 1,
            jumped: false,
        }
    }
}

fn is_supervisor(steps: &[LoopStep], index: usize) -> bool {
    steps
        .get(index)
        .is_some_and(|s| s.effective_position() == Position::Supervisor)
}

/// Resolve the (cycle, step) that runs after `step_index` of `cycle`.
///
/// A jump lands on the nearest supervisor step after the current one, or
/// wraps to the first supervisor step of the next cycle. An explicit target
/// that is not ahead in this cycle is taken in the next one. A jump with no
/// supervisor step to land on (or a target that is not a supervisor step)
/// degrades to [`Advance::Next`].
pub fn resolve_next_step(steps: &[LoopStep], cycle: u32, step_index: usize, advance: Advance) -> NextStep {
    let target = match advance {
        Advance::Next => None,
        Advance::JumpToSupervisor { target: Some(target) } => Some(target).filter(|t| is_supervisor(steps, *t)),
        Advance::JumpToSupervisor { target: None } => (step_index + 1..steps.len())
            .find(|i| is_supervisor(steps, *i))
            .or_else(|| (0..steps.len()).find(|i| is_supervisor(steps, *i))),
    };

    match target {
        Some(target) if target > step_index => NextStep {
            cycle,
            step_index: target,
            jumped: true,
        },
        Some(target) => NextStep {
            cycle: cycle + 1,
            step_index: target,
            jumped: true,
        },
        None => next(steps.len(), cycle, step_index),
    }
}
