//! Loop runner module - drives loop runs step by step.
//!
//! This module provides:
//! - LoopController, which owns the cycle/step iteration of a run
//! - next-step resolution, including supervisor jumps
//! - LoopEvent / EventSink for progress reporting
//! - LoopOutcome for how a run ended

mod controller;
mod events;
mod next_step;

use std::fmt;

pub use controller::{LoopController, RunHandle};
pub use events::{EVENT_CAPACITY, EventSink, LoopEvent};
pub use next_step::{Advance, NextStep, resolve_next_step};

/// How a loop run ended, short of a step failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Max cycles reached
    Completed { cycles: u32 },
    /// A stop signal honored after `step_index`
    Stopped { cycle: u32, step_index: usize },
    /// Wind-down finished the step at `step_index`
    WoundDown { cycle: u32, step_index: usize },
    Cancelled,
}

impl fmt::Display for LoopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopOutcome::Completed { cycles } => write!(f, "completed after {cycles} cycle(s)"),
            LoopOutcome::Stopped { cycle, step_index } => {
                write!(f, "stopped at cycle {}, step {}", cycle, step_index + 1)
            }
            LoopOutcome::WoundDown { cycle, step_index } => {
                write!(f, "wound down at cycle {}, step {}", cycle, step_index + 1)
            }
            LoopOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}
