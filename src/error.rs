//! Error types for crewloop
//!
//! Centralized error handling using thiserror. Delegation and capacity
//! failures keep their own enums so callers can match on the exact cause.

use thiserror::Error;

use crate::delegation::DelegationError;
use crate::spawn::CapacityError;

/// All error types that can occur in crewloop
#[derive(Debug, Error)]
pub enum CrewError {
    /// Unknown profile/agent/team, malformed loop definition
    #[error("Config error: {0}")]
    Config(String),

    /// Position/role policy violation
    #[error("Policy violation: {0}")]
    Policy(String),

    /// Spawn request could not be authorized
    #[error(transparent)]
    Delegation(#[from] DelegationError),

    /// Spawn request exceeded a capacity limit
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// Record not found in storage
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Underlying agent process failure
    #[error("Agent error: {0}")]
    Agent(String),

    /// Spawn branch (git worktree) error
    #[error("Branch error: {0}")]
    Branch(String),

    /// A turn exceeded its time budget
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// A loop step failed; the run is aborted
    #[error("step {step_index} ({profile}) failed: {source}")]
    Step {
        step_index: usize,
        profile: String,
        #[source]
        source: Box<CrewError>,
    },

    /// The surrounding cancellation signal fired
    #[error("Cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrewError {
    /// Wrap an error with the step it happened in. Cancellation passes through untouched.
    pub fn at_step(self, step_index: usize, profile: &str) -> Self {
        match self {
            CrewError::Cancelled | CrewError::Step { .. } => self,
            other => CrewError::Step {
                step_index,
                profile: profile.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns true if this error (or the step error it wraps) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            CrewError::Cancelled => true,
            CrewError::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for CrewError {
    fn from(err: rusqlite::Error) -> Self {
        CrewError::Storage(err.to_string())
    }
}

/// Result type alias for crewloop operations
pub type Result<T> = std::result::Result<T, CrewError>;
