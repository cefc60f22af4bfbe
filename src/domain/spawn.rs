//! SpawnRecord: one child invocation started by a parent turn.
//!
//! Records are never deleted, only driven to a terminal status. The status
//! graph only moves forward:
//!
//! ```text
//! running <-> awaiting_input
//! running | awaiting_input -> completed | failed | canceled
//! completed -> merged | rejected
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CrewError, Result};
use crate::id::{generate_spawn_id, now_ms};
use crate::policy::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStatus {
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Canceled,
    Merged,
    Rejected,
}

impl SpawnStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SpawnStatus::Running | SpawnStatus::AwaitingInput)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnStatus::Running => "running",
            SpawnStatus::AwaitingInput => "awaiting_input",
            SpawnStatus::Completed => "completed",
            SpawnStatus::Failed => "failed",
            SpawnStatus::Canceled => "canceled",
            SpawnStatus::Merged => "merged",
            SpawnStatus::Rejected => "rejected",
        }
    }

    pub fn can_transition(&self, to: SpawnStatus) -> bool {
        use SpawnStatus::*;
        matches!(
            (self, to),
            (Running, AwaitingInput)
                | (AwaitingInput, Running)
                | (Running | AwaitingInput, Completed | Failed | Canceled)
                | (Completed, Merged | Rejected)
        )
    }
}

impl fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxKind {
    /// Guidance sent while the child runs
    Message,
    /// Answer to the child's pending question
    Reply,
}

/// A parent-to-child note waiting to be delivered into the child session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub kind: InboxKind,
    pub body: String,
    pub sent_at: i64,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRecord {
    //=== Identity ===
    pub id: String,
    pub parent_turn_id: String,
    /// Capacity scope (the run id, or the root turn outside a loop)
    pub scope_id: String,
    pub child_turn_id: Option<String>,

    //=== Request ===
    pub profile: String,
    pub role: Option<String>,
    pub position: Position,
    pub task: String,
    /// Follows the parent across step boundaries while still running
    pub handoff: bool,
    pub read_only: bool,

    //=== Workspace ===
    pub branch: Option<String>,
    pub worktree: Option<PathBuf>,

    //=== Lifecycle ===
    pub status: SpawnStatus,
    pub question: Option<String>,
    /// The pending question was already returned to the parent by a wait
    #[serde(default)]
    pub question_reported: bool,
    #[serde(default)]
    pub inbox: Vec<InboxEntry>,
    /// Already returned to the parent by a wait
    #[serde(default)]
    pub reported: bool,
    pub summary: Option<String>,
    pub exit_code: Option<i32>,

    //=== Timestamps ===
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

impl SpawnRecord {
    pub fn new(parent_turn_id: &str, scope_id: &str, profile: &str, position: Position, task: &str) -> Self {
        let now = now_ms();
        Self {
            id: generate_spawn_id(),
            parent_turn_id: parent_turn_id.to_string(),
            scope_id: scope_id.to_string(),
            child_turn_id: None,
            profile: profile.to_string(),
            role: None,
            position,
            task: task.to_string(),
            handoff: false,
            read_only: false,
            branch: None,
            worktree: None,
            status: SpawnStatus::Running,
            question: None,
            question_reported: false,
            inbox: Vec::new(),
            reported: false,
            summary: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `to`, rejecting any transition the status graph forbids.
    pub fn transition(&mut self, to: SpawnStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(CrewError::InvalidState(format!(
                "spawn {} cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        self.updated_at = now_ms();
        if to.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub fn push_inbox(&mut self, kind: InboxKind, body: &str) {
        self.inbox.push(InboxEntry {
            kind,
            body: body.to_string(),
            sent_at: now_ms(),
            delivered: false,
        });
        self.updated_at = now_ms();
    }

    pub fn has_undelivered(&self) -> bool {
        self.inbox.iter().any(|e| !e.delivered)
    }

    /// Mark every pending inbox entry delivered and return them.
    pub fn drain_inbox(&mut self) -> Vec<InboxEntry> {
        let mut drained = Vec::new();
        for entry in self.inbox.iter_mut().filter(|e| !e.delivered) {
            entry.delivered = true;
            drained.push(entry.clone());
        }
        drained
    }
}
