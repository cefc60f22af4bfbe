//! LoopRun: one running instance of a loop definition.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::LoopDefinition;
use crate::id::{generate_run_id, now_ms};

/// Status of a loop run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    /// Ended by a stop or wind-down signal
    Stopped,
    Cancelled,
    /// Max cycles reached
    Completed,
    /// Aborted by a step error
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending call-supervisor escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSupervisor {
    /// Step that raised the call
    pub from_step: usize,
    /// Explicit supervisor step to jump to
    pub target: Option<usize>,
    pub reason: String,
    pub requested_at: i64,
}

/// Signal state set from outside the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSignals {
    pub stop: bool,
    pub wind_down: bool,
    pub call_supervisor: Option<CallSupervisor>,
}

impl RunSignals {
    pub fn any(&self) -> bool {
        self.stop || self.wind_down || self.call_supervisor.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRun {
    //=== Identity ===
    pub id: String,
    pub loop_name: String,

    /// Snapshot of the definition taken at run start
    pub definition: LoopDefinition,

    /// Working directory every step turn runs in
    pub workdir: PathBuf,

    //=== Position ===
    /// 1-based cycle counter
    pub cycle: u32,
    pub step_index: usize,
    /// 0 is unbounded
    pub max_cycles: u32,
    pub status: RunStatus,

    //=== Context hand-off ===
    /// Highest loop-message id each step has seen
    #[serde(default)]
    pub step_last_seen_msg: BTreeMap<usize, i64>,

    /// Agent session ids, in execution order
    #[serde(default)]
    pub session_ids: Vec<String>,

    /// Spawn ids waiting to be adopted by the next executed turn
    #[serde(default)]
    pub pending_handoffs: Vec<String>,

    #[serde(default)]
    pub signals: RunSignals,

    pub error: Option<String>,

    //=== Timestamps ===
    pub created_at: i64,
    pub updated_at: i64,
}

impl LoopRun {
    pub fn new(definition: LoopDefinition, workdir: impl Into<PathBuf>, max_cycles: u32) -> Self {
        let now = now_ms();
        Self {
            id: generate_run_id(),
            loop_name: definition.name.clone(),
            definition,
            workdir: workdir.into(),
            cycle: 1,
            step_index: 0,
            max_cycles,
            status: RunStatus::Running,
            step_last_seen_msg: BTreeMap::new(),
            session_ids: Vec::new(),
            pending_handoffs: Vec::new(),
            signals: RunSignals::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Last-seen message id for a step; 0 when it has seen none.
    pub fn watermark(&self, step_index: usize) -> i64 {
        self.step_last_seen_msg.get(&step_index).copied().unwrap_or(0)
    }

    /// Raise a step's watermark. Never lowers it.
    pub fn advance_watermark(&mut self, step_index: usize, message_id: i64) {
        let entry = self.step_last_seen_msg.entry(step_index).or_insert(0);
        if message_id > *entry {
            *entry = message_id;
        }
    }

    /// Queue spawns for adoption, ignoring ids already queued.
    pub fn queue_handoffs<I: IntoIterator<Item = String>>(&mut self, spawn_ids: I) {
        for id in spawn_ids {
            if !self.pending_handoffs.contains(&id) {
                self.pending_handoffs.push(id);
            }
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LoopStep;

    fn run() -> LoopRun {
        LoopRun::new(LoopDefinition::new("l", vec![LoopStep::new("a")]), "/tmp", 0)
    }

    #[test]
    fn test_new_run_starts_at_first_cycle() {
        let run = run();
        assert!(run.id.starts_with("run-"));
        assert_eq!(run.cycle, 1);
        assert_eq!(run.step_index, 0);
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.signals.any());
    }

    #[test]
    fn test_watermark_never_decreases() {
        let mut run = run();
        assert_eq!(run.watermark(0), 0);
        run.advance_watermark(0, 5);
        run.advance_watermark(0, 3);
        assert_eq!(run.watermark(0), 5);
        run.advance_watermark(0, 9);
        assert_eq!(run.watermark(0), 9);
        assert_eq!(run.watermark(1), 0);
    }

    #[test]
    fn test_queue_handoffs_dedupes() {
        let mut run = run();
        run.queue_handoffs(vec!["s1".to_string(), "s2".to_string()]);
        run.queue_handoffs(vec!["s2".to_string(), "s3".to_string()]);
        assert_eq!(run.pending_handoffs, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_json_roundtrip_keeps_watermarks() {
        let mut run = run();
        run.advance_watermark(2, 7);
        let json = serde_json::to_string(&run).unwrap();
        let back: LoopRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.watermark(2), 7);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        for status in [RunStatus::Stopped, RunStatus::Cancelled, RunStatus::Completed, RunStatus::Failed] {
            assert!(status.is_terminal());
        }
    }
}
