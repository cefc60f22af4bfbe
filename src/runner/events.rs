//! Progress events from a running loop.

use tokio::sync::mpsc;

use super::LoopOutcome;
use crate::agent::{SessionObserver, TranscriptEvent, TurnResult};
use crate::policy::Position;
use crate::spawn::SpawnSnapshot;

/// Capacity of the channel returned by [`EventSink::channel`].
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    RunStarted {
        run_id: String,
        loop_name: String,
        cycle: u32,
        step_index: usize,
    },
    StepStarted {
        cycle: u32,
        step_index: usize,
        profile: String,
        position: Position,
    },
    TurnStarted {
        turn_id: String,
        iteration: u32,
    },
    SessionStarted {
        turn_id: String,
        session_id: String,
    },
    Transcript {
        turn_id: String,
        event: TranscriptEvent,
    },
    TurnFinished {
        turn_id: String,
        exit_code: i32,
        interrupted: bool,
    },
    /// Children of the running turn changed
    Spawns {
        turn_id: String,
        spawns: Vec<SpawnSnapshot>,
    },
    StepFinished {
        cycle: u32,
        step_index: usize,
    },
    SupervisorCalled {
        from_step: usize,
        cycle: u32,
        step_index: usize,
    },
    RunFinished {
        outcome: LoopOutcome,
    },
}

/// Best-effort event publication. Events are dropped when the channel is full
/// or closed; an empty sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::Sender<LoopEvent>>);

impl EventSink {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(tx: mpsc::Sender<LoopEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LoopEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.0
            && let Err(e) = tx.try_send(event)
        {
            tracing::trace!("Dropped loop event: {}", e);
        }
    }
}

/// Forwards a turn's session callbacks to the sink.
pub(crate) struct SinkObserver<'a> {
    pub sink: &'a EventSink,
    pub turn_id: &'a str,
}

impl SessionObserver for SinkObserver<'_> {
    fn session_started(&self, session_id: &str) {
        self.sink.emit(LoopEvent::SessionStarted {
            turn_id: self.turn_id.to_string(),
            session_id: session_id.to_string(),
        });
    }

    fn transcript(&self, event: &TranscriptEvent) {
        self.sink.emit(LoopEvent::Transcript {
            turn_id: self.turn_id.to_string(),
            event: event.clone(),
        });
    }

    fn session_ended(&self, result: &TurnResult) {
        tracing::debug!(turn_id = %self.turn_id, exit_code = result.exit_code, "Session ended");
    }
}
