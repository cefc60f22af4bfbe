//! Domain records for crewloop
//!
//! - LoopDefinition / LoopStep: the configured workflow
//! - LoopRun: one running instance with its cycle, step and signal state
//! - Turn: one agent execution
//! - SpawnRecord: one child invocation owned by a turn
//! - LoopMessage: inter-step notes ordered by id

pub mod loop_def;
pub mod loop_run;
pub mod message;
pub mod spawn;
pub mod turn;

pub use loop_def::{LoopDefinition, LoopStep};
pub use loop_run::{CallSupervisor, LoopRun, RunSignals, RunStatus};
pub use message::LoopMessage;
pub use spawn::{InboxEntry, InboxKind, SpawnRecord, SpawnStatus};
pub use turn::{Turn, TurnOrigin, TurnStatus};
