//! crewloop - hierarchical multi-agent loops for AI coding agents
//!
//! A loop is an ordered list of steps, each run by an agent profile at a
//! position (supervisor, manager, lead). The [`runner::LoopController`] walks
//! the steps cycle after cycle; agents inside a turn use the CLI to spawn
//! children ([`spawn::SpawnCoordinator`]), message later steps, or signal the
//! loop ([`coordination::SignalManager`]). All shared state lives behind the
//! [`store::Store`] trait.

pub mod agent;
pub mod config;
pub mod coordination;
pub mod delegation;
pub mod domain;
pub mod error;
pub mod id;
pub mod policy;
pub mod prompt;
pub mod runner;
pub mod spawn;
pub mod store;

pub use error::{CrewError, Result};
