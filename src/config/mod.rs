//! Configuration system for crewloop.
//!
//! Two layers:
//! 1. [`GlobalConfig`]: the YAML file (`--config`, `.crewloop.yml` or
//!    `~/.config/crewloop/crewloop.yml`) plus loop files under `.crewloop/loops/`
//! 2. [`Catalog`]: the validated view handed to the controller and the spawn
//!    coordinator

mod catalog;
mod global;

pub use self::catalog::Catalog;
pub use self::global::{AgentConfig, GlobalConfig, ProfileConfig, RoleConfig};
