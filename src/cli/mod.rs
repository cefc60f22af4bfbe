//! CLI module for crewloop - command-line interface and subcommands.
//!
//! Provides the argument definitions and the [`App`] context that wires the
//! store, catalog and spawn machinery for a single command.

pub mod app;
pub mod commands;

pub use app::App;
pub use commands::Cli;
