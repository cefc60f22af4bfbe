//! CLI command definitions using clap.
//!
//! Two audiences share one binary:
//! - operators: `loop run|resume|list|show`, plus the loop signals
//! - agents inside a turn: `spawn`, `wait-for-spawns`, the `spawn-*`
//!   family and `ask`, which find their turn through `CREWLOOP_TURN_ID`

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// crewloop - hierarchical multi-agent loops for AI coding agents
#[derive(Parser, Debug)]
#[command(name = "crewloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    /// Turn issuing the command; set automatically inside agent sessions
    #[arg(long, global = true, env = "CREWLOOP_TURN_ID", hide_env_values = true)]
    pub turn: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Global arguments to forward to re-executed child processes.
    pub fn forwarded_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        if let Some(project) = &self.project {
            args.push("--project".to_string());
            args.push(project.display().to_string());
        }
        args
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Loop run management and loop signals
    Loop {
        #[command(subcommand)]
        command: LoopCommands,
    },

    /// Start a child agent under the current turn
    Spawn {
        /// Delegation profile to run
        #[arg(short, long)]
        profile: String,

        /// Worker role
        #[arg(short, long)]
        role: Option<String>,

        /// Position (lead or worker)
        #[arg(long)]
        position: Option<String>,

        /// Task for the child
        task: String,
    },

    /// Drive a spawn's child session (used by `spawn`)
    #[command(hide = true)]
    SpawnRun {
        #[arg(long)]
        spawn_id: String,
    },

    /// Block until a spawn of the current turn finishes or asks a question
    WaitForSpawns {
        /// Give up after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Wait until every spawn has finished
        #[arg(short, long)]
        all: bool,
    },

    /// Show spawns of the current turn, or one spawn
    SpawnStatus {
        /// Spawn to show
        id: Option<String>,
    },

    /// Merge a completed spawn's branch
    SpawnMerge { id: String },

    /// Discard a completed spawn's branch
    SpawnReject { id: String },

    /// Queue a note for a spawn's next session
    SpawnMessage { id: String, body: String },

    /// Preempt a spawn's running session with a note
    SpawnInterrupt {
        id: String,

        #[arg(short, long, default_value = "interrupted by parent")]
        reason: String,
    },

    /// Answer a spawn's question
    SpawnReply { id: String, body: String },

    /// Cancel a spawn
    SpawnCancel { id: String },

    /// Ask the parent turn a question (from inside a spawn)
    Ask { question: String },
}

/// Loop subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum LoopCommands {
    /// Start a configured loop in the foreground
    Run {
        /// Loop name
        name: String,

        /// Override the loop's max cycles (0 = unbounded)
        #[arg(short, long)]
        max_cycles: Option<u32>,
    },

    /// Continue a cancelled or failed run
    Resume { run_id: String },

    /// List runs of this project
    List,

    /// Show one run
    Show { run_id: String },

    /// Stop the run after the current step (honored on can-stop steps)
    Stop {
        #[arg(long)]
        run: Option<String>,
    },

    /// Finish the current step, then stop
    WindDown {
        #[arg(long)]
        run: Option<String>,
    },

    /// Post a message to later steps
    Message {
        body: String,

        #[arg(long)]
        run: Option<String>,
    },

    /// Escalate to a supervisor step
    CallSupervisor {
        #[arg(long)]
        run: Option<String>,

        /// 1-based supervisor step to jump to
        #[arg(short, long)]
        target: Option<usize>,

        #[arg(short, long, default_value = "")]
        reason: String,
    },
}
