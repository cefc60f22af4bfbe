use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod cli;

use cli::commands::{Commands, LoopCommands};
use cli::{App, Cli};
use crewloop::domain::{LoopRun, RunStatus, SpawnRecord, SpawnStatus};
use crewloop::policy::Position;
use crewloop::runner::{LoopEvent, RunHandle};
use crewloop::spawn::SpawnRequest;

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("crewloop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("crewloop.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Token cancelled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            cancel.cancel();
        }
    });
    token
}

async fn run_application(cli: &Cli) -> Result<()> {
    let app = App::load(cli)?;
    info!("Starting command {:?} in {}", cli.command, app.project_dir().display());

    match &cli.command {
        Commands::Loop { command } => handle_loop_command(command, &app, cli.is_verbose()).await,
        Commands::Spawn {
            profile,
            role,
            position,
            task,
        } => handle_spawn(&app, profile, role.as_deref(), position.as_deref(), task),
        Commands::SpawnRun { spawn_id } => handle_spawn_run(&app, spawn_id).await,
        Commands::WaitForSpawns { timeout, all } => handle_wait_for_spawns(&app, *timeout, *all).await,
        Commands::SpawnStatus { id } => handle_spawn_status(&app, id.as_deref()),
        Commands::SpawnMerge { id } => {
            let spawn = app.coordinator()?.merge(id, app.turn())?;
            println!("{} {} ({})", "Merged:".green(), spawn.id, spawn.branch.unwrap_or_default());
            Ok(())
        }
        Commands::SpawnReject { id } => {
            let spawn = app.coordinator()?.reject(id, app.turn())?;
            println!("{} {}", "Rejected:".yellow(), spawn.id);
            Ok(())
        }
        Commands::SpawnMessage { id, body } => {
            app.coordinator()?.message(id, app.turn(), body)?;
            println!("{} {}", "Queued note for".green(), id);
            Ok(())
        }
        Commands::SpawnInterrupt { id, reason } => {
            app.coordinator()?.interrupt(id, app.turn(), reason)?;
            println!("{} {}", "Interrupted:".yellow(), id);
            Ok(())
        }
        Commands::SpawnReply { id, body } => {
            app.coordinator()?.reply(id, app.turn(), body)?;
            println!("{} {}", "Replied to".green(), id);
            Ok(())
        }
        Commands::SpawnCancel { id } => {
            let spawn = app.coordinator()?.cancel(id, app.turn())?;
            println!("{} {}", "Canceled:".red(), spawn.id);
            Ok(())
        }
        Commands::Ask { question } => {
            let spawn = app.coordinator()?.ask(app.require_turn()?, question)?;
            println!(
                "{} Question sent. Stop here; the answer arrives when your session resumes ({})",
                "Asked:".cyan(),
                spawn.id
            );
            Ok(())
        }
    }
}

async fn handle_loop_command(command: &LoopCommands, app: &App, verbose: bool) -> Result<()> {
    info!("Handling loop command: {:?}", command);
    match command {
        LoopCommands::Run { name, max_cycles } => {
            let controller = Arc::new(app.controller()?);
            let run = controller.create_run(name, app.project_dir(), *max_cycles)?;
            println!("{} {} ({})", "Started:".green(), run.loop_name, run.id);
            follow_run(controller.start(&run.id), verbose).await
        }
        LoopCommands::Resume { run_id } => {
            let controller = Arc::new(app.controller()?);
            println!("{} {}", "Resuming:".green(), run_id);
            follow_run(controller.start_resume(run_id), verbose).await
        }
        LoopCommands::List => {
            let names: Vec<&str> = app.catalog().loop_names().collect();
            if !names.is_empty() {
                println!("{} {}", "Loops:".bold(), names.join(", "));
            }
            let runs = app.store().list_loop_runs()?;
            if runs.is_empty() {
                println!("{}", "No loop runs".dimmed());
            }
            for run in runs {
                print_run_line(&run);
            }
            Ok(())
        }
        LoopCommands::Show { run_id } => handle_loop_show(app, run_id),
        LoopCommands::Stop { run } => {
            let caller = app.caller()?;
            let run_id = caller.run_id(run.as_deref())?;
            app.signals().stop(&caller, &run_id)?;
            println!("{} {}", "Stop requested:".yellow(), run_id);
            Ok(())
        }
        LoopCommands::WindDown { run } => {
            let caller = app.caller()?;
            let run_id = caller.run_id(run.as_deref())?;
            app.signals().wind_down(&caller, &run_id)?;
            println!("{} {}", "Wind-down requested:".yellow(), run_id);
            Ok(())
        }
        LoopCommands::Message { body, run } => {
            let caller = app.caller()?;
            let run_id = caller.run_id(run.as_deref())?;
            let message = app.signals().post_message(&caller, &run_id, body)?;
            println!("{} #{}", "Posted message".green(), message.id);
            Ok(())
        }
        LoopCommands::CallSupervisor { run, target, reason } => {
            let target = match target {
                Some(0) => bail!("Steps are numbered from 1"),
                Some(t) => Some(t - 1),
                None => None,
            };
            let caller = app.caller()?;
            let run_id = caller.run_id(run.as_deref())?;
            app.signals().call_supervisor(&caller, &run_id, target, reason)?;
            println!("{} {}", "Supervisor called:".yellow(), run_id);
            Ok(())
        }
    }
}

/// Print events until the run ends; Ctrl-C cancels it.
async fn follow_run(mut handle: RunHandle, verbose: bool) -> Result<()> {
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling loop run");
            cancel.cancel();
        }
    });

    while let Some(event) = handle.events.recv().await {
        print_event(&event, verbose);
    }
    let outcome = handle.join.await.context("Loop task panicked")??;
    println!("{} {} ({})", "Finished:".green(), handle.run_id, outcome);
    Ok(())
}

fn print_event(event: &LoopEvent, verbose: bool) {
    match event {
        LoopEvent::StepStarted {
            cycle,
            step_index,
            profile,
            position,
        } => println!(
            "{} cycle {} step {}: {} ({})",
            "==>".cyan().bold(),
            cycle,
            step_index + 1,
            profile.bold(),
            position
        ),
        LoopEvent::TurnStarted { turn_id, iteration } => {
            println!("  {} turn {} ({})", "->".cyan(), iteration + 1, turn_id.dimmed())
        }
        LoopEvent::Transcript { event, .. } if verbose => {
            if let Some(text) = &event.text {
                println!("    {}", text.dimmed());
            }
        }
        LoopEvent::TurnFinished {
            exit_code, interrupted, ..
        } => {
            if *interrupted {
                println!("  {} interrupted", "<-".yellow());
            } else if *exit_code == 0 {
                println!("  {} done", "<-".green());
            } else {
                println!("  {} exit code {}", "<-".red(), exit_code);
            }
        }
        LoopEvent::Spawns { spawns, .. } => {
            for spawn in spawns {
                println!("    {} {} {}", spawn.id.dimmed(), spawn.profile, colored_spawn_status(spawn.status));
            }
        }
        LoopEvent::SupervisorCalled { cycle, step_index, .. } => println!(
            "{} supervisor called, jumping to cycle {} step {}",
            "!!".yellow().bold(),
            cycle,
            step_index + 1
        ),
        _ => {}
    }
}

fn colored_run_status(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Running => status.as_str().cyan(),
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Stopped => status.as_str().yellow(),
        RunStatus::Cancelled => status.as_str().dimmed(),
        RunStatus::Failed => status.as_str().red(),
    }
}

fn colored_spawn_status(status: SpawnStatus) -> ColoredString {
    match status {
        SpawnStatus::Completed | SpawnStatus::Merged => status.as_str().green(),
        SpawnStatus::Failed => status.as_str().red(),
        SpawnStatus::AwaitingInput => status.as_str().yellow(),
        SpawnStatus::Canceled | SpawnStatus::Rejected => status.as_str().dimmed(),
        _ => status.as_str().cyan(),
    }
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

fn print_run_line(run: &LoopRun) {
    let cycles = if run.max_cycles == 0 {
        "∞".to_string()
    } else {
        run.max_cycles.to_string()
    };
    println!(
        "{}  {:<20} {:<10} cycle {}/{} step {}  {}",
        run.id,
        run.loop_name,
        colored_run_status(run.status),
        run.cycle,
        cycles,
        run.step_index + 1,
        format_time(run.created_at).dimmed()
    );
}

fn handle_loop_show(app: &App, run_id: &str) -> Result<()> {
    let Some(run) = app.store().get_loop_run(run_id)? else {
        bail!("Loop run not found: {}", run_id);
    };
    print_run_line(&run);
    if let Some(error) = &run.error {
        println!("  {} {}", "error:".red(), error);
    }
    let signals = &run.signals;
    if signals.any() {
        println!(
            "  signals: stop={} wind-down={} call-supervisor={}",
            signals.stop,
            signals.wind_down,
            signals.call_supervisor.is_some()
        );
    }
    for (index, step) in run.definition.steps.iter().enumerate() {
        let marker = if index == run.step_index { ">" } else { " " };
        println!(
            "  {} {}. {} ({}, {} turn(s))",
            marker,
            index + 1,
            step.profile,
            step.effective_position(),
            step.effective_turns()
        );
    }
    for turn in app.store().list_turns(run_id)? {
        println!(
            "    {} {:<12} {:?} {}",
            turn.id.dimmed(),
            turn.profile,
            turn.status,
            format_time(turn.started_at).dimmed()
        );
    }
    Ok(())
}

fn handle_spawn(app: &App, profile: &str, role: Option<&str>, position: Option<&str>, task: &str) -> Result<()> {
    let parent = app.require_turn()?;
    let mut request = SpawnRequest::new(profile, task);
    if let Some(role) = role {
        request = request.with_role(role);
    }
    if let Some(position) = position {
        let Some(position) = Position::parse(position) else {
            bail!("Unknown position: {}", position);
        };
        request = request.with_position(position);
    }
    let spawn = app.coordinator()?.spawn(parent, request)?;
    println!("{} {} ({})", "Spawned:".green(), spawn.id, spawn.profile);
    if let Some(branch) = &spawn.branch {
        println!("  branch: {}", branch);
    }
    println!("Use `crewloop wait-for-spawns` to collect the result.");
    Ok(())
}

async fn handle_spawn_run(app: &App, spawn_id: &str) -> Result<()> {
    let cancel = ctrl_c_token();
    let status = app.driver().drive(spawn_id, cancel).await?;
    info!("Spawn {} finished as {}", spawn_id, status);
    Ok(())
}

fn print_spawn(spawn: &SpawnRecord) {
    println!(
        "{} {} [{}] {}",
        spawn.id,
        spawn.profile,
        colored_spawn_status(spawn.status),
        spawn.task
    );
    if let Some(summary) = &spawn.summary {
        println!("  result: {}", summary);
    }
    if let Some(question) = &spawn.question {
        println!("  {} {}", "question:".yellow(), question);
    }
}

async fn handle_wait_for_spawns(app: &App, timeout: Option<u64>, all: bool) -> Result<()> {
    let parent = app.require_turn()?;
    let cancel = ctrl_c_token();
    let coordinator = app.coordinator()?;
    let timeout = timeout.map(Duration::from_secs);
    let result = if all {
        coordinator.wait_all(parent, timeout, &cancel).await?
    } else {
        coordinator.wait_any(parent, timeout, &cancel).await?
    };

    if result.timed_out {
        println!("{}", "Timed out waiting for spawns".yellow());
    }
    for spawn in result.finished.iter().chain(result.awaiting.iter()) {
        print_spawn(spawn);
    }
    if result.is_empty() && !result.more_pending {
        println!("{}", "No spawns pending".dimmed());
    } else if result.more_pending {
        println!("{}", "More spawns still running".dimmed());
    }
    Ok(())
}

fn handle_spawn_status(app: &App, id: Option<&str>) -> Result<()> {
    let coordinator = app.coordinator()?;
    match id {
        Some(id) => print_spawn(&coordinator.get(id, app.turn())?),
        None => {
            let spawns = coordinator.status(app.require_turn()?)?;
            if spawns.is_empty() {
                println!("{}", "No spawns".dimmed());
            }
            for spawn in &spawns {
                print_spawn(spawn);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }
    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli).await.context("Command failed")?;

    Ok(())
}
