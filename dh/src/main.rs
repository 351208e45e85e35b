//! Dockhand - container operations for chat bridges
//!
//! CLI entry point: runs the service or performs one-off operations.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use dockhand::cli::{Cli, Command, CycleArgs, OutputFormat, TaskCommand, get_log_path};
use dockhand::config::Config;
use dockhand::dispatcher::{Action, OperationResult};
use dockhand::engine::DockerConnector;
use dockhand::runtime::Runtime;
use dockhand::schedule::{LogNotifier, NewTask, ScheduledTask, TaskFilter, TaskStore};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Can't log here since logging isn't initialized yet
    let log_dir = get_log_path()
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(get_log_path()).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(containers = config.containers.len(), "Dockhand loaded config");

    let format = cli.format;
    debug!(command = ?cli.command, %format, "main: dispatching command");
    match cli.command {
        Command::Serve => {
            debug!("main: matched Serve command");
            cmd_serve(config).await
        }
        Command::Status { name, allow_stale } => {
            debug!(%name, allow_stale, "main: matched Status command");
            cmd_status(config, &name, allow_stale, format).await
        }
        Command::Start { name, timeout_ms } => {
            debug!(%name, ?timeout_ms, "main: matched Start command");
            cmd_action(config, &name, Action::Start, timeout_ms, format).await
        }
        Command::Stop { name, timeout_ms } => {
            debug!(%name, ?timeout_ms, "main: matched Stop command");
            cmd_action(config, &name, Action::Stop, timeout_ms, format).await
        }
        Command::Restart { name, timeout_ms } => {
            debug!(%name, ?timeout_ms, "main: matched Restart command");
            cmd_action(config, &name, Action::Restart, timeout_ms, format).await
        }
        Command::Logs { name, tail } => {
            debug!(%name, ?tail, "main: matched Logs command");
            cmd_logs(config, &name, tail, format).await
        }
        Command::Task { command } => {
            debug!(?command, "main: matched Task command");
            cmd_task(config, command, format).await
        }
    }
}

/// Build a runtime against the configured Docker engine
async fn build_runtime(config: Config) -> Result<Runtime> {
    debug!("build_runtime: called");
    let connector = Arc::new(DockerConnector::new(config.engine.socket.clone()));
    let tasks = TaskStore::open(config.scheduler.tasks_path())
        .await
        .context("Failed to open task store")?;
    Runtime::new(config, connector, tasks, Arc::new(LogNotifier))
}

/// Run the service until Ctrl-C
async fn cmd_serve(config: Config) -> Result<()> {
    debug!("cmd_serve: called");
    let runtime = build_runtime(config).await?;
    runtime.start_background();

    let cfg = runtime.config();
    println!(
        "{} Dockhand serving {} containers, {} scheduled tasks",
        "✓".green(),
        cfg.containers.len().to_string().cyan(),
        runtime.tasks().len().await.to_string().cyan()
    );
    println!("Logs are written to: {}", get_log_path().display());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    println!("Shutting down...");
    runtime.shutdown().await;
    Ok(())
}

async fn cmd_status(config: Config, name: &str, allow_stale: bool, format: OutputFormat) -> Result<()> {
    debug!(%name, allow_stale, "cmd_status: called");
    let runtime = build_runtime(config).await?;
    let result = runtime.get_status(name, allow_stale).await;
    runtime.shutdown().await;
    let entry = result?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        OutputFormat::Text => {
            let state = entry.status.state.to_string();
            let state = if entry.status.state.is_running() {
                state.green()
            } else {
                state.yellow()
            };
            let age = entry.age(Utc::now());
            println!("{} {}", entry.container.cyan(), state);
            if let Some(health) = &entry.status.health {
                println!("  health:   {}", health);
            }
            if let Some(image) = &entry.status.image {
                println!("  image:    {}", image);
            }
            println!(
                "  captured: {}s ago{}",
                age.as_secs(),
                if entry.stale { " (stale)".red().to_string() } else { String::new() }
            );
        }
    }
    Ok(())
}

async fn cmd_action(
    config: Config,
    name: &str,
    action: Action,
    timeout_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    debug!(%name, %action, ?timeout_ms, "cmd_action: called");
    let runtime = build_runtime(config).await?;
    let result = runtime
        .submit_operation(name, action, timeout_ms.map(Duration::from_millis))
        .await;
    runtime.shutdown().await;
    let result = result?;
    print_result(&result, format)
}

async fn cmd_logs(config: Config, name: &str, tail: Option<usize>, format: OutputFormat) -> Result<()> {
    debug!(%name, ?tail, "cmd_logs: called");
    let runtime = build_runtime(config).await?;
    let result = runtime.logs(name, tail, None).await;
    runtime.shutdown().await;
    let logs = result?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&json!({ "container": name, "logs": logs }))?),
        OutputFormat::Text => print!("{}", logs),
    }
    Ok(())
}

fn print_result(result: &OperationResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let value = json!({
                "request_id": result.request_id,
                "container": result.container,
                "action": result.action,
                "success": result.success,
                "state": result.state,
                "status": result.status,
                "message": result.message,
                "duration_ms": result.duration.as_millis() as u64,
                "attempts": result.attempts,
                "error_kind": result.error_kind(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            let icon = if result.success { "✓".green() } else { "✗".red() };
            println!(
                "{} {} {} ({} ms): {}",
                icon,
                result.action,
                result.container.cyan(),
                result.duration.as_millis(),
                result.message
            );
        }
    }
    Ok(())
}

/// Task commands work on the task file only and never contact the engine
async fn cmd_task(config: Config, command: TaskCommand, format: OutputFormat) -> Result<()> {
    debug!(?command, "cmd_task: called");
    let store = TaskStore::open(config.scheduler.tasks_path())
        .await
        .context("Failed to open task store")?;
    let now = Utc::now();

    match command {
        TaskCommand::List { filter } => {
            debug!(%filter, "cmd_task: matched TaskCommand::List");
            let filter: TaskFilter = filter.parse().map_err(|e: String| eyre::eyre!(e))?;
            let tasks = store.list_tasks(filter, now).await;
            print_tasks(&tasks, format)
        }
        TaskCommand::Add {
            container,
            action,
            cycle,
        } => {
            debug!(%container, %action, "cmd_task: matched TaskCommand::Add");
            let task = add_task(&store, &config, &container, &action, &cycle).await?;
            print_task_change("Scheduled", &task, format)
        }
        TaskCommand::Rm { id } => {
            debug!(%id, "cmd_task: matched TaskCommand::Rm");
            let task = store.delete_task(&id).await?;
            print_task_change("Deleted", &task, format)
        }
        TaskCommand::Enable { id } => {
            debug!(%id, "cmd_task: matched TaskCommand::Enable");
            let task = store.set_task_active(&id, true, now).await?;
            print_task_change("Enabled", &task, format)
        }
        TaskCommand::Disable { id } => {
            debug!(%id, "cmd_task: matched TaskCommand::Disable");
            let task = store.set_task_active(&id, false, now).await?;
            print_task_change("Disabled", &task, format)
        }
    }
}

async fn add_task(store: &TaskStore, config: &Config, container: &str, action: &str, cycle: &CycleArgs) -> Result<ScheduledTask> {
    debug!(%container, %action, "add_task: called");
    let action: Action = action.parse()?;
    let (cycle, timezone) = cycle.build()?;
    let task = store
        .create_task(
            NewTask {
                container: container.to_string(),
                action,
                cycle,
                timezone,
            },
            config,
            Utc::now(),
        )
        .await?;
    Ok(task)
}

fn print_tasks(tasks: &[ScheduledTask], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(tasks)?),
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No scheduled tasks");
                return Ok(());
            }
            for task in tasks {
                let marker = if task.is_active { "●".green() } else { "○".dimmed() };
                let next = task
                    .next_run_at
                    .map(|t| t.with_timezone(&task.timezone).format("%Y-%m-%d %H:%M %Z").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {}  {:<8} {:<12} {:<30} next: {}",
                    marker,
                    task.short_id().cyan(),
                    task.action.to_string(),
                    task.container,
                    task.cycle.to_string(),
                    next
                );
            }
        }
    }
    Ok(())
}

fn print_task_change(verb: &str, task: &ScheduledTask, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(task)?),
        OutputFormat::Text => println!(
            "{} {} task {} ({} {} {}, {})",
            "✓".green(),
            verb,
            task.id.cyan(),
            task.action,
            task.container,
            task.cycle,
            task.timezone
        ),
    }
    Ok(())
}
