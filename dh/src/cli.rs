//! CLI command definitions and subcommands

use std::path::PathBuf;

use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use crate::schedule::{CronExpr, Cycle, ScheduleError, parse_datetime, parse_time, parse_timezone, parse_weekday};

/// Dockhand - container operations for chat bridges
#[derive(Parser)]
#[command(
    name = "dh",
    about = "Concurrency-safe container operations, status cache and scheduled actions",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the dispatcher, status cache and scheduler in the foreground
    Serve,

    /// Show a container's status
    Status {
        /// Container name
        name: String,

        /// Accept a stale cached status instead of waiting for the engine
        #[arg(long)]
        allow_stale: bool,
    },

    /// Start a container
    Start {
        name: String,

        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Stop a container
    Stop {
        name: String,

        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Restart a container
    Restart {
        name: String,

        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show a container's recent logs
    Logs {
        name: String,

        /// Number of lines to show
        #[arg(short, long)]
        tail: Option<usize>,
    },

    /// Manage scheduled tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
}

/// Scheduled task subcommands
#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// List scheduled tasks
    List {
        /// Filter (all, active, inactive, expired)
        #[arg(long, default_value = "all")]
        filter: String,
    },

    /// Schedule an action on a container
    Add {
        /// Container name
        container: String,

        /// Action to run (start, stop, restart, status)
        action: String,

        #[command(flatten)]
        cycle: CycleArgs,
    },

    /// Delete a task
    Rm {
        /// Task ID (or unique prefix)
        id: String,
    },

    /// Re-enable a task
    Enable {
        /// Task ID (or unique prefix)
        id: String,
    },

    /// Pause a task without deleting it
    Disable {
        /// Task ID (or unique prefix)
        id: String,
    },
}

/// Flags describing when a task fires
#[derive(Debug, Clone, Args)]
pub struct CycleArgs {
    /// Cycle kind (once, daily, weekly, monthly, yearly, cron)
    #[arg(long, default_value = "daily")]
    pub cycle: String,

    /// Local date and time for `once`, e.g. 2026-12-24T18:00
    #[arg(long)]
    pub at: Option<String>,

    /// Local time of day, e.g. 04:30
    #[arg(long)]
    pub time: Option<String>,

    /// Weekday for `weekly`
    #[arg(long)]
    pub weekday: Option<String>,

    /// Day of month for `monthly` and `yearly`
    #[arg(long)]
    pub day: Option<u32>,

    /// Month for `yearly`
    #[arg(long)]
    pub month: Option<u32>,

    /// Five-field cron expression for `cron`
    #[arg(long)]
    pub cron: Option<String>,

    /// IANA timezone the schedule is evaluated in
    #[arg(long, default_value = "UTC")]
    pub tz: String,
}

impl CycleArgs {
    /// Turn the flags into a cycle and its timezone
    pub fn build(&self) -> Result<(Cycle, Tz), ScheduleError> {
        debug!(cycle = %self.cycle, tz = %self.tz, "CycleArgs::build: called");
        let tz = parse_timezone(&self.tz)?;
        let kind = self.cycle.trim().to_lowercase();

        let cycle = match kind.as_str() {
            "once" => Cycle::Once {
                at: parse_datetime(require(&kind, "--at", self.at.as_deref())?)?,
            },
            "daily" => Cycle::Daily { time: self.time()? },
            "weekly" => Cycle::Weekly {
                weekday: parse_weekday(require(&kind, "--weekday", self.weekday.as_deref())?)?,
                time: self.time()?,
            },
            "monthly" => Cycle::Monthly {
                day: require(&kind, "--day", self.day)?,
                time: self.time()?,
            },
            "yearly" => Cycle::Yearly {
                month: require(&kind, "--month", self.month)?,
                day: require(&kind, "--day", self.day)?,
                time: self.time()?,
            },
            "cron" => Cycle::Cron {
                expression: CronExpr::parse(require(&kind, "--cron", self.cron.as_deref())?)?,
            },
            _ => {
                debug!(%kind, "CycleArgs::build: unknown cycle");
                return Err(ScheduleError::UnknownCycle(self.cycle.clone()));
            }
        };

        cycle.validate()?;
        Ok((cycle, tz))
    }

    fn time(&self) -> Result<chrono::NaiveTime, ScheduleError> {
        parse_time(require(&self.cycle, "--time", self.time.as_deref())?)
    }
}

fn require<T>(cycle: &str, field: &'static str, value: Option<T>) -> Result<T, ScheduleError> {
    value.ok_or_else(|| ScheduleError::MissingField {
        cycle: cycle.to_string(),
        field,
    })
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockhand")
        .join("logs")
        .join("dockhand.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for command results
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => {
                debug!("OutputFormat::from_str: matched Text");
                Ok(Self::Text)
            }
            "json" => {
                debug!("OutputFormat::from_str: matched Json");
                Ok(Self::Json)
            }
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
