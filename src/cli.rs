//! Command-line interface for the stigmer CLI.
use clap::{ArgAction, Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

use crate::config::{BackendType, ExecutionMode};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for stigmer.
#[derive(Parser)]
#[command(name = "stigmer", version, author)]
#[command(about = "Local control plane for the Stigmer workflow/agent runtime", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Manage the local server fleet (daemon, workflow runner, agent runner).
    Server {
        /// Server operation; defaults to `start`.
        #[command(subcommand)]
        action: Option<ServerAction>,
    },

    /// Deploy the current project's agents, workflows and skills.
    Apply {
        /// Project directory containing Stigmer.yaml.
        #[arg(long, default_value = ".")]
        config: String,

        /// Report what would change without contacting the backend.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a workflow or agent by reference.
    ///
    /// The reference may be a slug or a server-issued id, and resolves to a
    /// workflow first; an agent with the same slug is only used when no
    /// workflow matches. Inside a project directory, `apply` runs first.
    Run {
        /// Slug or id of the workflow or agent to run. Defaults to the
        /// project's name when inside a project directory.
        reference: Option<String>,

        /// Input message passed to the execution.
        #[arg(long)]
        message: Option<String>,

        /// Follow the execution and print its messages until it finishes.
        #[arg(long, value_name = "BOOL", default_value_t = true, action = ArgAction::Set)]
        follow: bool,
    },

    /// View merged service logs.
    Logs {
        /// Include every component.
        #[arg(long)]
        all: bool,

        /// Component to include (repeatable): daemon, workflow-runner,
        /// agent-runner.
        #[arg(long)]
        component: Vec<String>,

        /// Also include each component's stderr file.
        #[arg(long)]
        stderr: bool,

        /// Number of trailing lines per source.
        #[arg(long, default_value = "50")]
        tail: usize,

        /// Keep following new lines until interrupted.
        #[arg(long, value_name = "BOOL", default_value_t = false, action = ArgAction::Set)]
        follow: bool,
    },

    /// Read or write configuration.
    Config {
        /// Config operation.
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Scaffold a new project directory.
    New {
        /// Project name; also the directory created.
        name: String,
    },

    /// Switch the backend the CLI talks to.
    Backend {
        /// Backend operation.
        #[command(subcommand)]
        action: BackendAction,
    },
}

/// Server subcommands.
#[derive(Subcommand)]
pub enum ServerAction {
    /// Start the daemon and its managed services.
    Start {
        /// Agent execution mode.
        #[arg(long, value_name = "MODE")]
        execution_mode: Option<ExecutionMode>,

        /// Sandbox container image.
        #[arg(long, value_name = "IMAGE")]
        sandbox_image: Option<String>,

        /// Pull the sandbox image automatically when absent.
        #[arg(long, value_name = "BOOL")]
        sandbox_auto_pull: Option<bool>,

        /// Remove the sandbox container on stop.
        #[arg(long, value_name = "BOOL")]
        sandbox_cleanup: Option<bool>,

        /// Sandbox container time-to-live in seconds.
        #[arg(long, value_name = "SECONDS")]
        sandbox_ttl: Option<u64>,
    },

    /// Stop all managed services.
    Stop,

    /// Show the state of every managed service.
    Status,

    /// Stop then start all managed services.
    Restart {
        /// Agent execution mode.
        #[arg(long, value_name = "MODE")]
        execution_mode: Option<ExecutionMode>,

        /// Sandbox container image.
        #[arg(long, value_name = "IMAGE")]
        sandbox_image: Option<String>,

        /// Pull the sandbox image automatically when absent.
        #[arg(long, value_name = "BOOL")]
        sandbox_auto_pull: Option<bool>,

        /// Remove the sandbox container on stop.
        #[arg(long, value_name = "BOOL")]
        sandbox_cleanup: Option<bool>,

        /// Sandbox container time-to-live in seconds.
        #[arg(long, value_name = "SECONDS")]
        sandbox_ttl: Option<u64>,
    },

    /// Shorthand for `logs --all`.
    Logs {
        /// Number of trailing lines per source.
        #[arg(long, default_value = "50")]
        tail: usize,

        /// Keep following new lines until interrupted.
        #[arg(long, value_name = "BOOL", default_value_t = false, action = ArgAction::Set)]
        follow: bool,
    },
}

impl clap::ValueEnum for ExecutionMode {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            ExecutionMode::Local,
            ExecutionMode::Sandbox,
            ExecutionMode::Auto,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

impl clap::ValueEnum for BackendType {
    fn value_variants<'a>() -> &'a [Self] {
        &[BackendType::Local, BackendType::Cloud]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective value of a key.
    Get {
        /// Dotted key, e.g. `backend.local.execution.mode`.
        key: String,
    },

    /// Write a key to the config file.
    Set {
        /// Dotted key, e.g. `backend.local.execution.mode`.
        key: String,
        /// Value to store.
        value: String,
    },

    /// List every recognized key and its value.
    List,

    /// Print the path of the config file.
    Path,
}

/// Backend subcommands.
#[derive(Subcommand)]
pub enum BackendAction {
    /// Select the backend type.
    Set {
        /// Backend type.
        #[arg(value_enum)]
        backend: BackendType,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
