//! Command-line interface for warden.
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line interface for warden.
#[derive(Parser)]
#[command(name = "warden", version, author)]
#[command(about = "A lightweight service supervisor daemon", long_about = None)]
pub struct Cli {
    /// Override the warden directory (state, layers and socket).
    #[arg(long, value_name = "DIR", global = true)]
    pub dir: Option<PathBuf>,

    /// Opt into privileged system mode paths (/var/lib/warden).
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands understood by the CLI.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor daemon in the foreground.
    Run,

    /// List services and their current states.
    Services {
        /// Restrict to these service names.
        names: Vec<String>,
    },

    /// Start services and their required dependencies.
    Start {
        /// Services to start.
        #[arg(required = true)]
        names: Vec<String>,
        /// Wait for the resulting change to settle.
        #[arg(long)]
        wait: bool,
    },

    /// Stop services.
    Stop {
        /// Services to stop.
        #[arg(required = true)]
        names: Vec<String>,
        /// Wait for the resulting change to settle.
        #[arg(long)]
        wait: bool,
    },

    /// Stop then start services.
    Restart {
        /// Services to restart.
        #[arg(required = true)]
        names: Vec<String>,
        /// Wait for the resulting change to settle.
        #[arg(long)]
        wait: bool,
    },

    /// Start every `startup: enabled` service.
    Autostart {
        /// Wait for the resulting change to settle.
        #[arg(long)]
        wait: bool,
    },

    /// Apply plan changes: stop what changed, start what should run.
    Replan {
        /// Wait for the resulting change to settle.
        #[arg(long)]
        wait: bool,
    },

    /// Print the flattened plan as YAML.
    Plan,

    /// Add a configuration layer from a YAML file.
    AddLayer {
        /// Unique layer label.
        label: String,
        /// Path of the YAML layer file.
        file: PathBuf,
        /// Merge into an existing layer with this label instead of failing.
        #[arg(long)]
        combine: bool,
    },

    /// List health checks.
    Checks {
        /// Restrict to this level (alive or ready).
        #[arg(long)]
        level: Option<String>,
        /// Restrict to these check names.
        names: Vec<String>,
    },

    /// Report aggregate health.
    Health {
        /// Restrict to this level (alive or ready).
        #[arg(long)]
        level: Option<String>,
        /// Restrict to these check names.
        names: Vec<String>,
    },

    /// Fetch or follow service logs.
    Logs {
        /// Services to read; all when omitted.
        services: Vec<String>,
        /// Number of trailing entries to fetch.
        #[arg(short = 'n', long)]
        n: Option<i32>,
        /// Keep streaming new entries.
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Send a signal to running services.
    Signal {
        /// Signal name, e.g. SIGHUP.
        signal: String,
        /// Target services.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// List warnings.
    Warnings {
        /// Show every warning, not only pending ones.
        #[arg(long)]
        all: bool,
    },

    /// Acknowledge all current warnings.
    Okay,

    /// List changes with their status.
    Changes,

    /// Show one change with its task logs.
    Tasks {
        /// Change id.
        id: String,
    },

    /// Abort an in-flight change.
    Abort {
        /// Change id.
        id: String,
    },

    /// Wait for a change to settle.
    Wait {
        /// Change id.
        id: String,
        /// Bounded wait, e.g. "30s".
        #[arg(long)]
        timeout: Option<String>,
    },

    /// Ask the daemon to shut down.
    Shutdown {
        /// Exit with the restart sentinel so a wrapper restarts the daemon.
        #[arg(long)]
        restart: bool,
    },
}

/// Parses process arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
