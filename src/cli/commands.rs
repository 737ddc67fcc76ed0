//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - sweep / daemon: scheduling passes
//! - runner: poll and execute pending runs
//! - serve: HTTP control surface
//! - source / run: operator actions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// runsched - run scheduler and lifecycle controller for scrape jobs
#[derive(Parser, Debug)]
#[command(name = "runsched")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one sweep over active sources
    Sweep {
        /// Ignore the interval and start backfill runs
        #[arg(long)]
        backfill: bool,

        /// Ignore the interval and capacity checks
        #[arg(short, long)]
        force: bool,
    },

    /// Sweep on the configured interval until interrupted
    Daemon,

    /// Claim and execute pending runs until interrupted
    Runner,

    /// Serve the HTTP control surface
    Serve {
        /// Override the configured bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Also run the sweep daemon in this process
        #[arg(long)]
        with_daemon: bool,
    },

    /// Source management
    Source {
        #[command(subcommand)]
        command: SourceCommands,
    },

    /// Run inspection and reconciliation
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
}

/// Source subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SourceCommands {
    /// Add a source from a target URL
    Add {
        url: String,

        /// Base interval override in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Always use the base interval
        #[arg(long)]
        disable_backoff: bool,
    },

    /// List sources with their latest run
    List,

    /// Show a source and its recent runs
    Show { id: i64 },

    Pause { id: i64 },

    Resume { id: i64 },

    /// Stop a source and its active run
    Stop { id: i64 },

    /// Start a run now
    Run {
        id: i64,

        /// Ignore the interval and capacity checks
        #[arg(short, long)]
        force: bool,

        /// Item ceiling, 0 = unbounded
        #[arg(short, long)]
        max_items: Option<u64>,
    },

    /// Edit url, ceiling or schedule
    Edit {
        id: i64,

        #[arg(long)]
        url: Option<String>,

        #[arg(short, long)]
        max_items: Option<u64>,

        #[arg(short, long, conflicts_with = "clear_interval")]
        interval: Option<u64>,

        /// Drop the interval override
        #[arg(long)]
        clear_interval: bool,

        #[arg(long)]
        disable_backoff: Option<bool>,
    },

    /// Delete a source with its runs
    Delete {
        id: i64,

        /// Delete its output records too
        #[arg(long)]
        delete_outputs: bool,
    },
}

/// Run subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum RunCommands {
    /// Close a run from its output records
    Reconcile {
        id: i64,

        /// Close a run that is not stale
        #[arg(short, long)]
        force: bool,
    },

    /// Show the newest job log entries of a run
    Logs {
        id: i64,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// List runs waiting for an external executor
    Pending {
        #[arg(short, long)]
        limit: Option<usize>,
    },
}
