//! CLI command definitions
//!
//! Defines the clap commands for the harness CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run one scenario file against a target executable
    Run {
        /// Path to the YAML scenario
        scenario: PathBuf,

        /// Target executable (default: [engine] binary_path)
        #[arg(long, short)]
        binary: Option<PathBuf>,

        /// Per-step timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Output decoding label, e.g. utf-8 or cp949
        #[arg(long)]
        encoding: Option<String>,

        /// Show target output as it arrives
        #[arg(long, short)]
        verbose: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run every scenario of a directory in batch mode
    Batch {
        /// Directory holding *.yaml / *.yml scenarios
        dir: PathBuf,

        /// Target executable (default: [engine] binary_path)
        #[arg(long, short)]
        binary: Option<PathBuf>,

        /// Scenarios run at the same time
        #[arg(long, short)]
        concurrency: Option<usize>,

        /// Skip files matching this glob; repeatable
        #[arg(long = "exclude", short = 'x')]
        excludes: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a job from the jobs directory and wait for it
    Job {
        /// Job name (file stem of <jobs_dir>/<name>.json)
        name: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run configured schedules until interrupted
    Schedule,

    /// Show recent job runs
    History {
        /// Number of entries to show
        #[arg(long, short, default_value = "20")]
        limit: usize,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
}
