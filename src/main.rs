//! Scenario harness CLI
//!
//! Runs scripted scenarios against a command-line executable, directly or
//! through the job orchestrator.

use clap::Parser;
use commands::Commands;
use harness::common::{logging, paths};
use harness::{cli, commands};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "harness", about = "Scenario runner and job orchestrator")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match cli.command {
        Commands::Schedule => match paths::log_dir() {
            Some(dir) => logging::init_service(&dir),
            None => {
                logging::init_cli();
                None
            }
        },
        _ => {
            logging::init_cli();
            None
        }
    };

    match cli::dispatch(cli.command, cli.config.as_deref()).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}
