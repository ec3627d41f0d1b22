//! `workflow-suite` CLI entry-point.
//!
//! Available sub-commands:
//! - `start`:   run one service in the foreground.
//! - `up`:      run the whole suite (backend, webui, ui) in the foreground.
//! - `status`:  show the services a running invocation started.
//! - `stop`:    stop the services a running invocation started.
//! - `validate`: validate a workflow JSON file.

mod commands;
mod config;
mod state;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use config::SuiteConfig;

#[derive(Parser)]
#[command(
    name = "workflow-suite",
    about = "Launch and supervise the workflow automation suite",
    version
)]
struct Cli {
    #[command(flatten)]
    config: SuiteConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start one service and supervise it until interrupted.
    Start {
        /// backend, webui or ui.
        service: String,
    },
    /// Start every service in order and supervise them until interrupted.
    Up {
        /// Open the web UI in a browser once it is healthy.
        #[arg(long)]
        open_browser: bool,
    },
    /// Show state, pid, uptime and memory of running services.
    Status,
    /// Stop running services, newest first.
    Stop,
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Start { service } => commands::start(&cli.config, service).await,
        Command::Up { open_browser } => commands::up(&cli.config, *open_browser).await,
        Command::Status => commands::status(&cli.config).await,
        Command::Stop => commands::stop(&cli.config).await,
        Command::Validate { path } => commands::validate(path)
            .map(|valid| if valid { ExitCode::SUCCESS } else { ExitCode::FAILURE }),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}
