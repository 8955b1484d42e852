//! Reclaimer CLI
//!
//! A command-line tool for starting, watching and cancelling idle-memory
//! reclamation runs, and for evaluating a VM's idle ratio offline.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{evaluate, runs};

/// Idle-memory reclaimer CLI
#[derive(Parser)]
#[command(name = "reclaimctl")]
#[command(author, version, about = "CLI for the idle-memory reclaimer", long_about = None)]
pub struct Cli {
    /// Agent API URL (defaults to the config file value, then http://localhost:8080)
    #[arg(long, env = "RECLAIMER_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show agent health and the current run
    Status,

    /// Start a reclamation run
    Run {
        /// Wait for the run to finish and print its report
        #[arg(long)]
        wait: bool,
    },

    /// Cancel the active run
    Cancel,

    /// Show the report of the last finished run
    Report,

    /// Evaluate one VM's idle ratio without contacting the agent
    Evaluate {
        /// Configured memory in MB
        #[arg(long)]
        configured: i64,

        /// Host-reported memory usage in MB
        #[arg(long)]
        host: i64,

        /// Guest-reported memory usage in MB
        #[arg(long)]
        guest: i64,

        /// Treat the VM as powered off
        #[arg(long)]
        powered_off: bool,

        /// Idle ratio above which the VM is an outlier
        #[arg(long, default_value_t = reclaim_lib::thresholds::DEFAULT_IDLE_THRESHOLD)]
        threshold: f64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let format = config.format(cli.format)?;
    let api_url = config.api_url(cli.api_url);
    let connect = || client::ApiClient::new(&api_url);

    match cli.command {
        Commands::Status => runs::show_status(&connect()?, format).await,
        Commands::Run { wait } => runs::start_run(&connect()?, wait, format).await,
        Commands::Cancel => runs::cancel_run(&connect()?, format).await,
        Commands::Report => runs::show_report(&connect()?, format).await,
        Commands::Evaluate {
            configured,
            host,
            guest,
            powered_off,
            threshold,
        } => {
            let args = evaluate::EvaluateArgs {
                configured_mb: configured,
                host_mb: host,
                guest_mb: guest,
                powered_off,
                idle_threshold: threshold,
            };
            evaluate::evaluate_vm(&args, format)
        }
    }
}
