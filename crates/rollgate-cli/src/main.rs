//! rollgate — operator CLI for the Rollgate daemon.
//!
//! Exit codes: 0 success, 1 invalid arguments or other errors, 2 the group
//! already has an active deployment, 3 the deployment had already finished.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::ApiClient;
use commands::Exit;
use commands::deploy::StrategyArgs;

#[derive(Parser)]
#[command(
    name = "rollgate",
    about = "Rollgate — progressive delivery controller",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Daemon URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:8470")]
    server: String,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Roll out a version onto a target group.
    Deploy {
        group: String,
        #[arg(id = "target_version", value_name = "VERSION")]
        version: String,
        /// rolling, blue-green or canary
        #[arg(long, default_value = "rolling")]
        strategy: String,
        /// rollgate.toml whose strategy defaults to start from
        #[arg(long)]
        config: Option<PathBuf>,
        /// Instances per rolling batch
        #[arg(long)]
        batch_size: Option<u32>,
        /// Percentage of the group per rolling batch
        #[arg(long)]
        batch_percent: Option<u8>,
        /// Canary traffic steps, e.g. 5,25,50,100
        #[arg(long, value_delimiter = ',')]
        steps: Option<Vec<u8>>,
        /// Inconclusive verdicts tolerated per step
        #[arg(long)]
        max_inconclusive_ticks: Option<u32>,
    },
    /// Pause a deployment between ticks.
    Pause { id: String },
    /// Resume a paused deployment.
    Resume { id: String },
    /// Roll a deployment back to its previous version.
    Abort { id: String },
    /// Show a deployment, or every deployment when no id is given.
    Status { id: Option<String> },
}

async fn run(cli: Cli) -> anyhow::Result<Exit> {
    let client = ApiClient::new(&cli.server)?;
    let format = cli.format.as_str();

    match cli.command {
        Commands::Deploy {
            group,
            version,
            strategy,
            config,
            batch_size,
            batch_percent,
            steps,
            max_inconclusive_ticks,
        } => {
            let args = StrategyArgs {
                strategy,
                batch_size,
                batch_percent,
                steps,
                max_inconclusive_ticks,
            };
            commands::deploy::run(&client, &group, &version, &args, config.as_deref(), format).await
        }
        Commands::Pause { id } => commands::control::run(&client, "pause", &id, format).await,
        Commands::Resume { id } => commands::control::run(&client, "resume", &id, format).await,
        Commands::Abort { id } => commands::control::run(&client, "abort", &id, format).await,
        Commands::Status { id } => commands::status::run(&client, id.as_deref(), format).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                Exit::Failure.into()
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rollgate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("error: {e:#}");
            Exit::Failure.into()
        }
    }
}
