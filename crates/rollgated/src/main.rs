//! rollgated — the Rollgate daemon.
//!
//! Hosts the orchestration API and one control loop per active deployment.
//!
//! # Usage
//!
//! ```text
//! rollgated serve --config /etc/rollgate/rollgate.toml --port 8470
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rollgate_core::RollgateConfig;

#[derive(Parser)]
#[command(name = "rollgated", about = "Rollgate progressive delivery daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API and drive active deployments.
    Serve {
        /// Path to rollgate.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Control-loop tick interval, e.g. "15s" (overrides the config file).
        #[arg(long)]
        tick_interval: Option<String>,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rollgate=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            tick_interval,
        } => {
            let mut cfg = match &config {
                Some(path) => RollgateConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => RollgateConfig::default(),
            };
            if let Some(port) = port {
                cfg.daemon.port = port;
            }
            if let Some(dir) = data_dir {
                cfg.daemon.data_dir = dir;
            }
            if let Some(interval) = tick_interval {
                cfg.controller.tick_interval = interval;
            }
            cfg.validate()?;
            rollgated::serve(cfg).await
        }
        Command::DefaultConfig => {
            print!("{}", RollgateConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}
