//! Edge agent binary.
//!
//! Configuration is read from the environment (see [`edge_agent::config`]).
//! Exit codes: 0 on clean shutdown, 2 on bad configuration, 3 when the
//! collector keeps rejecting the edge token, 4 when `--once` cannot reach the
//! collector, 1 for anything else.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use edge_agent::agent;
use edge_agent::config::AgentConfig;
use edge_agent::error::AgentError;
use edge_agent::shutdown::install_signal_handler;

/// Edge agent: person detections in, store events out.
#[derive(Parser, Debug)]
#[command(name = "edge-agent", version, about, long_about = None)]
struct Cli {
    /// Send a single heartbeat and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "edge_agent=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let err = AgentError::from(e);
            error!(error = %err, "Refusing to start");
            return ExitCode::from(&err);
        }
    };

    if cli.once {
        return match agent::run_once(&config).await {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => ExitCode::from(&e),
        };
    }

    let cancel = install_signal_handler();
    match agent::run(config, cancel).await {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Edge agent failed");
            ExitCode::from(&e)
        }
    }
}
