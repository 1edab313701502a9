//! Workbench Daemon - disposable and persistent Linux workspaces on Docker
//!
//! The daemon provisions labelled workspace containers, runs commands in
//! them with streamed output, and serves bounded file operations against
//! each container's `/workspace` directory.

use anyhow::Result;
use clap::Parser;
use tracing::error;

use workbench_daemon::config::Configuration;

mod cmd;

#[derive(Parser)]
#[command(name = "workbenchd")]
#[command(about = "Docker workspace orchestration daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Configuration::from_env();

    init_logging(&config, cli.debug);

    tracing::info!("Starting Workbench Daemon v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run().await?;
        }
        None => {
            if let Err(e) = cmd::root::run(config).await {
                error!("Daemon error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Configuration, debug: bool) {
    let level = if debug { "debug" } else { config.log_level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("workbench_daemon={level},workbenchd={level}").into());

    if config.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
