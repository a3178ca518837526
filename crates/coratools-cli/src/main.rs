//! cora - LoggerNet data collection from the command line

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use coratools_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?
        .with_overrides(cli.server.clone(), cli.logon.clone(), cli.password.clone());

    if let Err(e) = CommandDispatcher::execute(cli, config).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    debug!("cora exited successfully");
    Ok(())
}

/// Log to standard error; `RUST_LOG` overrides the verbosity flag
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
