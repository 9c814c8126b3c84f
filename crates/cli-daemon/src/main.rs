//! CLI entry point for the sizecap daemon
//!
//! Parses command line arguments, sets up logging and starts the daemon.

use clap::Parser;
use sizecap::Daemon;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// sizecap - compress videos to a target file size
#[derive(Parser, Debug)]
#[command(name = "sizecap-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it is missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip the ffmpeg/ffprobe startup checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "sizecap daemon starting");

    let daemon = match Daemon::new(&args.config, args.skip_checks).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        hardware = %daemon.hardware.snapshot().hw_type,
        slots = daemon.concurrency_plan.max_concurrent_jobs,
        host = %daemon.config.server.host,
        port = daemon.config.server.port,
        "Daemon initialized"
    );

    if let Err(e) = daemon.run().await {
        error!(error = %e, "Daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
