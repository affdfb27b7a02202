//! covend - Coven daemon.
//!
//! Main entry point for the daemon binary.

use std::path::PathBuf;

use clap::Parser;
use coven_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "covend", about = "Coven workflow daemon")]
struct Cli {
    /// Path to a covend config file (key=value format).
    #[arg(long, env = "COVEN_CONFIG")]
    config: Option<PathBuf>,

    /// Repository root to operate against. Defaults to the current directory.
    #[arg(long, env = "COVEN_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() {
    let cli = Cli::parse();

    fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let mut config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let workspace_root = cli.workspace.unwrap_or_else(|| std::env::current_dir().expect("cwd"));

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().expect("failed to create tokio runtime");

    runtime.block_on(async move {
        let daemon = match covend::Daemon::new(config, workspace_root).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        };

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, shutting down");
                signal_token.cancel();
            }
        });

        if let Err(e) = daemon.run(shutdown).await {
            error!("daemon error: {e}");
            std::process::exit(1);
        }
    });
}
