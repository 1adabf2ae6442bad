mod bootstrap;
mod config;
mod events;
mod server;
mod service;
mod stdio;
mod vm;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::bootstrap::StartOpts;
use crate::config::Config;
use crate::events::EventPublisher;
use crate::service::TaskService;

#[derive(Parser)]
#[command(name = "vmshim", about = "microVM shim runtime for container tasks")]
struct Cli {
    /// Daemon namespace this shim belongs to.
    #[arg(long)]
    namespace: Option<String>,

    /// Host daemon API address, used when publishing events.
    #[arg(long)]
    address: Option<String>,

    /// Binary invoked to publish events back to the daemon.
    #[arg(long)]
    publish_binary: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Path to config file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fork a serve-mode shim for a task and print its socket address.
    Start {
        /// Task id the new shim will serve.
        id: String,
    },
    /// Report cleanup for a dead shim; prints a synthetic delete response.
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let debug = cli.debug || config.debug;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" })),
        )
        .init();

    match cli.command {
        Some(Commands::Start { id }) => {
            let opts = StartOpts {
                id,
                namespace: cli.namespace.unwrap_or_else(|| "default".into()),
                address: cli.address.unwrap_or_default(),
                publish_binary: cli
                    .publish_binary
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                debug,
            };
            let address = bootstrap::start_shim(&opts)?;
            println!("{}", address);
        }

        Some(Commands::Cleanup) => {
            let resp = service::cleanup_response();
            println!("{}", serde_json::to_string(&resp)?);
        }

        None => {
            let publisher = match (cli.publish_binary, cli.address) {
                (Some(binary), Some(address)) => EventPublisher::Binary {
                    binary,
                    address,
                    namespace: cli.namespace.clone().unwrap_or_else(|| "default".into()),
                },
                _ => EventPublisher::Null,
            };

            let (service, mut shutdown_rx) = TaskService::new(config, publisher);

            let listener = bootstrap::inherited_listener()
                .context("no listening socket on fd 3; launch via the start subcommand")?;
            listener
                .set_nonblocking(true)
                .context("setting listener non-blocking")?;
            let listener = tokio::net::UnixListener::from_std(listener)
                .context("registering listener with tokio")?;

            tracing::info!("vmshim serving task requests");

            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .context("registering SIGTERM handler")?;
            tokio::select! {
                result = server::serve(listener, service.clone()) => {
                    result?;
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested by task service");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, exiting");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, exiting");
                }
            }

            // Exit explicitly so no stray shim process lingers.
            tracing::info!("vmshim exiting");
            std::process::exit(0);
        }
    }

    Ok(())
}
