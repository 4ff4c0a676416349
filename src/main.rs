//! Split Keeper Server
//!
//! Serves split documents from a directory tree until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use split_keeper::{ServerConfig, SplitServer, DEFAULT_PORT, VERSION};

#[derive(Parser, Debug)]
#[command(name = "split-keeper")]
#[command(version, about = "Records speedrun splits and tracks the best run per category")]
struct Cli {
    /// Address accepted by the server (empty accepts any address).
    #[arg(long, default_value = "", env = "SPLITS_URL")]
    url: String,

    /// Port listening for split requests.
    #[arg(long, default_value_t = DEFAULT_PORT, env = "SPLITS_PORT")]
    port: u16,

    /// Directory holding the category directories.
    #[arg(long, default_value = ".", env = "SPLITS_ROOT")]
    root: PathBuf,

    /// Maximum number of connections served at once.
    #[arg(long, default_value_t = 1024)]
    max_connections: usize,

    /// Seconds a client has to send its request.
    #[arg(long, default_value_t = 30)]
    read_timeout_secs: u64,
}

async fn resolve_bind_addr(url: &str, port: u16) -> Result<SocketAddr> {
    if url.is_empty() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    tokio::net::lookup_host((url, port))
        .await
        .with_context(|| format!("Failed to resolve {}:{}", url, port))?
        .next()
        .with_context(|| format!("No address found for {}:{}", url, port))
}

fn init_logging() -> Result<()> {
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    info!("Split Keeper v{}", VERSION);

    if !cli.root.is_dir() {
        anyhow::bail!("Serving root {} is not a directory", cli.root.display());
    }

    let config = ServerConfig {
        bind_addr: resolve_bind_addr(&cli.url, cli.port).await?,
        root: cli.root,
        max_connections: cli.max_connections,
        read_timeout: Duration::from_secs(cli.read_timeout_secs),
        ..Default::default()
    };

    let server = Arc::new(SplitServer::new(config));

    // Ctrl+C stops accepting; in-flight requests finish.
    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });

    let bind_addr = server.config().bind_addr;
    server
        .run()
        .await
        .with_context(|| format!("Failed to start listening on {}", bind_addr))
}
