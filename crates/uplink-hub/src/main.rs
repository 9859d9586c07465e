//! Hub server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use uplink_hub::{Hub, HubConfig, TlsSettings};

/// Reverse-tunnel RPC hub.
#[derive(Parser, Debug)]
#[command(name = "uplink-hub")]
#[command(about = "Accept agent uplinks and proxy RPC calls to them by name")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "HUB_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the hub.
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// HTTP listener address (agent uplinks and health checks)
    #[arg(long = "http-listen", env = "HUB_HTTP_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    http_listen: SocketAddr,

    /// RPC listener address (client-facing calls)
    #[arg(long = "rpc-listen", env = "HUB_RPC_LISTEN_ADDR", default_value = "0.0.0.0:9090")]
    rpc_listen: SocketAddr,

    /// TLS certificate file (PEM); enables TLS together with --tls-key-file
    #[arg(long = "tls-cert-file", env = "HUB_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long = "tls-key-file", env = "HUB_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// Graceful shutdown deadline in seconds
    #[arg(long, env = "HUB_SHUTDOWN_TIMEOUT_SECS", default_value = "30")]
    shutdown_timeout: u64,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let tls = match (args.tls_cert_file, args.tls_key_file) {
        (Some(cert_path), Some(key_path)) => Some(TlsSettings {
            cert_path,
            key_path,
        }),
        (None, None) => None,
        _ => bail!("--tls-cert-file and --tls-key-file must be provided together"),
    };

    let config = HubConfig {
        http_listen_addr: args.http_listen,
        rpc_listen_addr: args.rpc_listen,
        tls,
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
    };

    let hub = Hub::start(config).await.context("failed to start hub")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("interrupt received");
    hub.close().await;
    Ok(())
}
