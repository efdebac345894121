//! bridgemux agent binary. Connects to the configured servers, mirrors their
//! bridges, and serves tunnels with locally leased addresses.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bridge_agent::{Config, Daemon};
use bridge_metrics::LogMetrics;
use bridge_netalloc::{NetworkAllocator, PlatformShell, DEFAULT_DNS_PORT};

#[derive(Parser, Debug)]
#[command(name = "bridge-agent")]
#[command(about = "bridgemux agent - bridges cluster services onto this workstation")]
#[command(version)]
struct Args {
    /// Configuration file (YAML); CONFIG env or the platform default
    /// otherwise.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    /// file.
    #[arg(long)]
    log_level: Option<String>,

    /// UDP port for the local DNS responder.
    #[arg(long, default_value_t = DEFAULT_DNS_PORT)]
    dns_port: u16,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("error loading configuration")?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    let token = CancellationToken::new();

    let allocator = Arc::new(
        NetworkAllocator::new(&config.iface, &config.network, Arc::new(PlatformShell))
            .context("error building network allocator")?,
    );
    allocator.spawn_dns(args.dns_port, token.child_token());

    let daemon = Daemon::new(
        config.clone(),
        allocator,
        Arc::new(LogMetrics),
        token.clone(),
    );

    for endpoint in &config.endpoints {
        if endpoint.endpoint.is_empty() {
            tracing::warn!(
                endpoint = %endpoint.name,
                "skipping port-forward endpoint, start it through the external forwarder"
            );
            continue;
        }

        match daemon.connect(&endpoint.name).await {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(endpoint = %endpoint.name, err = %err, "error connecting endpoint")
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("error waiting for shutdown signal")?;

    tracing::info!("shutting down");
    daemon.shutdown().await;

    Ok(())
}
