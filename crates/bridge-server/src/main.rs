//! bridgemux server binary. Runs inside the cluster, watches services and
//! serves agent connections.
//!
//! Environment: `ADDR` (listen address, default `:50000`), `LOGLEVEL`,
//! `LOGSRC` (log source locations), `PROBE_ADDR` (default `:8083`),
//! `METRICS_ADDR` (default `:8081`), `KUBECONFIG`/`NAMESPACE` overrides for
//! development outside the cluster.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bridge_kube::{Opts, Runtime};
use bridge_metrics::PromMetrics;
use bridge_server::probe::Probe;
use bridge_server::{metrics_server, normalize_addr, Server};

fn init_logging() {
    let level = std::env::var("LOGLEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let with_source = std::env::var("LOGSRC")
        .map(|v| v.parse().unwrap_or(false))
        .unwrap_or(false);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(with_source)
        .with_line_number(with_source)
        .init();
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let token = CancellationToken::new();

    let metrics = Arc::new(PromMetrics::new());
    let server = Arc::new(Server::new(metrics.clone()));

    let addr = env_or("ADDR", ":50000");
    let listener = TcpListener::bind(normalize_addr(&addr))
        .await
        .with_context(|| format!("error binding service listener on {addr}"))?;
    tracing::info!(%addr, "bridgemux server listening");

    let opts = Opts {
        kubeconfig: std::env::var("KUBECONFIG").ok().map(Into::into),
        namespace: std::env::var("NAMESPACE").ok(),
    };
    let (runtime, events) = Runtime::new(opts);
    server.add_event_source(events, token.child_token());

    {
        let token = token.clone();
        let child = token.child_token();
        tokio::spawn(async move {
            if let Err(err) = runtime.run(child).await {
                tracing::error!(err = %err, "kubernetes runtime ended");
            }
            token.cancel();
        });
    }

    let probe = Arc::new(Probe::new(&env_or("PROBE_ADDR", ":8083")));
    {
        let probe = probe.clone();
        let token = token.clone();
        let child = token.child_token();
        tokio::spawn(async move {
            if let Err(err) = probe.run(child).await {
                tracing::error!(err = %err, "probe server ended");
            }
            token.cancel();
        });
    }

    {
        let registry = metrics.registry().clone();
        let metrics_addr = env_or("METRICS_ADDR", ":8081");
        let token = token.clone();
        let child = token.child_token();
        tokio::spawn(async move {
            if let Err(err) = metrics_server::serve_metrics(&metrics_addr, registry, child).await {
                tracing::error!(err = %err, "metrics server ended");
            }
            token.cancel();
        });
    }

    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                token.cancel();
            }
        });
    }

    probe.set_ready();

    server
        .serve(listener, token.clone())
        .await
        .context("service loop failed")?;

    Ok(())
}
