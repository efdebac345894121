//! Prometheus text exposition endpoint.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::normalize_addr;

/// Serve `/metrics` from `registry` until the token fires.
pub async fn serve_metrics(
    addr: &str,
    registry: Registry,
    token: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move { render(&registry) }
        }),
    );

    let listener = TcpListener::bind(normalize_addr(addr)).await?;
    tracing::info!(%addr, "metrics listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

fn render(registry: &Registry) -> impl IntoResponse {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(err) = encoder.encode(&registry.gather(), &mut buf) {
        tracing::warn!(err = %err, "error encoding metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_metrics::{Counter as _, MetricsFactory, PromMetrics};

    #[test]
    fn render_includes_registered_counters() {
        let metrics = PromMetrics::new();
        metrics
            .counter("proxy", &[("name", "svc"), ("from", "a"), ("to", "b")])
            .add(9);

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry().gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("bridgemux_proxy"));
        assert!(text.contains("name=\"svc\""));
    }
}
