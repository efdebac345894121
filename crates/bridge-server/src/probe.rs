//! Liveness and readiness endpoints for the cluster scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::normalize_addr;

/// `/live` answers as soon as the process runs; `/ready` answers once the
/// owner flips the flag.
pub struct Probe {
    addr: String,
    ready: Arc<AtomicBool>,
}

impl Probe {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub async fn run(&self, token: CancellationToken) -> std::io::Result<()> {
        let ready = self.ready.clone();

        let app = Router::new()
            .route("/live", get(|| async { "ok" }))
            .route(
                "/ready",
                get(move || {
                    let ready = ready.clone();
                    async move {
                        if ready.load(Ordering::SeqCst) {
                            "ok".into_response()
                        } else {
                            tracing::warn!("probe: not ready");
                            (StatusCode::SERVICE_UNAVAILABLE, "not ready yet").into_response()
                        }
                    }
                }),
            );

        let listener = TcpListener::bind(normalize_addr(&self.addr)).await?;
        tracing::info!(addr = %self.addr, "probe listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    }
}
