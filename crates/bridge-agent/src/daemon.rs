//! The workstation daemon: endpoint lifecycle and per-bridge start/stop.

use std::sync::Arc;

use bridge_metrics::MetricsFactory;
use bridge_netalloc::{IpAllocator, NetworkAllocator};
use bridge_proto::{Bridge, Direction};
use bridge_store::Store;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::session::{Session, SessionError};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("endpoint already connected")]
    EndpointAlreadyConnected,

    #[error("endpoint not connected")]
    EndpointNotConnected,

    #[error("endpoint {0:?} not configured")]
    EndpointNotConfigured(String),

    #[error("endpoint {0:?} has no direct address; port-forward endpoints need the external forwarder")]
    NoDirectEndpoint(String),

    #[error("bridge not found")]
    BridgeNotFound,

    #[error("bridge already connected")]
    BridgeAlreadyConnected,

    #[error("bad service pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("{}", .0.join("\n"))]
    Failures(Vec<String>),
}

/// One connected logical server and the tunnels running against it.
struct OperationalEndpoint {
    session: Arc<Session>,
    token: CancellationToken,
    tunnels: Store<CancellationToken>,
}

#[derive(Debug, Serialize)]
pub struct BridgeStatus {
    #[serde(flatten)]
    pub bridge: Bridge,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub status: String,
    pub bridges: Vec<BridgeStatus>,
}

/// Owns every operational endpoint. All state is in memory; reconnecting an
/// endpoint rebuilds its registry from the server's initial dump.
pub struct Daemon {
    cfg: Config,
    allocator: Arc<NetworkAllocator>,
    metrics: Arc<dyn MetricsFactory>,
    endpoints: Store<Arc<OperationalEndpoint>>,
    token: CancellationToken,
}

impl Daemon {
    pub fn new(
        cfg: Config,
        allocator: Arc<NetworkAllocator>,
        metrics: Arc<dyn MetricsFactory>,
        token: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            allocator,
            metrics,
            endpoints: Store::new(),
            token,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Connect a configured endpoint. Fails when it is already connected or
    /// only reachable through the external port-forward helper.
    pub async fn connect(&self, name: &str) -> Result<(), DaemonError> {
        if self.endpoints.contains(name) {
            return Err(DaemonError::EndpointAlreadyConnected);
        }

        let endpoint_cfg = self
            .cfg
            .find_endpoint(name)
            .ok_or_else(|| DaemonError::EndpointNotConfigured(name.to_string()))?;

        if endpoint_cfg.endpoint.is_empty() {
            return Err(DaemonError::NoDirectEndpoint(name.to_string()));
        }

        let token = self.token.child_token();
        let session = Session::connect(
            &endpoint_cfg.endpoint,
            self.allocator.clone() as Arc<dyn IpAllocator>,
            self.metrics.clone(),
            token.clone(),
        )
        .await?;

        self.spawn_event_watcher(name, &session, token.clone());

        self.endpoints.set(
            name,
            Arc::new(OperationalEndpoint {
                session,
                token,
                tunnels: Store::new(),
            }),
        );

        tracing::info!(endpoint = %name, "endpoint connected");
        Ok(())
    }

    /// Consume the endpoint's event stream for observability. Event-driven
    /// teardown itself happens in the session's reader; this task only logs,
    /// including any backlog overflow.
    fn spawn_event_watcher(&self, name: &str, session: &Arc<Session>, token: CancellationToken) {
        let mut events = session.events();
        let name = name.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => return,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => {
                        tracing::info!(
                            endpoint = %name,
                            event = ?event.evt_name,
                            bridge = %event.bridge,
                            "event"
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(endpoint = %name, missed, "event backlog overflowed, dropped oldest");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    pub fn disconnect(&self, name: &str) -> Result<(), DaemonError> {
        let endpoint = self
            .endpoints
            .take(name)
            .ok_or(DaemonError::EndpointNotConnected)?;

        endpoint.token.cancel();
        tracing::info!(endpoint = %name, "endpoint disconnected");
        Ok(())
    }

    /// Start tunnels for a service name. A name containing `+` is a pattern
    /// (`+` reads as `.*`) applied to every known bridge; per-bridge
    /// failures are collected into one aggregated error.
    pub async fn start_service(&self, endpoint: &str, svc: &str) -> Result<(), DaemonError> {
        if !svc.contains('+') {
            return self.start_one(endpoint, svc);
        }

        let pattern = Regex::new(&svc.replace('+', ".*"))?;
        let operational = self
            .endpoints
            .get(endpoint)
            .ok_or(DaemonError::EndpointNotConnected)?;

        let mut failures = Vec::new();
        for name in operational.session.bridge_names() {
            if !pattern.is_match(&name) {
                continue;
            }
            if let Err(err) = self.start_one(endpoint, &name) {
                failures.push(format!("error starting {name}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaemonError::Failures(failures))
        }
    }

    fn start_one(&self, endpoint: &str, svc: &str) -> Result<(), DaemonError> {
        let operational = self
            .endpoints
            .get(endpoint)
            .ok_or(DaemonError::EndpointNotConnected)?;

        if operational.tunnels.contains(svc) {
            return Err(DaemonError::BridgeAlreadyConnected);
        }

        let bridge = operational
            .session
            .bridge(svc)
            .ok_or(DaemonError::BridgeNotFound)?;

        let token = operational.token.child_token();
        operational.tunnels.set(svc, token.clone());

        let session = operational.session.clone();
        let name = svc.to_string();

        match bridge.direction {
            Direction::L2C => {
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(err) = session.serve_proxy(bridge, token).await {
                        tracing::warn!(bridge = %name, err = %err, "error serving forward tunnel");
                    }
                });
            }
            Direction::C2L => {
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(err) = session.serve_reverse(bridge, token).await {
                        tracing::warn!(bridge = %name, err = %err, "error serving reverse tunnel");
                    }
                });
            }
        }

        tracing::info!(endpoint, bridge = %name, "service started");
        Ok(())
    }

    /// Stop tunnels for a service name, with the same `+` pattern handling
    /// as [`start_service`] applied to the running set.
    pub fn stop_service(&self, endpoint: &str, svc: &str) -> Result<(), DaemonError> {
        if !svc.contains('+') {
            return self.stop_one(endpoint, svc);
        }

        let pattern = Regex::new(&svc.replace('+', ".*"))?;
        let operational = self
            .endpoints
            .get(endpoint)
            .ok_or(DaemonError::EndpointNotConnected)?;

        let mut failures = Vec::new();
        for name in operational.tunnels.keys() {
            if !pattern.is_match(&name) {
                continue;
            }
            if let Err(err) = self.stop_one(endpoint, &name) {
                failures.push(format!("error stopping {name}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaemonError::Failures(failures))
        }
    }

    fn stop_one(&self, endpoint: &str, svc: &str) -> Result<(), DaemonError> {
        let operational = self
            .endpoints
            .get(endpoint)
            .ok_or(DaemonError::EndpointNotConnected)?;

        let tunnel = operational
            .tunnels
            .take(svc)
            .ok_or(DaemonError::BridgeNotFound)?;

        tunnel.cancel();
        tracing::info!(endpoint, bridge = %svc, "service stopped");
        Ok(())
    }

    /// Every configured endpoint with its known bridges and on/off state.
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.cfg
            .endpoints
            .iter()
            .map(|endpoint_cfg| {
                let operational = self.endpoints.get(&endpoint_cfg.name);

                let (status, bridges) = match operational {
                    Some(operational) => {
                        let bridges = operational
                            .session
                            .bridges()
                            .into_iter()
                            .map(|bridge| {
                                let on = operational.tunnels.contains(&bridge.name);
                                BridgeStatus {
                                    bridge,
                                    status: if on { "on" } else { "off" }.to_string(),
                                }
                            })
                            .collect();
                        ("on".to_string(), bridges)
                    }
                    None => ("off".to_string(), Vec::new()),
                };

                EndpointStatus {
                    name: endpoint_cfg.name.clone(),
                    status,
                    bridges,
                }
            })
            .collect()
    }

    pub fn connected_endpoints(&self) -> Vec<String> {
        self.endpoints.keys()
    }

    pub fn tunnel_count(&self, endpoint: &str) -> usize {
        self.endpoints
            .get(endpoint)
            .map(|operational| operational.tunnels.len())
            .unwrap_or(0)
    }

    /// Release every lease this agent still holds. Idempotent, best-effort.
    pub async fn cleanup(&self) {
        self.allocator.cleanup().await;
    }

    /// Cancel everything the daemon owns and give the leases back.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.cleanup().await;
    }
}
