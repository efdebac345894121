//! Kubernetes event source: watches a namespace's services and turns them
//! into bridge lifecycle events.
//!
//! Services can describe their bridges explicitly through the `bridgemux`
//! annotation (a YAML sequence of partial bridges); anything left out, and
//! services without the annotation entirely, are filled from the service
//! itself: cluster IP, first port, name and namespace, direction L2C,
//! family tcp.

use std::path::PathBuf;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bridge_proto::{Bridge, Event, EventName};

/// Annotation carrying explicit bridge definitions.
pub const BRIDGE_ANNOTATION: &str = "bridgemux";

const NAMESPACE_MOUNT: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const EVENTS_CAPACITY: usize = 16;
const WATCH_RETRY: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum KubeSourceError {
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("error loading kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("error resolving namespace: {0}")]
    Namespace(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone)]
pub struct Opts {
    /// Explicit kubeconfig path; in-cluster configuration when absent.
    pub kubeconfig: Option<PathBuf>,
    /// Namespace to watch; the serviceaccount namespace when absent.
    pub namespace: Option<String>,
}

/// Watches services and publishes bridge events until cancelled.
pub struct Runtime {
    opts: Opts,
    tx: mpsc::Sender<Event>,
}

impl Runtime {
    /// Build the runtime and hand back the receiving side of its event
    /// stream, which the server fans in.
    pub fn new(opts: Opts) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENTS_CAPACITY);
        (Self { opts, tx }, rx)
    }

    async fn client(&self) -> Result<Client, KubeSourceError> {
        if let Some(path) = &self.opts.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            return Ok(Client::try_from(config)?);
        }

        tracing::info!("using in-cluster configuration");
        Ok(Client::try_default().await?)
    }

    fn namespace(&self) -> Result<String, KubeSourceError> {
        if let Some(ns) = &self.opts.namespace {
            return Ok(ns.clone());
        }

        Ok(std::fs::read_to_string(NAMESPACE_MOUNT)?.trim().to_string())
    }

    /// Run the watch until the token is cancelled. Watch failures are logged
    /// and the watch restarted; they never kill the source.
    pub async fn run(self, token: CancellationToken) -> Result<(), KubeSourceError> {
        let client = self.client().await?;
        let namespace = self.namespace()?;
        let api: Api<Service> = Api::namespaced(client, &namespace);

        tracing::info!(namespace = %namespace, "watching services");

        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let stream = match api.watch(&WatchParams::default(), "0").await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(err = %err, "error starting watch, retrying");
                    tokio::time::sleep(WATCH_RETRY).await;
                    continue;
                }
            };
            let mut stream = stream.boxed();

            loop {
                let status = tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    status = stream.try_next() => status,
                };

                match status {
                    Ok(Some(watch_event)) => {
                        if self.handle(watch_event).await.is_err() {
                            // Receiver gone: the server shut down.
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("watch stream ended, restarting");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "watch error, restarting");
                        tokio::time::sleep(WATCH_RETRY).await;
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, watch_event: WatchEvent<Service>) -> Result<(), ()> {
        let (evt_name, service) = match watch_event {
            WatchEvent::Added(service) => (EventName::BridgeAdd, service),
            WatchEvent::Modified(service) => (EventName::BridgeUp, service),
            WatchEvent::Deleted(service) => (EventName::BridgeDel, service),
            WatchEvent::Bookmark(_) => return Ok(()),
            WatchEvent::Error(err) => {
                tracing::warn!(code = err.code, message = %err.message, "watch error event");
                return Ok(());
            }
        };

        for bridge in bridges_for_service(&service) {
            tracing::info!(event = ?evt_name, bridge = %bridge, "service event");

            self.tx
                .send(Event {
                    evt_name,
                    bridge,
                })
                .await
                .map_err(|_| ())?;
        }

        Ok(())
    }
}

/// Derive the bridges a service describes. Annotated services yield one
/// bridge per annotation entry with missing fields defaulted; unannotated
/// services yield a single fully-defaulted bridge. A malformed annotation is
/// logged and yields nothing.
pub fn bridges_for_service(service: &Service) -> Vec<Bridge> {
    let name = service.metadata.name.clone().unwrap_or_default();
    let namespace = service.metadata.namespace.clone().unwrap_or_default();

    let annotation = service
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(BRIDGE_ANNOTATION));

    let mut bridges = match annotation {
        Some(raw) => match serde_yaml::from_str::<Vec<Bridge>>(raw) {
            Ok(bridges) => bridges,
            Err(err) => {
                tracing::warn!(
                    service = %name,
                    namespace = %namespace,
                    err = %err,
                    "malformed bridge annotation, skipping"
                );
                return Vec::new();
            }
        },
        None => vec![Bridge::default()],
    };

    for bridge in &mut bridges {
        fill_defaults(bridge, service);
    }

    bridges.retain(|bridge| match bridge.validate() {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(service = %name, err = %err, "dropping unusable bridge");
            false
        }
    });

    bridges
}

fn fill_defaults(bridge: &mut Bridge, service: &Service) {
    let spec = service.spec.as_ref();

    if bridge.name.is_empty() {
        bridge.name = service.metadata.name.clone().unwrap_or_default();
    }

    if bridge.container_addr.is_empty() {
        bridge.container_addr = spec
            .and_then(|s| s.cluster_ip.clone())
            .unwrap_or_default();
    }

    if bridge.local_addr.is_empty() {
        bridge.local_addr = bridge.name.clone();
    }

    let first_port = spec
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.port.to_string());

    if bridge.container_port.is_empty() {
        bridge.container_port = first_port.clone().unwrap_or_default();
    }

    if bridge.local_port.is_empty() {
        bridge.local_port = first_port.unwrap_or_default();
    }

    bridge.namespace = service.metadata.namespace.clone().unwrap_or_default();
}
