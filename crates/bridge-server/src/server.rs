//! Connection dispatch, control sessions and the event broadcast plane.

use std::sync::Arc;

use bridge_metrics::MetricsFactory;
use bridge_pipe::{Pump, PumpError};
use bridge_proto::{
    read_frame, write_ack, write_frame, write_json, CodecError, Command, Event, EventName, Family,
    ProxyRequest, RevProxyListenRequest, RevProxyWork,
};
use bridge_store::Store;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Codec(#[from] CodecError),

    #[error("bad request payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("error dialing {endpoint}: {source}")]
    Dial {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("family {0} is not supported for tunnels")]
    UnsupportedFamily(Family),

    #[error("cannot split port from listen address {0:?}")]
    BadListenAddr(String),

    #[error("no parked connection for id {0}")]
    UnknownWorkId(String),

    #[error("pump failed: {0}")]
    Pump(#[from] PumpError),
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// One server instance: owns the bridge registry, the set of connected
/// control sessions and the parked reverse-tunnel connections. Everything is
/// reconstructed from cluster state on restart; nothing persists.
pub struct Server {
    sessions: Store<SharedWriter>,
    parked: Store<TcpStream>,
    bridges: Store<bridge_proto::Bridge>,
    metrics: Arc<dyn MetricsFactory>,
}

impl Server {
    pub fn new(metrics: Arc<dyn MetricsFactory>) -> Self {
        Self {
            sessions: Store::new(),
            parked: Store::new(),
            bridges: Store::new(),
            metrics,
        }
    }

    /// Fan in events from a source until it closes or the token fires. The
    /// server accepts any number of sources.
    pub fn add_event_source(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        token: CancellationToken,
    ) {
        let server = self.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                server.publish(event).await;
            }
        });
    }

    /// Apply an event to the registry and broadcast it to every connected
    /// agent, in that order.
    pub async fn publish(&self, event: Event) {
        tracing::info!(event = ?event.evt_name, bridge = %event.bridge, "event");

        if event.bridge.name.is_empty() {
            tracing::warn!("event carries a bridge without a name, not registering");
        } else {
            match event.evt_name {
                EventName::BridgeAdd | EventName::BridgeUp => {
                    self.bridges.set(&event.bridge.name, event.bridge.clone());
                }
                EventName::BridgeDel => {
                    self.bridges.del(&[event.bridge.name.as_str()]);
                }
            }
        }

        self.broadcast(&event).await;
    }

    async fn broadcast(&self, event: &Event) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(err = %err, "error marshalling event");
                return;
            }
        };

        let mut recipients: Vec<(String, SharedWriter)> = Vec::new();
        self.sessions
            .for_each(|id, writer| recipients.push((id.to_string(), writer.clone())));

        for (id, writer) in recipients {
            let mut writer = writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, Command::Events, &payload).await {
                // The session's own read loop tears the registration down.
                tracing::warn!(session = %id, err = %err, "error broadcasting to session");
            }
        }
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept connections until the token fires. Each connection is owned by
    /// a task holding a child token, so shutting the server down tears every
    /// session and tunnel with it.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            let (conn, peer) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };

            tracing::debug!(%peer, "accepted connection");

            let server = self.clone();
            let conn_token = token.child_token();

            tokio::spawn(async move {
                if let Err(err) = server.handle_conn(conn, conn_token).await {
                    tracing::warn!(%peer, err = %err, "connection ended with error");
                }
            });
        }
    }

    /// First frame decides what a connection is: a long-lived control
    /// session, an L2C data stream, a reverse-listen request or a reverse
    /// data stream. Anything else is logged and dropped.
    async fn handle_conn(
        &self,
        mut conn: TcpStream,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        let (cmd, payload) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            frame = read_frame(&mut conn) => frame?,
        };

        tracing::debug!(command = %cmd, "dispatching connection");

        match cmd {
            Command::Control => self.handle_control(conn, token).await,
            Command::Proxy => {
                let req: ProxyRequest = serde_json::from_slice(&payload)?;
                self.handle_proxy(conn, req, token).await
            }
            Command::RevProxyListen => {
                let req: RevProxyListenRequest = serde_json::from_slice(&payload)?;
                self.handle_rev_listen(conn, req, token).await
            }
            Command::RevProxyWork => {
                let req: RevProxyWork = serde_json::from_slice(&payload)?;
                self.handle_rev_work(conn, req, token).await
            }
            other => {
                tracing::warn!(command = %other, "unknown command, closing connection");
                Ok(())
            }
        }
    }

    /// Long-lived agent session: acknowledge, replay the registry as
    /// `bridge-add` events, register for broadcasts, then sit on the read
    /// loop. No client-originated commands are defined yet; every frame the
    /// peer sends is answered with `unknown`.
    async fn handle_control(
        &self,
        conn: TcpStream,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        let (mut read_half, write_half) = conn.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));

        // Register before acknowledging: once the agent has seen the ack it
        // may rely on receiving every subsequent broadcast.
        let id = self.sessions.add(writer.clone());
        tracing::info!(session = %id, "control session active");

        let result = self
            .run_control(&mut read_half, &writer, &id, token)
            .await;

        self.sessions.del(&[id.as_str()]);
        tracing::info!(session = %id, "control session closed");

        result
    }

    async fn run_control(
        &self,
        read_half: &mut OwnedReadHalf,
        writer: &SharedWriter,
        id: &str,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        {
            let mut w = writer.lock().await;
            write_ack(&mut *w, Command::Control).await?;

            for bridge in self.bridges.values() {
                let event = Event {
                    evt_name: EventName::BridgeAdd,
                    bridge,
                };
                write_json(&mut *w, Command::Events, &event).await?;
            }
        }

        self.control_read_loop(read_half, writer, id, token).await
    }

    async fn control_read_loop(
        &self,
        read_half: &mut OwnedReadHalf,
        writer: &SharedWriter,
        id: &str,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            let (cmd, _) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                frame = read_frame(read_half) => match frame {
                    Ok(frame) => frame,
                    Err(CodecError::Io(err))
                        if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                },
            };

            tracing::debug!(session = %id, command = %cmd, "unexpected client frame");

            let mut w = writer.lock().await;
            write_ack(&mut *w, Command::Unknown).await?;
        }
    }

    /// L2C data connection: dial the requested cluster endpoint and pump raw
    /// bytes for the rest of the connection's life.
    async fn handle_proxy(
        &self,
        conn: TcpStream,
        req: ProxyRequest,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        if req.family != Family::Tcp {
            return Err(ServerError::UnsupportedFamily(req.family));
        }

        let upstream =
            TcpStream::connect(&req.endpoint)
                .await
                .map_err(|source| ServerError::Dial {
                    endpoint: req.endpoint.clone(),
                    source,
                })?;

        tracing::debug!(name = %req.name, endpoint = %req.endpoint, "forward tunnel open");

        let peer = peer_label(&conn);
        let totals = self
            .pump("proxy", &req.name, &peer, &req.endpoint)
            .run(conn, upstream, token)
            .await?;

        tracing::debug!(
            name = %req.name,
            sent = totals.a_to_b,
            received = totals.b_to_a,
            "forward tunnel closed"
        );

        Ok(())
    }

    /// C2L listen request: bind the cluster-side port, then park every
    /// inbound connection and tell the agent its id. The listener lives
    /// exactly as long as the requesting connection.
    async fn handle_rev_listen(
        &self,
        conn: TcpStream,
        req: RevProxyListenRequest,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        if req.family != Family::Tcp {
            return Err(ServerError::UnsupportedFamily(req.family));
        }

        let port = req
            .endpoint
            .rsplit(':')
            .next()
            .filter(|port| !port.is_empty() && *port != req.endpoint)
            .ok_or_else(|| ServerError::BadListenAddr(req.endpoint.clone()))?;

        let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;

        let (mut read_half, mut write_half) = conn.into_split();
        write_ack(&mut write_half, Command::RevProxyListen).await?;

        tracing::info!(name = %req.name, port = %port, "reverse listener open");

        let mut parked_here: Vec<String> = Vec::new();

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),

                // The agent never sends another frame here; readable data or
                // EOF both mean the session is going away.
                frame = read_frame(&mut read_half) => {
                    if let Ok((cmd, _)) = frame {
                        tracing::debug!(command = %cmd, "frame on reverse-listen stream, closing");
                    }
                    break Ok(());
                }

                accepted = listener.accept() => {
                    let (inbound, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => break Err(ServerError::Io(err)),
                    };

                    let id = self.parked.add(inbound);
                    parked_here.push(id.clone());
                    tracing::debug!(id = %id, %peer, "parked inbound connection");

                    let notify = RevProxyWork { id };
                    if let Err(err) =
                        write_json(&mut write_half, Command::RevProxyWork, &notify).await
                    {
                        break Err(err.into());
                    }
                }
            }
        };

        // Unpark whatever the agent never claimed; dropping the streams
        // closes them.
        let leftover: Vec<&str> = parked_here.iter().map(String::as_str).collect();
        self.parked.del(&leftover);

        tracing::info!(name = %req.name, port = %port, "reverse listener closed");
        result
    }

    /// C2L data connection: pair it with the parked peer it quotes and pump.
    async fn handle_rev_work(
        &self,
        mut conn: TcpStream,
        req: RevProxyWork,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        let parked = self
            .parked
            .take(&req.id)
            .ok_or_else(|| ServerError::UnknownWorkId(req.id.clone()))?;

        write_ack(&mut conn, Command::RevProxyWork).await?;

        let agent = peer_label(&conn);
        let cluster = parked
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        tracing::debug!(id = %req.id, agent = %agent, cluster = %cluster, "reverse tunnel paired");

        let totals = self
            .pump("rev_proxy", &req.id, &agent, &cluster)
            .run(conn, parked, token)
            .await?;

        tracing::debug!(
            id = %req.id,
            sent = totals.a_to_b,
            received = totals.b_to_a,
            "reverse tunnel closed"
        );

        Ok(())
    }

    fn pump(&self, metric: &str, name: &str, from: &str, to: &str) -> Pump {
        let a_to_b = self
            .metrics
            .counter(metric, &[("name", name), ("from", from), ("to", to)]);
        let b_to_a = self
            .metrics
            .counter(metric, &[("name", name), ("from", to), ("to", from)]);

        Pump::with_reporters(a_to_b, b_to_a)
    }
}

fn peer_label(conn: &TcpStream) -> String {
    conn.peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}
