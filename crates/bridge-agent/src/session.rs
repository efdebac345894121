//! One live connection to a bridgemux server: the control stream, the
//! mirrored bridge registry, and the forward/reverse tunnel loops.

use std::sync::Arc;

use bridge_metrics::MetricsFactory;
use bridge_pipe::Pump;
use bridge_netalloc::{IpAllocator, NetallocError};
use bridge_proto::{
    read_ack, read_frame, read_json, write_ack, write_json, Bridge, CodecError, Command, Event,
    EventName, Family, ProxyRequest, RevProxyListenRequest, RevProxyWork,
};
use bridge_store::Store;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Bound on undelivered events per consumer; beyond it the oldest entries
/// are discarded.
pub const MAX_EVENTS_BACKLOG: usize = 24;

const RESPONSE_BACKLOG: usize = 8;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Codec(#[from] CodecError),

    #[error("allocator error: {0}")]
    Alloc(#[from] NetallocError),

    #[error("family {0} is not supported for tunnels")]
    UnsupportedFamily(Family),
}

/// Raw non-event frame received on the control stream, parked for future
/// synchronous commands.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub cmd: Command,
    pub payload: Vec<u8>,
}

/// A connected agent session. Dropping it does not tear the tunnels down;
/// cancel the token it was created with (or let the control stream die).
pub struct Session {
    endpoint: String,
    bridges: Store<Bridge>,
    tunnels: Store<CancellationToken>,
    events_tx: broadcast::Sender<Event>,
    first_events_rx: std::sync::Mutex<Option<broadcast::Receiver<Event>>>,
    responses: tokio::sync::Mutex<mpsc::Receiver<RawResponse>>,
    allocator: Arc<dyn IpAllocator>,
    metrics: Arc<dyn MetricsFactory>,
    token: CancellationToken,
}

impl Session {
    /// Dial the server, perform the control handshake and start the reader
    /// loop. The session lives until `token` is cancelled or the control
    /// stream breaks, whichever comes first.
    pub async fn connect(
        endpoint: &str,
        allocator: Arc<dyn IpAllocator>,
        metrics: Arc<dyn MetricsFactory>,
        token: CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        let mut conn = TcpStream::connect(endpoint).await?;
        write_ack(&mut conn, Command::Control).await?;
        read_ack(&mut conn, Command::Control).await?;

        tracing::info!(endpoint, "control connection established");

        let (events_tx, first_events_rx) = broadcast::channel(MAX_EVENTS_BACKLOG);
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BACKLOG);

        let session = Arc::new(Self {
            endpoint: endpoint.to_string(),
            bridges: Store::new(),
            tunnels: Store::new(),
            events_tx,
            first_events_rx: std::sync::Mutex::new(Some(first_events_rx)),
            responses: tokio::sync::Mutex::new(responses_rx),
            allocator,
            metrics,
            token,
        });

        let reader = session.clone();
        tokio::spawn(async move { reader.read_loop(conn, responses_tx).await });

        Ok(session)
    }

    /// Subscribe to the event stream. The first subscription sees every
    /// event since connect, including the server's initial registry dump;
    /// later ones start from now. A consumer that falls more than
    /// [`MAX_EVENTS_BACKLOG`] events behind loses the oldest entries.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        if let Some(rx) = self.first_events_rx.lock().unwrap().take() {
            return rx;
        }
        self.events_tx.subscribe()
    }

    /// Next parked non-event frame, if any. Reserved for future synchronous
    /// commands; no current server sends one.
    pub async fn next_response(&self) -> Option<RawResponse> {
        self.responses.lock().await.recv().await
    }

    pub fn bridge(&self, name: &str) -> Option<Bridge> {
        self.bridges.get(name)
    }

    pub fn bridge_names(&self) -> Vec<String> {
        self.bridges.keys()
    }

    pub fn bridges(&self) -> Vec<Bridge> {
        self.bridges.values()
    }

    pub fn tunnel_active(&self, name: &str) -> bool {
        self.tunnels.contains(name)
    }

    /// The reader owns the control stream. Events are applied to the local
    /// registry first and published second, so a consumer observing an event
    /// always sees a registry at least as advanced as that event.
    async fn read_loop(self: Arc<Self>, mut conn: TcpStream, responses: mpsc::Sender<RawResponse>) {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = read_frame(&mut conn) => frame,
            };

            let (cmd, payload) = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(err = %err, "error reading control stream");
                    break;
                }
            };

            match cmd {
                Command::Events => {
                    let event: Event = match serde_json::from_slice(&payload) {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(err = %err, "error decoding event");
                            continue;
                        }
                    };

                    self.apply_event(&event);

                    // Nobody subscribed yet means nothing to deliver.
                    let _ = self.events_tx.send(event);
                }
                other => {
                    let parked = RawResponse {
                        cmd: other,
                        payload,
                    };
                    if responses.try_send(parked).is_err() {
                        tracing::warn!(command = %other, "response backlog full, dropping frame");
                    }
                }
            }
        }

        // A dead control stream invalidates every tunnel this session owns.
        self.token.cancel();
        tracing::info!(endpoint = %self.endpoint, "control stream closed");
    }

    fn apply_event(&self, event: &Event) {
        let name = event.bridge.name.as_str();
        if name.is_empty() {
            tracing::warn!("event carries a bridge without a name, ignoring");
            return;
        }

        match event.evt_name {
            EventName::BridgeAdd => {
                self.bridges.set(name, event.bridge.clone());
            }
            EventName::BridgeDel => {
                self.bridges.del(&[name]);
                self.cancel_tunnel(name);
            }
            EventName::BridgeUp => {
                self.cancel_tunnel(name);
                self.bridges.set(name, event.bridge.clone());
            }
        }
    }

    fn cancel_tunnel(&self, name: &str) {
        if let Some(tunnel) = self.tunnels.take(name) {
            tracing::info!(bridge = %name, "bridge changed, closing its tunnel");
            tunnel.cancel();
        }
    }

    /// Open one L2C data connection. The stream carries raw bytes once the
    /// request frame is on the wire.
    pub async fn open_proxy(&self, req: &ProxyRequest) -> Result<TcpStream, SessionError> {
        let mut conn = TcpStream::connect(&self.endpoint).await?;
        write_json(&mut conn, Command::Proxy, req).await?;
        Ok(conn)
    }

    /// Serve a forward (L2C) bridge until `token` fires: lease a local IP
    /// under the bridge's name, listen on it, and open one server connection
    /// per accepted client.
    pub async fn serve_proxy(
        &self,
        bridge: Bridge,
        token: CancellationToken,
    ) -> Result<(), SessionError> {
        if bridge.family != Family::Tcp {
            return Err(SessionError::UnsupportedFamily(bridge.family));
        }

        let names = [bridge.local_name()];
        let ip = self.allocator.get_ip(&names).await?;

        let result = self.serve_proxy_on(&bridge, &ip, token).await;

        if let Err(err) = self.allocator.release_ip(&ip).await {
            tracing::warn!(bridge = %bridge.name, %ip, err = %err, "error releasing address");
        }

        result
    }

    async fn serve_proxy_on(
        &self,
        bridge: &Bridge,
        ip: &str,
        token: CancellationToken,
    ) -> Result<(), SessionError> {
        let listen_addr = format!("{}:{}", ip, bridge.local_port);
        let listener = TcpListener::bind(&listen_addr).await?;

        tracing::info!(bridge = %bridge.name, addr = %listen_addr, "forward tunnel listening");
        self.tunnels.set(&bridge.name, token.clone());

        let result = loop {
            let (client, peer) = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                _ = self.token.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => break Err(SessionError::Io(err)),
                },
            };

            tracing::debug!(bridge = %bridge.name, %peer, "client connected");

            let req = ProxyRequest {
                name: bridge.name.clone(),
                family: bridge.family,
                endpoint: bridge.full_container_addr(),
            };
            let upstream = match self.open_proxy(&req).await {
                Ok(upstream) => upstream,
                Err(err) => break Err(err),
            };

            let pump = self.pump(
                "proxy",
                &bridge.name,
                &listen_addr,
                &bridge.full_container_addr(),
            );
            let child = token.child_token();
            let name = bridge.name.clone();

            tokio::spawn(async move {
                if let Err(err) = pump.run(client, upstream, child).await {
                    tracing::warn!(bridge = %name, err = %err, "forward pump failed");
                }
            });
        };

        self.tunnels.del(&[bridge.name.as_str()]);
        tracing::info!(bridge = %bridge.name, "forward tunnel closed");

        result
    }

    /// Serve a reverse (C2L) bridge until `token` fires: ask the server to
    /// listen cluster-side, then pair every announced inbound connection
    /// with a fresh data stream and the local destination.
    pub async fn serve_reverse(
        &self,
        bridge: Bridge,
        token: CancellationToken,
    ) -> Result<(), SessionError> {
        if bridge.family != Family::Tcp {
            return Err(SessionError::UnsupportedFamily(bridge.family));
        }

        let mut conn = TcpStream::connect(&self.endpoint).await?;
        let req = RevProxyListenRequest {
            name: bridge.name.clone(),
            family: bridge.family,
            endpoint: bridge.full_container_addr(),
            local_addr: bridge.full_local_addr(),
        };
        write_json(&mut conn, Command::RevProxyListen, &req).await?;
        read_ack(&mut conn, Command::RevProxyListen).await?;

        tracing::info!(
            bridge = %bridge.name,
            remote = %req.endpoint,
            local = %req.local_addr,
            "reverse tunnel registered"
        );
        self.tunnels.set(&bridge.name, token.clone());

        let result = loop {
            let work = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                _ = self.token.cancelled() => break Ok(()),
                work = read_json::<_, RevProxyWork>(&mut conn, Command::RevProxyWork) => match work {
                    Ok(work) => work,
                    Err(CodecError::Io(err))
                        if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break Ok(());
                    }
                    Err(err) => break Err(err.into()),
                },
            };

            tracing::debug!(bridge = %bridge.name, id = %work.id, "reverse work announced");

            let endpoint = self.endpoint.clone();
            let local_addr = bridge.full_local_addr();
            let pump = self.pump(
                "rev_proxy",
                &bridge.name,
                &bridge.full_container_addr(),
                &local_addr,
            );
            let child = token.child_token();
            let name = bridge.name.clone();

            tokio::spawn(async move {
                if let Err(err) = reverse_worker(&endpoint, &local_addr, work, pump, child).await {
                    tracing::warn!(bridge = %name, err = %err, "reverse worker failed");
                }
            });
        };

        self.tunnels.del(&[bridge.name.as_str()]);
        tracing::info!(bridge = %bridge.name, "reverse tunnel closed");

        result
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

/// One reverse connection: claim the parked peer at the server, dial the
/// local destination, pump until either side closes.
async fn reverse_worker(
    endpoint: &str,
    local_addr: &str,
    work: RevProxyWork,
    pump: Pump,
    token: CancellationToken,
) -> Result<(), SessionError> {
    let mut server_conn = TcpStream::connect(endpoint).await?;
    write_json(&mut server_conn, Command::RevProxyWork, &work).await?;
    read_ack(&mut server_conn, Command::RevProxyWork).await?;

    let local_conn = TcpStream::connect(local_addr).await?;

    pump.run(local_conn, server_conn, token)
        .await
        .map_err(|err| SessionError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;

    Ok(())
}
