//! End-to-end tunnels through a real in-process server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use bridge_agent::session::Session;
use bridge_metrics::NoopMetrics;
use bridge_netalloc::{IpAllocator, NetallocError};
use bridge_proto::{Bridge, Direction, Event, EventName, Family};
use bridge_server::Server;

/// Leases the loopback address so tests need no interface aliases, and
/// records releases for teardown assertions.
struct LoopbackAllocator {
    released: Mutex<Vec<String>>,
}

impl LoopbackAllocator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            released: Mutex::new(Vec::new()),
        })
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl IpAllocator for LoopbackAllocator {
    async fn get_ip(&self, _names: &[String]) -> Result<String, NetallocError> {
        Ok("127.0.0.1".to_string())
    }

    async fn release_ip(&self, addr: &str) -> Result<(), NetallocError> {
        self.released.lock().unwrap().push(addr.to_string());
        Ok(())
    }
}

async fn start_server() -> (Arc<Server>, String, CancellationToken) {
    let server = Arc::new(Server::new(Arc::new(NoopMetrics)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let token = CancellationToken::new();

    tokio::spawn(server.clone().serve(listener, token.clone()));
    (server, addr, token)
}

/// An echo service; stands in for the workload on either side of the fabric.
async fn start_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn l2c_bridge(name: &str, local_port: u16, container_addr: &str) -> Bridge {
    let (host, port) = container_addr.rsplit_once(':').unwrap();
    Bridge {
        namespace: "ns".to_string(),
        name: name.to_string(),
        local_addr: name.to_string(),
        local_port: local_port.to_string(),
        container_addr: host.to_string(),
        container_port: port.to_string(),
        direction: Direction::L2C,
        family: Family::Tcp,
    }
}

async fn connect_session(
    addr: &str,
    allocator: Arc<LoopbackAllocator>,
    token: CancellationToken,
) -> Arc<Session> {
    Session::connect(addr, allocator, Arc::new(NoopMetrics), token)
        .await
        .unwrap()
}

#[tokio::test]
async fn l2c_round_trip() {
    let (_server, addr, _server_token) = start_server().await;
    let echo_addr = start_echo().await;

    let allocator = LoopbackAllocator::new();
    let session_token = CancellationToken::new();
    let session = connect_session(&addr, allocator.clone(), session_token.clone()).await;

    let local_port = free_port().await;
    let bridge = l2c_bridge("echo", local_port, &echo_addr);

    let tunnel_token = session_token.child_token();
    {
        let session = session.clone();
        let bridge = bridge.clone();
        let tunnel_token = tunnel_token.clone();
        tokio::spawn(async move { session.serve_proxy(bridge, tunnel_token).await });
    }

    wait_until("forward tunnel", || session.tunnel_active("echo")).await;

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");

    // Stopping the tunnel releases the lease.
    tunnel_token.cancel();
    wait_until("lease release", || !allocator.released().is_empty()).await;
    assert_eq!(allocator.released(), vec!["127.0.0.1".to_string()]);
}

#[tokio::test]
async fn l2c_close_propagates_from_client() {
    let (_server, addr, _server_token) = start_server().await;

    // Cluster endpoint that reports when its connection dies.
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 16];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = eof_tx.send(());
                    return;
                }
                Ok(_) => {}
            }
        }
    });

    let allocator = LoopbackAllocator::new();
    let session_token = CancellationToken::new();
    let session = connect_session(&addr, allocator, session_token.clone()).await;

    let local_port = free_port().await;
    let bridge = l2c_bridge("prop", local_port, &upstream_addr);
    {
        let session = session.clone();
        let token = session_token.child_token();
        tokio::spawn(async move { session.serve_proxy(bridge, token).await });
    }
    wait_until("forward tunnel", || session.tunnel_active("prop")).await;

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), eof_rx)
        .await
        .expect("dialed endpoint saw EOF")
        .unwrap();
}

#[tokio::test]
async fn c2l_round_trip() {
    let (_server, addr, _server_token) = start_server().await;
    let echo_addr = start_echo().await;
    let (echo_host, echo_port) = echo_addr.rsplit_once(':').unwrap();

    let allocator = LoopbackAllocator::new();
    let session_token = CancellationToken::new();
    let session = connect_session(&addr, allocator, session_token.clone()).await;

    let cluster_port = free_port().await;
    let bridge = Bridge {
        namespace: String::new(),
        name: "rev".to_string(),
        local_addr: echo_host.to_string(),
        local_port: echo_port.to_string(),
        container_addr: "127.0.0.1".to_string(),
        container_port: cluster_port.to_string(),
        direction: Direction::C2L,
        family: Family::Tcp,
    };

    {
        let session = session.clone();
        let token = session_token.child_token();
        tokio::spawn(async move { session.serve_reverse(bridge, token).await });
    }
    wait_until("reverse tunnel", || session.tunnel_active("rev")).await;

    let mut cluster_client = TcpStream::connect(("127.0.0.1", cluster_port)).await.unwrap();
    cluster_client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    cluster_client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn events_arrive_in_order_and_registry_leads_delivery() {
    let (server, addr, _server_token) = start_server().await;

    let allocator = LoopbackAllocator::new();
    let session = connect_session(&addr, allocator, CancellationToken::new()).await;
    let mut events = session.events();

    wait_until("session registration", || server.session_count() == 1).await;

    for name in ["b0", "b1", "b2"] {
        server
            .publish(Event {
                evt_name: EventName::BridgeAdd,
                bridge: l2c_bridge(name, 1, "127.0.0.1:1"),
            })
            .await;
    }

    for name in ["b0", "b1", "b2"] {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.evt_name, EventName::BridgeAdd);
        assert_eq!(event.bridge.name, name);
        // The registry was updated before the event was published.
        assert!(session.bridge(name).is_some());
    }
}

#[tokio::test]
async fn bridge_del_tears_down_the_tunnel_and_lease() {
    let (server, addr, _server_token) = start_server().await;
    let echo_addr = start_echo().await;

    let allocator = LoopbackAllocator::new();
    let session_token = CancellationToken::new();
    let session = connect_session(&addr, allocator.clone(), session_token.clone()).await;

    let local_port = free_port().await;
    let bridge = l2c_bridge("doomed", local_port, &echo_addr);
    {
        let session = session.clone();
        let bridge = bridge.clone();
        let token = session_token.child_token();
        tokio::spawn(async move { session.serve_proxy(bridge, token).await });
    }
    wait_until("forward tunnel", || session.tunnel_active("doomed")).await;

    server
        .publish(Event {
            evt_name: EventName::BridgeDel,
            bridge,
        })
        .await;

    wait_until("tunnel teardown", || !session.tunnel_active("doomed")).await;
    wait_until("lease release", || !allocator.released().is_empty()).await;
    assert!(session.bridge("doomed").is_none());

    // The local listener is gone with the tunnel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(("127.0.0.1", local_port)).await.is_err());
}

#[tokio::test]
async fn server_shutdown_tears_down_session_tunnels() {
    let (_server, addr, server_token) = start_server().await;
    let echo_addr = start_echo().await;

    let allocator = LoopbackAllocator::new();
    let session_token = CancellationToken::new();
    let session = connect_session(&addr, allocator.clone(), session_token.clone()).await;

    let local_port = free_port().await;
    let bridge = l2c_bridge("orphan", local_port, &echo_addr);
    {
        let session = session.clone();
        let token = session_token.child_token();
        tokio::spawn(async move { session.serve_proxy(bridge, token).await });
    }
    wait_until("forward tunnel", || session.tunnel_active("orphan")).await;

    // Dropping the server kills the control stream; nothing may leak.
    server_token.cancel();

    wait_until("session teardown", || session_token.is_cancelled()).await;
    wait_until("tunnel teardown", || !session.tunnel_active("orphan")).await;
    wait_until("lease release", || !allocator.released().is_empty()).await;
}
