//! Daemon-level behavior: endpoint lifecycle, start/stop semantics and the
//! `+` service patterns, against a real in-process server.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use bridge_agent::config::{Config, Endpoint};
use bridge_agent::daemon::{Daemon, DaemonError};
use bridge_metrics::NoopMetrics;
use bridge_netalloc::{NetworkAllocator, NoopShell};
use bridge_proto::{Bridge, Direction, Event, EventName, Family};
use bridge_server::Server;

async fn start_server() -> (Arc<Server>, String, CancellationToken) {
    let server = Arc::new(Server::new(Arc::new(NoopMetrics)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let token = CancellationToken::new();

    tokio::spawn(server.clone().serve(listener, token.clone()));
    (server, addr, token)
}

fn daemon_for(addr: &str) -> (Daemon, Arc<NetworkAllocator>) {
    let config = Config {
        network: "127.0.0.0/29".to_string(),
        iface: "lo".to_string(),
        log_level: "info".to_string(),
        endpoints: vec![
            Endpoint {
                name: "dev".to_string(),
                endpoint: addr.to_string(),
                ..Default::default()
            },
            Endpoint {
                name: "forwarded".to_string(),
                ..Default::default()
            },
        ],
    };

    // Loopback pool: every 127.0.0.x address binds without an alias.
    let allocator = Arc::new(
        NetworkAllocator::new("lo", "127.0.0.0/29", Arc::new(NoopShell)).unwrap(),
    );

    let daemon = Daemon::new(
        config,
        allocator.clone(),
        Arc::new(NoopMetrics),
        CancellationToken::new(),
    );

    (daemon, allocator)
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn publish_l2c(server: &Server, name: &str, local_port: u16) {
    server
        .publish(Event {
            evt_name: EventName::BridgeAdd,
            bridge: Bridge {
                namespace: "ns".to_string(),
                name: name.to_string(),
                local_addr: name.to_string(),
                local_port: local_port.to_string(),
                container_addr: "127.0.0.1".to_string(),
                container_port: "9".to_string(),
                direction: Direction::L2C,
                family: Family::Tcp,
            },
        })
        .await;
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

fn known_bridges(daemon: &Daemon, endpoint: &str) -> usize {
    daemon
        .status()
        .into_iter()
        .find(|s| s.name == endpoint)
        .map(|s| s.bridges.len())
        .unwrap_or(0)
}

#[tokio::test]
async fn connect_is_exclusive_per_endpoint() {
    let (_server, addr, _token) = start_server().await;
    let (daemon, _allocator) = daemon_for(&addr);

    daemon.connect("dev").await.unwrap();

    assert!(matches!(
        daemon.connect("dev").await,
        Err(DaemonError::EndpointAlreadyConnected)
    ));
    assert!(matches!(
        daemon.connect("missing").await,
        Err(DaemonError::EndpointNotConfigured(_))
    ));
    assert!(matches!(
        daemon.connect("forwarded").await,
        Err(DaemonError::NoDirectEndpoint(_))
    ));
}

#[tokio::test]
async fn disconnect_requires_a_connection() {
    let (_server, addr, _token) = start_server().await;
    let (daemon, _allocator) = daemon_for(&addr);

    assert!(matches!(
        daemon.disconnect("dev"),
        Err(DaemonError::EndpointNotConnected)
    ));

    daemon.connect("dev").await.unwrap();
    daemon.disconnect("dev").unwrap();
    assert!(daemon.connected_endpoints().is_empty());
}

#[tokio::test]
async fn start_unknown_bridge_is_bridge_not_found() {
    let (_server, addr, _token) = start_server().await;
    let (daemon, _allocator) = daemon_for(&addr);

    assert!(matches!(
        daemon.start_service("dev", "svc").await,
        Err(DaemonError::EndpointNotConnected)
    ));

    daemon.connect("dev").await.unwrap();

    assert!(matches!(
        daemon.start_service("dev", "svc").await,
        Err(DaemonError::BridgeNotFound)
    ));
}

#[tokio::test]
async fn start_is_exclusive_per_bridge() {
    let (server, addr, _token) = start_server().await;
    let (daemon, _allocator) = daemon_for(&addr);
    daemon.connect("dev").await.unwrap();

    publish_l2c(&server, "svc", free_port().await).await;
    wait_until("bridge known", || known_bridges(&daemon, "dev") == 1).await;

    daemon.start_service("dev", "svc").await.unwrap();
    assert_eq!(daemon.tunnel_count("dev"), 1);

    assert!(matches!(
        daemon.start_service("dev", "svc").await,
        Err(DaemonError::BridgeAlreadyConnected)
    ));

    daemon.stop_service("dev", "svc").unwrap();
    assert_eq!(daemon.tunnel_count("dev"), 0);

    assert!(matches!(
        daemon.stop_service("dev", "svc"),
        Err(DaemonError::BridgeNotFound)
    ));
}

#[tokio::test]
async fn plus_pattern_fans_out_over_matching_bridges() {
    let (server, addr, _token) = start_server().await;
    let (daemon, _allocator) = daemon_for(&addr);
    daemon.connect("dev").await.unwrap();

    publish_l2c(&server, "foo1", free_port().await).await;
    publish_l2c(&server, "foo2", free_port().await).await;
    publish_l2c(&server, "bar", free_port().await).await;
    wait_until("bridges known", || known_bridges(&daemon, "dev") == 3).await;

    daemon.start_service("dev", "foo+").await.unwrap();
    assert_eq!(daemon.tunnel_count("dev"), 2);

    let status = daemon.status();
    let dev = status.iter().find(|s| s.name == "dev").unwrap();
    for bridge in &dev.bridges {
        let expected = if bridge.bridge.name.starts_with("foo") {
            "on"
        } else {
            "off"
        };
        assert_eq!(bridge.status, expected, "bridge {}", bridge.bridge.name);
    }

    daemon.stop_service("dev", "foo+").unwrap();
    assert_eq!(daemon.tunnel_count("dev"), 0);
}

#[tokio::test]
async fn status_reports_disconnected_endpoints_off() {
    let (_server, addr, _token) = start_server().await;
    let (daemon, _allocator) = daemon_for(&addr);

    let status = daemon.status();
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|s| s.status == "off"));

    daemon.connect("dev").await.unwrap();
    let status = daemon.status();
    let dev = status.iter().find(|s| s.name == "dev").unwrap();
    assert_eq!(dev.status, "on");
}

#[tokio::test]
async fn shutdown_returns_every_lease() {
    let (server, addr, _token) = start_server().await;
    let (daemon, allocator) = daemon_for(&addr);
    daemon.connect("dev").await.unwrap();

    publish_l2c(&server, "svc", free_port().await).await;
    wait_until("bridge known", || known_bridges(&daemon, "dev") == 1).await;
    daemon.start_service("dev", "svc").await.unwrap();
    wait_until("lease taken", || !allocator.leased().is_empty()).await;

    daemon.shutdown().await;

    wait_until("leases returned", || allocator.leased().is_empty()).await;
}
