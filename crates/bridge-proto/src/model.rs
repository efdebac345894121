//! Bridge descriptions and the events that carry them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who initiates connections on a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Local-to-container: connections originate on the workstation.
    #[default]
    L2C,
    /// Container-to-local: connections originate inside the cluster.
    C2L,
}

/// Transport family of a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Tcp => f.write_str("tcp"),
            Family::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidBridge {
    #[error("invalid name")]
    Name,
    #[error("invalid local address")]
    LocalAddr,
    #[error("invalid local port")]
    LocalPort,
    #[error("invalid container address")]
    ContainerAddr,
    #[error("invalid container port")]
    ContainerPort,
}

/// Immutable description of one logical tunnel. Identity is `name`; bridges
/// are replaced wholesale on update, never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bridge {
    pub namespace: String,
    pub name: String,
    pub local_addr: String,
    pub local_port: String,
    pub container_addr: String,
    pub container_port: String,
    pub direction: Direction,
    pub family: Family,
}

impl Bridge {
    /// `localAddr:localPort`, the workstation-side endpoint.
    pub fn full_local_addr(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    /// `containerAddr:containerPort`, the cluster-side endpoint.
    pub fn full_container_addr(&self) -> String {
        format!("{}:{}", self.container_addr, self.container_port)
    }

    /// DNS name for the bridge: `name.namespace`, or just `name` when the
    /// bridge carries no namespace.
    pub fn local_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.namespace)
        }
    }

    /// A usable bridge has a name and all four address/port fields set.
    /// Direction and family are enforced by their types.
    pub fn validate(&self) -> Result<(), InvalidBridge> {
        if self.name.is_empty() {
            return Err(InvalidBridge::Name);
        }
        if self.local_addr.is_empty() {
            return Err(InvalidBridge::LocalAddr);
        }
        if self.local_port.is_empty() {
            return Err(InvalidBridge::LocalPort);
        }
        if self.container_addr.is_empty() {
            return Err(InvalidBridge::ContainerAddr);
        }
        if self.container_port.is_empty() {
            return Err(InvalidBridge::ContainerPort);
        }

        Ok(())
    }
}

impl std::fmt::Display for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} {}=>{} {:?}",
            self.name,
            self.family,
            self.full_local_addr(),
            self.full_container_addr(),
            self.direction,
        )
    }
}

/// Bridge lifecycle event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "bridge-add")]
    BridgeAdd,
    #[serde(rename = "bridge-del")]
    BridgeDel,
    #[serde(rename = "bridge-up")]
    BridgeUp,
}

/// One bridge lifecycle change, broadcast from server to every agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub evt_name: EventName,
    pub bridge: Bridge,
}

// ---------------------------------------------------------------------------
// Framed request payloads.

/// Opens one L2C data connection: the server dials `endpoint` and pumps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyRequest {
    pub name: String,
    pub family: Family,
    pub endpoint: String,
}

/// Asks the server to open a cluster-side listener for a C2L bridge.
/// `endpoint` is the cluster address whose port the server binds; `local_addr`
/// is where the agent will deliver paired connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RevProxyListenRequest {
    pub name: String,
    pub family: Family,
    pub endpoint: String,
    pub local_addr: String,
}

/// Identifies a parked cluster-side connection. Sent server→agent as a work
/// notification and agent→server to claim the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RevProxyWork {
    pub id: String,
}
