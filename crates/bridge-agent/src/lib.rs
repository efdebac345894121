//! The workstation side of the bridgemux fabric: a control session per
//! server, local IP/DNS leases per bridge, and the daemon that starts and
//! stops tunnels.

pub mod config;
pub mod daemon;
pub mod session;

pub use config::{Config, ConfigError, Endpoint, KubernetesInfo};
pub use daemon::{Daemon, DaemonError};
pub use session::{Session, SessionError, MAX_EVENTS_BACKLOG};
