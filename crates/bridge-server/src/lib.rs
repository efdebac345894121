//! The in-cluster bridgemux server: accepts agent connections, brokers
//! forward and reverse tunnels, and broadcasts bridge events.

pub mod metrics_server;
pub mod probe;
pub mod server;

pub use server::{Server, ServerError};

/// Listen addresses may come in the bare `:port` form; bind them on all
/// interfaces.
pub fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}
