//! Interface alias manipulation through the platform shell.
//!
//! Adding and removing loopback aliases is the one OS side-effect the
//! allocator performs. It lives behind a trait so tests (and platforms
//! without the tooling) can substitute their own.

use std::io;
use std::net::Ipv4Addr;
use std::process::Stdio;

use async_trait::async_trait;

#[async_trait]
pub trait Shell: Send + Sync {
    async fn add_alias(&self, iface: &str, addr: Ipv4Addr) -> io::Result<()>;
    async fn remove_alias(&self, iface: &str, addr: Ipv4Addr) -> io::Result<()>;
}

/// Shells out to `ip` on Linux and `ifconfig` on macOS.
pub struct PlatformShell;

impl PlatformShell {
    fn add_cmdline(iface: &str, addr: Ipv4Addr) -> String {
        if cfg!(target_os = "macos") {
            format!("ifconfig {iface} alias {addr} 255.255.255.0")
        } else {
            format!("ip addr add {addr} dev {iface}")
        }
    }

    fn remove_cmdline(iface: &str, addr: Ipv4Addr) -> String {
        if cfg!(target_os = "macos") {
            format!("ifconfig {iface} -alias {addr}")
        } else {
            format!("ip addr del {addr} dev {iface}")
        }
    }
}

async fn run_sh(cmdline: &str) -> io::Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmdline)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("`{cmdline}` failed: {}", stderr.trim()),
        ));
    }

    Ok(())
}

#[async_trait]
impl Shell for PlatformShell {
    async fn add_alias(&self, iface: &str, addr: Ipv4Addr) -> io::Result<()> {
        let cmdline = Self::add_cmdline(iface, addr);
        tracing::debug!(%cmdline, "adding interface alias");
        run_sh(&cmdline).await
    }

    async fn remove_alias(&self, iface: &str, addr: Ipv4Addr) -> io::Result<()> {
        let cmdline = Self::remove_cmdline(iface, addr);
        tracing::debug!(%cmdline, "removing interface alias");
        run_sh(&cmdline).await
    }
}

/// Performs no OS changes. Used by tests and the loopback-only setups where
/// every pool address already routes locally.
pub struct NoopShell;

#[async_trait]
impl Shell for NoopShell {
    async fn add_alias(&self, _iface: &str, _addr: Ipv4Addr) -> io::Result<()> {
        Ok(())
    }

    async fn remove_alias(&self, _iface: &str, _addr: Ipv4Addr) -> io::Result<()> {
        Ok(())
    }
}
