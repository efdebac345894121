//! Local network allocation for the agent: one loopback-aliased IPv4 address
//! and a set of DNS names per running bridge.

pub mod cidr;
pub mod dns;
pub mod ipalloc;
pub mod shell;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use dns::{DnsCache, DnsServer, DEFAULT_DNS_PORT};
pub use ipalloc::IpPool;
pub use shell::{NoopShell, PlatformShell, Shell};

#[derive(Debug, Error)]
pub enum NetallocError {
    #[error("cidr {0:?} is not in the form A.B.C.D/LEN")]
    InvalidCidr(String),

    #[error("no more free addresses")]
    NoFreeAddresses,

    #[error("error managing alias for {addr}: {source}")]
    Alias {
        addr: Ipv4Addr,
        source: std::io::Error,
    },

    #[error("{0:?} is not an IPv4 address")]
    InvalidAddress(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability the agent needs from its address allocator: lease an address
/// bound to some DNS names, and give it back later.
#[async_trait]
pub trait IpAllocator: Send + Sync {
    async fn get_ip(&self, names: &[String]) -> Result<String, NetallocError>;
    async fn release_ip(&self, addr: &str) -> Result<(), NetallocError>;
}

/// Couples the IP pool with the DNS cache so a lease and its names always
/// move together. allocate/release/cleanup are serialized.
pub struct NetworkAllocator {
    gate: tokio::sync::Mutex<()>,
    pool: IpPool,
    dns: Arc<DnsCache>,
}

impl NetworkAllocator {
    pub fn new(iface: &str, cidr: &str, shell: Arc<dyn Shell>) -> Result<Self, NetallocError> {
        tracing::debug!(iface, cidr, "creating network allocator");

        Ok(Self {
            gate: tokio::sync::Mutex::new(()),
            pool: IpPool::new(iface, cidr, shell)?,
            dns: Arc::new(DnsCache::new()),
        })
    }

    /// Spawn the DNS responder feeding off this allocator's cache. It lives
    /// until `token` is cancelled.
    pub fn spawn_dns(&self, port: u16, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let server = DnsServer::new(self.dns.clone(), port);
        tokio::spawn(async move {
            if let Err(err) = server.run(token).await {
                tracing::warn!(err = %err, "dns responder ended");
            }
        })
    }

    /// Lease the next free address and point every name at it. Names are
    /// scrubbed from the cache first so a stale entry never outlives its
    /// previous lease.
    pub async fn allocate(&self, names: &[String]) -> Result<Ipv4Addr, NetallocError> {
        let _gate = self.gate.lock().await;

        for name in names {
            self.dns.del_name(name);
        }

        let addr = self.pool.allocate().await?;

        for name in names {
            self.dns.add(name, addr);
        }

        Ok(addr)
    }

    /// Return the lease: alias removed, address back in the pool, every DNS
    /// entry for it gone.
    pub async fn release(&self, addr: Ipv4Addr) -> Result<(), NetallocError> {
        let _gate = self.gate.lock().await;

        tracing::debug!(%addr, "releasing address");
        self.dns.del_addr(addr);
        self.pool.release(addr).await
    }

    /// Best-effort release of every current lease. Failures are logged and
    /// do not stop the sweep.
    pub async fn cleanup(&self) {
        let _gate = self.gate.lock().await;

        for addr in self.pool.allocated() {
            self.dns.del_addr(addr);
            if let Err(err) = self.pool.release(addr).await {
                tracing::warn!(%addr, err = %err, "error releasing address during cleanup");
            }
        }

        self.dns.clear();
    }

    pub fn dns_cache(&self) -> Arc<DnsCache> {
        self.dns.clone()
    }

    pub fn leased(&self) -> Vec<Ipv4Addr> {
        self.pool.allocated()
    }

    pub fn free_len(&self) -> usize {
        self.pool.free_len()
    }
}

#[async_trait]
impl IpAllocator for NetworkAllocator {
    async fn get_ip(&self, names: &[String]) -> Result<String, NetallocError> {
        Ok(self.allocate(names).await?.to_string())
    }

    async fn release_ip(&self, addr: &str) -> Result<(), NetallocError> {
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetallocError::InvalidAddress(addr.to_string()))?;
        self.release(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(cidr: &str) -> NetworkAllocator {
        NetworkAllocator::new("lo", cidr, Arc::new(NoopShell)).unwrap()
    }

    #[tokio::test]
    async fn lease_binds_names_to_the_address() {
        let alloc = allocator("10.0.0.0/30");

        let addr = alloc
            .allocate(&["svc.ns".to_string(), "svc".to_string()])
            .await
            .unwrap();

        assert_eq!(alloc.dns_cache().find("svc.ns"), Some(addr));
        assert_eq!(alloc.dns_cache().find("svc"), Some(addr));
    }

    #[tokio::test]
    async fn release_removes_alias_names_and_refills_pool() {
        let alloc = allocator("10.0.0.0/30");

        let addr = alloc.allocate(&["svc.ns".to_string()]).await.unwrap();
        assert_eq!(alloc.free_len(), 1);

        alloc.release(addr).await.unwrap();

        assert_eq!(alloc.free_len(), 2);
        assert!(alloc.dns_cache().find("svc.ns").is_none());
        assert!(alloc.leased().is_empty());
    }

    #[tokio::test]
    async fn exhausted_pool_reports_no_free_addresses() {
        // /32 expands to exactly one leasable address.
        let alloc = Arc::new(allocator("10.99.0.1/32"));

        let first = alloc.allocate(&[]).await;
        let second = alloc.allocate(&[]).await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(NetallocError::NoFreeAddresses)));
    }

    #[tokio::test]
    async fn concurrent_allocations_get_distinct_addresses() {
        let alloc = Arc::new(allocator("10.0.0.0/30"));

        let a = {
            let alloc = alloc.clone();
            tokio::spawn(async move { alloc.allocate(&[]).await })
        };
        let b = {
            let alloc = alloc.clone();
            tokio::spawn(async move { alloc.allocate(&[]).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_ne!(a, b);
        assert_eq!(alloc.free_len(), 0);
    }

    #[tokio::test]
    async fn cleanup_restores_initial_pool_membership() {
        let alloc = allocator("10.0.0.0/29");

        alloc.allocate(&["a".to_string()]).await.unwrap();
        alloc.allocate(&["b".to_string()]).await.unwrap();
        assert_eq!(alloc.free_len(), 4);

        alloc.cleanup().await;

        assert_eq!(alloc.free_len(), 6);
        assert!(alloc.leased().is_empty());
        assert!(alloc.dns_cache().is_empty());
    }

    #[tokio::test]
    async fn get_ip_round_trips_through_strings() {
        let alloc = allocator("10.0.0.0/30");

        let addr = alloc.get_ip(&["svc".to_string()]).await.unwrap();
        assert_eq!(addr, "10.0.0.1");

        alloc.release_ip(&addr).await.unwrap();
        assert!(alloc.release_ip("not-an-ip").await.is_err());
    }
}
