//! The free/allocated address pool behind every lease.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;

use crate::shell::Shell;
use crate::{cidr, NetallocError};

struct PoolState {
    free: VecDeque<Ipv4Addr>,
    allocated: Vec<Ipv4Addr>,
}

/// Hands out addresses from a CIDR-derived pool, binding each to an
/// interface alias for as long as the lease lasts.
pub struct IpPool {
    shell: Arc<dyn Shell>,
    iface: String,
    state: Mutex<PoolState>,
}

impl IpPool {
    pub fn new(iface: &str, cidr: &str, shell: Arc<dyn Shell>) -> Result<Self, NetallocError> {
        let free: VecDeque<Ipv4Addr> = cidr::host_addrs(cidr)?.into();

        Ok(Self {
            shell,
            iface: iface.to_string(),
            state: Mutex::new(PoolState {
                free,
                allocated: Vec::new(),
            }),
        })
    }

    /// Take the head of the free pool and alias it onto the interface. If the
    /// alias cannot be created the address goes straight back to the pool.
    pub async fn allocate(&self) -> Result<Ipv4Addr, NetallocError> {
        let addr = {
            let mut state = self.state.lock().unwrap();
            let addr = state.free.pop_front().ok_or(NetallocError::NoFreeAddresses)?;
            state.allocated.push(addr);
            addr
        };

        if let Err(err) = self.shell.add_alias(&self.iface, addr).await {
            let mut state = self.state.lock().unwrap();
            state.allocated.retain(|a| *a != addr);
            state.free.push_back(addr);

            return Err(NetallocError::Alias { addr, source: err });
        }

        Ok(addr)
    }

    /// Drop the alias and return the address to the free pool. Releasing an
    /// address that is not leased is a no-op, so teardown paths may overlap.
    pub async fn release(&self, addr: Ipv4Addr) -> Result<(), NetallocError> {
        {
            let state = self.state.lock().unwrap();
            if !state.allocated.contains(&addr) {
                return Ok(());
            }
        }

        self.shell
            .remove_alias(&self.iface, addr)
            .await
            .map_err(|err| NetallocError::Alias { addr, source: err })?;

        let mut state = self.state.lock().unwrap();
        if state.allocated.contains(&addr) {
            state.allocated.retain(|a| *a != addr);
            state.free.push_back(addr);
        }

        Ok(())
    }

    /// Addresses currently leased out.
    pub fn allocated(&self) -> Vec<Ipv4Addr> {
        self.state.lock().unwrap().allocated.clone()
    }

    pub fn free_len(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }
}
