//! CIDR expansion for the local address pool.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::NetallocError;

/// Expand a CIDR into the pool of leasable host addresses.
///
/// The network and broadcast addresses are excluded, as is any address whose
/// last octet is 0 or 255: those confuse hosts that treat them as gateway or
/// broadcast regardless of mask.
pub fn host_addrs(cidr: &str) -> Result<Vec<Ipv4Addr>, NetallocError> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|_| NetallocError::InvalidCidr(cidr.to_string()))?;

    Ok(net
        .hosts()
        .filter(|addr| {
            let last = addr.octets()[3];
            last != 0 && last != 255
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_30_yields_two_hosts() {
        let addrs = host_addrs("10.0.0.0/30").unwrap();
        assert_eq!(
            addrs,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn slash_24_excludes_network_and_broadcast() {
        let addrs = host_addrs("10.0.0.0/24").unwrap();
        assert_eq!(addrs.len(), 254);
        assert_eq!(addrs[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(addrs[253], Ipv4Addr::new(10, 0, 0, 254));
    }

    #[test]
    fn slash_23_also_drops_inner_zero_and_255_octets() {
        let addrs = host_addrs("10.0.0.0/23").unwrap();
        // 510 hosts minus 10.0.0.255 and 10.0.1.0.
        assert_eq!(addrs.len(), 508);
        assert!(!addrs.contains(&Ipv4Addr::new(10, 0, 0, 255)));
        assert!(!addrs.contains(&Ipv4Addr::new(10, 0, 1, 0)));
        assert_eq!(addrs[254], Ipv4Addr::new(10, 0, 1, 1));
    }

    #[test]
    fn whitespace_is_tolerated() {
        let addrs = host_addrs(" 10.10.10.0/29 ").unwrap();
        assert_eq!(addrs.len(), 6);
    }

    #[test]
    fn malformed_cidr_is_rejected() {
        assert!(matches!(
            host_addrs("10.0.0.0"),
            Err(NetallocError::InvalidCidr(_))
        ));
        assert!(matches!(
            host_addrs("10.0.0.0/40"),
            Err(NetallocError::InvalidCidr(_))
        ));
    }
}
