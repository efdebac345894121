//! Small UDP DNS responder answering A queries for leased bridge names.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::NetallocError;

/// Default listen port for the responder.
pub const DEFAULT_DNS_PORT: u16 = 5353;

const ANSWER_TTL: u32 = 60;
const MAX_DATAGRAM: usize = 4096;

/// name -> address mappings served to local resolvers. Writers are the
/// allocator's lease paths; queries take the read lock only.
#[derive(Default)]
pub struct DnsCache {
    entries: RwLock<HashMap<String, Ipv4Addr>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, addr: Ipv4Addr) {
        self.entries.write().unwrap().insert(name.to_string(), addr);
    }

    pub fn del_name(&self, name: &str) {
        self.entries.write().unwrap().remove(name);
    }

    /// Remove every name resolving to `addr`.
    pub fn del_addr(&self, addr: Ipv4Addr) {
        self.entries.write().unwrap().retain(|_, a| *a != addr);
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn find(&self, name: &str) -> Option<Ipv4Addr> {
        self.entries.read().unwrap().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

/// UDP server answering A/AAAA-class lookups from the cache. Unknown names
/// get an empty answer section rather than an error, so resolvers fall
/// through to their next upstream.
pub struct DnsServer {
    cache: Arc<DnsCache>,
    port: u16,
}

impl DnsServer {
    pub fn new(cache: Arc<DnsCache>, port: u16) -> Self {
        Self { cache, port }
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), NetallocError> {
        let socket = UdpSocket::bind(("127.0.0.1", self.port)).await?;
        tracing::info!(port = self.port, "dns responder listening");

        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("dns responder stopped");
                    return Ok(());
                }
                recv = socket.recv_from(&mut buf) => recv?,
            };

            match answer(&self.cache, &buf[..len]) {
                Some(reply) => {
                    if let Err(err) = socket.send_to(&reply, peer).await {
                        tracing::warn!(%peer, err = %err, "error sending dns reply");
                    }
                }
                None => tracing::debug!(%peer, "ignoring undecodable dns datagram"),
            }
        }
    }
}

/// Build the reply for one request datagram. Returns None when the datagram
/// is not a DNS message we can parse.
fn answer(cache: &DnsCache, datagram: &[u8]) -> Option<Vec<u8>> {
    let request = Message::from_bytes(datagram).ok()?;

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());

    for query in request.queries() {
        response.add_query(query.clone());

        if query.query_type() != RecordType::A {
            continue;
        }

        let name = query.name().to_utf8();
        let lookup = name.trim_end_matches('.');

        if let Some(addr) = cache.find(lookup) {
            tracing::debug!(name = lookup, %addr, "dns answer");
            response.add_answer(Record::from_rdata(
                query.name().clone(),
                ANSWER_TTL,
                RData::A(A::from(addr)),
            ));
        }
    }

    response.to_bytes().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::Name;

    fn a_query(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_utf8(name).unwrap(), RecordType::A));
        msg.to_bytes().unwrap()
    }

    #[test]
    fn answers_known_names() {
        let cache = DnsCache::new();
        cache.add("db.team", Ipv4Addr::new(10, 10, 10, 3));

        let reply = answer(&cache, &a_query("db.team.")).unwrap();
        let reply = Message::from_bytes(&reply).unwrap();

        assert_eq!(reply.id(), 7);
        assert_eq!(reply.answers().len(), 1);
        match reply.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(Ipv4Addr::from(a.0), Ipv4Addr::new(10, 10, 10, 3)),
            other => panic!("expected A record, got {other:?}"),
        }
    }

    #[test]
    fn unknown_names_get_empty_answer() {
        let cache = DnsCache::new();

        let reply = answer(&cache, &a_query("missing.svc.")).unwrap();
        let reply = Message::from_bytes(&reply).unwrap();

        assert!(reply.answers().is_empty());
        assert_eq!(reply.queries().len(), 1);
    }

    #[test]
    fn noise_is_ignored() {
        let cache = DnsCache::new();
        assert!(answer(&cache, b"\x01\x02not-dns").is_none());
    }

    #[test]
    fn del_addr_drops_every_alias_of_the_address() {
        let cache = DnsCache::new();
        let addr = Ipv4Addr::new(10, 10, 10, 4);
        cache.add("a.svc", addr);
        cache.add("b.svc", addr);
        cache.add("c.svc", Ipv4Addr::new(10, 10, 10, 5));

        cache.del_addr(addr);

        assert!(cache.find("a.svc").is_none());
        assert!(cache.find("b.svc").is_none());
        assert!(cache.find("c.svc").is_some());
    }
}
