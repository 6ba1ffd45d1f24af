//! Inbound UDP server.
//!
//! Receives DNS queries from clients, hands each domain to the resolver and
//! writes back the answers matching the query's record type. The wire
//! protocol stops here; everything behind it works on plain domain strings
//! and address lists.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::dns::{DnsQuery, DnsResponse, MAX_PACKET_SIZE, QTYPE_A, QTYPE_AAAA};
use crate::resolver::Resolver;

/// UDP front end for the proxy.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start serving; spawns one task per inbound query.
    pub fn start(self, resolver: Arc<Resolver>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver))
    }
}

async fn run(socket: Arc<UdpSocket>, resolver: Arc<Resolver>) {
    let mut buf = [0u8; MAX_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "udp recv failed");
                continue;
            }
        };

        let Some(query) = DnsQuery::parse(&buf[..len]) else {
            continue;
        };

        let socket = socket.clone();
        let resolver = resolver.clone();
        tokio::spawn(async move {
            let reply = answer_query(&resolver, &query).await;
            if let Err(e) = socket.send_to(&reply, src).await {
                warn!(error = %e, "udp send failed");
            }
        });
    }
}

async fn answer_query(resolver: &Resolver, query: &DnsQuery) -> Vec<u8> {
    let domain = query.domain.strip_suffix('.').unwrap_or(&query.domain);

    let addresses = match resolver.resolve(domain).await {
        Ok(addresses) => addresses,
        Err(err) => {
            debug!(domain, error = %err, "resolution failed");
            // Failed queries answer empty, not with a protocol error.
            Vec::new()
        }
    };

    let answers = select_answers(query.qtype, &addresses);
    DnsResponse::answer(query, &answers).to_bytes()
}

/// Keep only the addresses answering the requested record type.
fn select_answers(qtype: u16, addresses: &[String]) -> Vec<IpAddr> {
    addresses
        .iter()
        .filter_map(|s| s.parse::<IpAddr>().ok())
        .filter(|ip| match qtype {
            QTYPE_A => ip.is_ipv4(),
            QTYPE_AAAA => ip.is_ipv6(),
            _ => false,
        })
        .collect()
}
