//! DNS query resolution core.
//!
//! Decides each query's outcome: sinkholed for blacklisted domains, served
//! from the cache when fresh, otherwise forwarded to an upstream server.
//! With a cache attached, upstream selection rotates round-robin through
//! the registry; without one, servers are tried in registry order. Either
//! way every server is attempted once before the query fails.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::cache::ResolveCache;
use crate::dns::{self, MAX_PACKET_SIZE, QTYPE_A, QTYPE_AAAA};
use crate::error::{ProxyError, UpstreamError};
use crate::filter::Blacklist;
use crate::registry::{Registry, UpstreamServer};
use crate::stats::Stats;

/// IPv4 answer substituted for blocked domains.
pub const SINKHOLE_IPV4: &str = "0.0.0.0";
/// IPv6 answer substituted for blocked domains.
pub const SINKHOLE_IPV6: &str = "::";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves domains against upstream servers, consulting the blacklist and
/// cache first.
///
/// One instance serves all concurrent queries; the round-robin cursor and
/// outcome counters are shared across them.
pub struct Resolver {
    registry: Arc<Registry>,
    blacklist: Arc<Blacklist>,
    cache: Option<Arc<ResolveCache>>,
    timeout: Duration,
    round_robin: bool,
    cursor: AtomicU32,
    next_id: AtomicU16,
    stats: Stats,
}

impl Resolver {
    /// Resolver without a cache; servers are tried in registry order.
    pub fn new(registry: Arc<Registry>, blacklist: Arc<Blacklist>) -> Self {
        Self {
            registry,
            blacklist,
            cache: None,
            timeout: DEFAULT_TIMEOUT,
            round_robin: false,
            cursor: AtomicU32::new(0),
            next_id: AtomicU16::new(0),
            stats: Stats::new(),
        }
    }

    /// Resolver with a cache; upstream selection rotates round-robin.
    pub fn with_cache(
        registry: Arc<Registry>,
        blacklist: Arc<Blacklist>,
        cache: Arc<ResolveCache>,
    ) -> Self {
        Self {
            cache: Some(cache),
            round_robin: true,
            ..Self::new(registry, blacklist)
        }
    }

    /// Override the per-server query timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of live cache entries, 0 without a cache.
    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    /// Resolve a domain to its addresses.
    ///
    /// Blocked domains answer with the sinkhole addresses; that is a
    /// successful outcome, not an error.
    pub async fn resolve(&self, domain: &str) -> Result<Vec<String>, ProxyError> {
        if domain.is_empty() {
            return Err(ProxyError::InvalidArgument("domain cannot be empty".into()));
        }

        let start = Instant::now();

        if self.blacklist.is_blocked(domain) {
            debug!(domain, "blocked");
            self.stats.record_blocked(elapsed_ms(start));
            return Ok(vec![SINKHOLE_IPV4.to_owned(), SINKHOLE_IPV6.to_owned()]);
        }

        if let Some(cache) = &self.cache {
            if let Some(addresses) = cache.get(domain) {
                debug!(domain, "cache hit");
                self.stats.record_cache_hit(elapsed_ms(start));
                return Ok(addresses);
            }
        }

        let servers = self.registry.all();
        if servers.is_empty() {
            self.stats.record_failed(elapsed_ms(start));
            return Err(ProxyError::NoUpstreamAvailable);
        }

        let result = if self.round_robin {
            self.forward_round_robin(domain, &servers).await
        } else {
            self.forward_in_order(domain, &servers).await
        };

        match result {
            Ok(addresses) => {
                if let Some(cache) = &self.cache {
                    if !addresses.is_empty() {
                        cache.set(domain, addresses.clone());
                    }
                }
                self.stats.record_forwarded(elapsed_ms(start));
                Ok(addresses)
            }
            Err(err) => {
                self.stats.record_failed(elapsed_ms(start));
                Err(err)
            }
        }
    }

    /// Try every server once, starting from a rotating cursor position so
    /// consecutive queries spread across the pool.
    async fn forward_round_robin(
        &self,
        domain: &str,
        servers: &[UpstreamServer],
    ) -> Result<Vec<String>, ProxyError> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % servers.len();

        let mut last_err = None;
        for offset in 0..servers.len() {
            let server = &servers[(start + offset) % servers.len()];
            match self.query_server(domain, server).await {
                Ok(addresses) => return Ok(addresses),
                Err(err) => {
                    debug!(domain, server = server.name(), error = %err, "upstream attempt failed");
                    last_err = Some(UpstreamError {
                        server: server.name().to_owned(),
                        source: err,
                    });
                }
            }
        }

        Err(exhausted(last_err))
    }

    /// Try servers in snapshot order, first success wins.
    async fn forward_in_order(
        &self,
        domain: &str,
        servers: &[UpstreamServer],
    ) -> Result<Vec<String>, ProxyError> {
        let mut last_err = None;
        for server in servers {
            match self.query_server(domain, server).await {
                Ok(addresses) => return Ok(addresses),
                Err(err) => {
                    debug!(domain, server = server.name(), error = %err, "upstream attempt failed");
                    last_err = Some(UpstreamError {
                        server: server.name().to_owned(),
                        source: err,
                    });
                }
            }
        }

        Err(exhausted(last_err))
    }

    /// One bounded exchange with a single server: A and AAAA queried
    /// concurrently, the whole attempt capped by the configured timeout.
    async fn query_server(
        &self,
        domain: &str,
        server: &UpstreamServer,
    ) -> io::Result<Vec<String>> {
        let target: SocketAddr = server.address().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad upstream address {:?}", server.address()),
            )
        })?;

        let id_a = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id_aaaa = self.next_id.fetch_add(1, Ordering::Relaxed);

        let exchanges = futures::future::join(
            exchange(target, domain, QTYPE_A, id_a),
            exchange(target, domain, QTYPE_AAAA, id_aaaa),
        );
        let (v4, v6) = tokio::time::timeout(self.timeout, exchanges)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no reply from {target} within {:?}", self.timeout),
                )
            })?;

        match (v4, v6) {
            (Err(err), Err(_)) => Err(err),
            // One failed record type does not sink the attempt as long as
            // the other answered.
            (v4, v6) => {
                let mut addresses = Vec::new();
                for result in [v4, v6] {
                    if let Ok(found) = result {
                        addresses.extend(found.into_iter().map(|ip| ip.to_string()));
                    }
                }
                Ok(addresses)
            }
        }
    }
}

fn exhausted(last_err: Option<UpstreamError>) -> ProxyError {
    match last_err {
        Some(err) => ProxyError::UpstreamExhausted(err),
        // Unreachable when callers pass a non-empty snapshot.
        None => ProxyError::NoUpstreamAvailable,
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Send one query over a fresh socket and wait for the matching response.
async fn exchange(
    target: SocketAddr,
    domain: &str,
    qtype: u16,
    id: u16,
) -> io::Result<Vec<IpAddr>> {
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    socket.send(&dns::encode_query(id, domain, qtype)).await?;

    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        let len = socket.recv(&mut buf).await?;
        let Some(summary) = dns::parse_response(&buf[..len]) else {
            continue;
        };
        // Stray datagrams with a foreign id keep the wait going.
        if summary.id != id {
            continue;
        }
        if summary.rcode != 0 {
            return Err(io::Error::other(format!(
                "{domain}: upstream answered rcode {}",
                summary.rcode
            )));
        }
        return Ok(summary.addresses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsQuery, DnsResponse};

    const TEST_TIMEOUT: Duration = Duration::from_millis(300);

    /// Upstream that answers A queries with the given addresses and AAAA
    /// queries with an empty answer.
    async fn fake_upstream(v4: Vec<Ipv4Addr>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Some(query) = DnsQuery::parse(&buf[..len]) else {
                    continue;
                };
                let addresses: Vec<IpAddr> = if query.qtype == QTYPE_A {
                    v4.iter().copied().map(IpAddr::V4).collect()
                } else {
                    Vec::new()
                };
                let reply = DnsResponse::answer(&query, &addresses).to_bytes();
                let _ = socket.send_to(&reply, src).await;
            }
        });

        addr
    }

    /// Upstream that swallows every query, forcing timeouts.
    async fn dead_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            while socket.recv_from(&mut buf).await.is_ok() {}
        });

        addr
    }

    fn register(registry: &Registry, name: &str, addr: SocketAddr) {
        let server =
            UpstreamServer::new(name, addr.ip().to_string(), None, addr.port()).unwrap();
        registry.add(server).unwrap();
    }

    fn parts() -> (Arc<Registry>, Arc<Blacklist>) {
        (Arc::new(Registry::new()), Arc::new(Blacklist::new()))
    }

    #[tokio::test]
    async fn empty_domain_is_rejected() {
        let (registry, blacklist) = parts();
        let resolver = Resolver::new(registry, blacklist);

        let err = resolver.resolve("").await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn blocked_domain_answers_sinkhole() {
        let (registry, blacklist) = parts();
        blacklist.add("ads.example.com").unwrap();
        let resolver = Resolver::new(registry, blacklist);

        let addresses = resolver.resolve("ads.example.com").await.unwrap();
        assert_eq!(addresses, [SINKHOLE_IPV4, SINKHOLE_IPV6]);
    }

    #[tokio::test]
    async fn blocking_is_case_insensitive() {
        let (registry, blacklist) = parts();
        blacklist.add("blocked.com").unwrap();
        let resolver = Resolver::new(registry, blacklist);

        for domain in ["blocked.com", "BLOCKED.COM", "bLoCkEd.CoM"] {
            let addresses = resolver.resolve(domain).await.unwrap();
            assert_eq!(addresses, [SINKHOLE_IPV4, SINKHOLE_IPV6]);
        }
    }

    #[tokio::test]
    async fn wildcard_blocks_subdomain_and_base() {
        let (registry, blacklist) = parts();
        blacklist.add("*.ads.com").unwrap();
        register(&registry, "live", fake_upstream(vec![Ipv4Addr::new(5, 6, 7, 8)]).await);
        let resolver = Resolver::new(registry, blacklist).timeout(TEST_TIMEOUT);

        let blocked = resolver.resolve("tracker.ads.com").await.unwrap();
        assert_eq!(blocked, [SINKHOLE_IPV4, SINKHOLE_IPV6]);

        let base = resolver.resolve("ads.com").await.unwrap();
        assert_eq!(base, [SINKHOLE_IPV4, SINKHOLE_IPV6]);

        // Similar-looking names fall through to normal resolution.
        let through = resolver.resolve("notads.com").await.unwrap();
        assert_eq!(through, ["5.6.7.8"]);
    }

    #[tokio::test]
    async fn empty_registry_fails() {
        let (registry, blacklist) = parts();
        let resolver = Resolver::new(registry, blacklist);

        let err = resolver.resolve("example.com").await.unwrap_err();
        assert!(matches!(err, ProxyError::NoUpstreamAvailable));
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_upstreams() {
        let (registry, blacklist) = parts();
        let cache = Arc::new(ResolveCache::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        cache.set("hit.example.com", vec!["10.0.0.1".to_owned()]);

        // No upstreams registered at all: only the cache can answer.
        let resolver = Resolver::with_cache(registry, blacklist, cache);

        let addresses = resolver.resolve("hit.example.com").await.unwrap();
        assert_eq!(addresses, ["10.0.0.1"]);
    }

    #[tokio::test]
    async fn resolves_and_populates_cache() {
        let (registry, blacklist) = parts();
        register(
            &registry,
            "live",
            fake_upstream(vec![Ipv4Addr::new(93, 184, 216, 34)]).await,
        );
        let cache = Arc::new(ResolveCache::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        let resolver = Resolver::with_cache(registry, blacklist, cache.clone())
            .timeout(TEST_TIMEOUT);

        let addresses = resolver.resolve("example.com").await.unwrap();
        assert_eq!(addresses, ["93.184.216.34"]);
        assert_eq!(cache.get("example.com"), Some(addresses));
    }

    #[tokio::test]
    async fn empty_result_is_not_cached() {
        let (registry, blacklist) = parts();
        register(&registry, "empty", fake_upstream(Vec::new()).await);
        let cache = Arc::new(ResolveCache::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        let resolver = Resolver::with_cache(registry, blacklist, cache.clone())
            .timeout(TEST_TIMEOUT);

        let addresses = resolver.resolve("nowhere.example.com").await.unwrap();
        assert!(addresses.is_empty());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn failover_reaches_the_live_server() {
        let (registry, blacklist) = parts();
        register(&registry, "dead", dead_upstream().await);
        register(
            &registry,
            "live",
            fake_upstream(vec![Ipv4Addr::new(1, 2, 3, 4)]).await,
        );
        let resolver = Resolver::new(registry, blacklist).timeout(TEST_TIMEOUT);

        let addresses = resolver.resolve("example.com").await.unwrap();
        assert_eq!(addresses, ["1.2.3.4"]);
    }

    #[tokio::test]
    async fn all_servers_failing_exhausts_upstreams() {
        let (registry, blacklist) = parts();
        register(&registry, "dead-a", dead_upstream().await);
        register(&registry, "dead-b", dead_upstream().await);
        let resolver =
            Resolver::new(registry, blacklist).timeout(Duration::from_millis(100));

        let err = resolver.resolve("example.com").await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamExhausted(_)));
    }

    #[tokio::test]
    async fn round_robin_rotates_first_server() {
        let (registry, blacklist) = parts();
        register(
            &registry,
            "first",
            fake_upstream(vec![Ipv4Addr::new(10, 0, 0, 1)]).await,
        );
        register(
            &registry,
            "second",
            fake_upstream(vec![Ipv4Addr::new(10, 0, 0, 2)]).await,
        );
        let cache = Arc::new(ResolveCache::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        let resolver = Resolver::with_cache(registry, blacklist, cache).timeout(TEST_TIMEOUT);

        // Fresh domains each time so the cache never short-circuits; both
        // servers answer, so the answer identifies the first one attempted.
        let mut first_answers = Vec::new();
        for i in 0..4 {
            let addresses = resolver.resolve(&format!("host{i}.example.com")).await.unwrap();
            first_answers.push(addresses[0].clone());
        }

        assert_ne!(first_answers[0], first_answers[1]);
        assert_eq!(first_answers[0], first_answers[2]);
        assert_eq!(first_answers[1], first_answers[3]);
    }
}
