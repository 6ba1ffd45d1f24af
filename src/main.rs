use clap::Parser;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waypoint::cache::ResolveCache;
use waypoint::error::ProxyError;
use waypoint::filter::{Blacklist, hosts};
use waypoint::registry::{Registry, UpstreamServer};
use waypoint::resolver::Resolver;
use waypoint::server::UdpServer;

/// Built-in rules used when no external blacklist can be loaded.
const FALLBACK_RULES: [&str; 4] = [
    "*.doubleclick.net",
    "*.googlesyndication.com",
    "*.googleadservices.com",
    "*.google-analytics.com",
];

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Caching and filtering DNS forwarding proxy", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "5353")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Upstream DNS server as ip[:port], repeatable.
    /// Defaults to Cloudflare, Google and Quad9.
    #[arg(short, long = "upstream")]
    upstreams: Vec<String>,

    /// URL of a hosts-format blacklist to download at startup
    #[arg(long)]
    blacklist_url: Option<String>,

    /// Path of a hosts-format blacklist file
    #[arg(long)]
    blacklist_file: Option<PathBuf>,

    /// Extra blacklist rule (exact domain or *.wildcard), repeatable
    #[arg(long = "block")]
    blocked: Vec<String>,

    /// Cache TTL in seconds
    #[arg(long, default_value = "7200")]
    cache_ttl: u64,

    /// Cache sweep interval in seconds
    #[arg(long, default_value = "300")]
    cache_sweep: u64,

    /// Per-server upstream query timeout in seconds
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Disable the cache; upstreams are then tried in registry order
    /// instead of round-robin
    #[arg(long)]
    no_cache: bool,
}

fn build_registry(upstreams: &[String]) -> Result<Registry, ProxyError> {
    let registry = Registry::new();

    if upstreams.is_empty() {
        registry.add(UpstreamServer::new(
            "Cloudflare",
            "1.1.1.1",
            Some("2606:4700:4700::1111".into()),
            53,
        )?)?;
        registry.add(UpstreamServer::new(
            "Google",
            "8.8.8.8",
            Some("2001:4860:4860::8888".into()),
            53,
        )?)?;
        registry.add(UpstreamServer::new(
            "Quad9",
            "9.9.9.9",
            Some("2620:fe::fe".into()),
            53,
        )?)?;
        return Ok(registry);
    }

    for entry in upstreams {
        let (ip, port) = match entry.rsplit_once(':') {
            Some((ip, port)) => {
                let port = port.parse().map_err(|_| {
                    ProxyError::InvalidArgument(format!("bad upstream port in {entry:?}"))
                })?;
                (ip, port)
            }
            None => (entry.as_str(), 53),
        };
        registry.add(UpstreamServer::new(entry.clone(), ip, None, port)?)?;
    }

    Ok(registry)
}

async fn load_blacklist(args: &Args) -> Blacklist {
    let blacklist = Blacklist::new();

    if let Some(url) = &args.blacklist_url {
        match hosts::load_from_url(&blacklist, url).await {
            Ok(added) => info!(added, url = %url, "loaded blacklist"),
            Err(e) => {
                warn!(error = %e, url = %url, "could not load blacklist, using built-in rules");
                for rule in FALLBACK_RULES {
                    let _ = blacklist.add(rule);
                }
            }
        }
    }

    if let Some(path) = &args.blacklist_file {
        match hosts::load_from_file(&blacklist, path) {
            Ok(added) => info!(added, path = %path.display(), "loaded blacklist file"),
            Err(e) => warn!(error = %e, path = %path.display(), "could not load blacklist file"),
        }
    }

    for rule in &args.blocked {
        if let Err(e) = blacklist.add(rule) {
            warn!(rule = %rule, error = %e, "skipping invalid blacklist rule");
        }
    }

    blacklist
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let registry = Arc::new(build_registry(&args.upstreams).map_err(|e| invalid_input(e.to_string()))?);
    let blacklist = Arc::new(load_blacklist(&args).await);

    let cache = if args.no_cache {
        None
    } else {
        Some(Arc::new(ResolveCache::new(
            Duration::from_secs(args.cache_ttl),
            Duration::from_secs(args.cache_sweep),
        )))
    };

    let resolver = match &cache {
        Some(cache) => Resolver::with_cache(registry.clone(), blacklist.clone(), cache.clone()),
        None => Resolver::new(registry.clone(), blacklist.clone()),
    }
    .timeout(Duration::from_secs(args.timeout));
    let resolver = Arc::new(resolver);

    let bind_addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .map_err(|_| invalid_input(format!("invalid bind address {}:{}", args.bind, args.port)))?;

    let server = UdpServer::bind(bind_addr).await?;
    info!(
        addr = %bind_addr,
        upstreams = registry.len(),
        rules = blacklist.len(),
        cache = cache.is_some(),
        "dns proxy listening"
    );
    for upstream in registry.all() {
        info!(name = upstream.name(), address = %upstream.address(), "upstream server");
    }

    server.start(resolver.clone());

    // Report stats every minute
    let stats_resolver = resolver.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = stats_resolver.stats().snapshot_and_reset();
            info!(
                requests = stats.requests,
                forwarded = stats.forwarded,
                cache_hits = stats.cache_hits,
                blocked = stats.blocked,
                failed = stats.failed,
                cache_entries = stats_resolver.cache_len(),
                avg_response_ms = stats.avg_response_ms,
                "stats"
            );
        }
    });

    tokio::signal::ctrl_c().await?;

    let stats = resolver.stats().snapshot_and_reset();
    info!(
        requests = stats.requests,
        cache_entries = resolver.cache_len(),
        upstreams = registry.len(),
        rules = blacklist.len(),
        "shutting down"
    );
    if let Some(cache) = &cache {
        cache.stop();
    }

    Ok(())
}
