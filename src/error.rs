//! Error types for the proxy core.

use std::io;
use thiserror::Error;

/// Errors surfaced by the registry, blacklist and resolver.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Rejected input: empty domain, empty server name, malformed rule.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An upstream server with this name is already registered.
    #[error("upstream server {0:?} already exists")]
    DuplicateServer(String),

    /// No upstream server with this name is registered.
    #[error("upstream server {0:?} not found")]
    UnknownServer(String),

    /// The registry holds no servers to forward to.
    #[error("no upstream servers configured")]
    NoUpstreamAvailable,

    /// Every server in the ring failed; carries the last failure only.
    #[error("all upstream servers failed")]
    UpstreamExhausted(#[source] UpstreamError),
}

/// A single failed exchange with one upstream server.
#[derive(Debug, Error)]
#[error("query via {server} failed")]
pub struct UpstreamError {
    pub server: String,
    #[source]
    pub source: io::Error,
}
