//! Upstream server registry.
//!
//! Holds the named set of upstream DNS servers the resolver forwards to.
//! Lookups happen on every query; mutation is rare (startup, admin).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::ProxyError;

/// A single upstream DNS server.
///
/// Immutable after construction; `new` validates all fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamServer {
    name: String,
    ipv4: String,
    ipv6: Option<String>,
    port: u16,
}

impl UpstreamServer {
    /// Create a validated server entry.
    ///
    /// The name and IPv4 address are required; IPv6 is optional.
    pub fn new(
        name: impl Into<String>,
        ipv4: impl Into<String>,
        ipv6: Option<String>,
        port: u16,
    ) -> Result<Self, ProxyError> {
        let name = name.into();
        let ipv4 = ipv4.into();

        if name.is_empty() {
            return Err(ProxyError::InvalidArgument(
                "server name cannot be empty".into(),
            ));
        }
        if ipv4.is_empty() {
            return Err(ProxyError::InvalidArgument(
                "IPv4 address cannot be empty".into(),
            ));
        }
        if port == 0 {
            return Err(ProxyError::InvalidArgument(
                "port must be between 1 and 65535".into(),
            ));
        }

        Ok(Self {
            name,
            ipv4,
            ipv6,
            port,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ipv4(&self) -> &str {
        &self.ipv4
    }

    pub fn ipv6(&self) -> Option<&str> {
        self.ipv6.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Socket address string for this server, preferring IPv4.
    pub fn address(&self) -> String {
        if !self.ipv4.is_empty() {
            format!("{}:{}", self.ipv4, self.port)
        } else if let Some(ipv6) = &self.ipv6 {
            format!("[{}]:{}", ipv6, self.port)
        } else {
            String::new()
        }
    }
}

/// Named collection of upstream servers, shared across concurrent queries.
pub struct Registry {
    servers: RwLock<HashMap<String, UpstreamServer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a server under its unique name.
    ///
    /// Fails if a server with the same name already exists.
    pub fn add(&self, server: UpstreamServer) -> Result<(), ProxyError> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);

        if servers.contains_key(server.name()) {
            return Err(ProxyError::DuplicateServer(server.name().to_owned()));
        }
        servers.insert(server.name().to_owned(), server);
        Ok(())
    }

    /// Remove a server by name.
    pub fn remove(&self, name: &str) -> Result<(), ProxyError> {
        if name.is_empty() {
            return Err(ProxyError::InvalidArgument(
                "server name cannot be empty".into(),
            ));
        }

        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);

        if servers.remove(name).is_none() {
            return Err(ProxyError::UnknownServer(name.to_owned()));
        }
        Ok(())
    }

    /// Look up a server by name. Absence is not an error.
    pub fn get(&self, name: &str) -> Option<UpstreamServer> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot of all registered servers.
    ///
    /// Iteration order is unspecified and may differ between registries.
    pub fn all(&self) -> Vec<UpstreamServer> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all servers at once.
    pub fn clear(&self) {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, ipv4: &str) -> UpstreamServer {
        UpstreamServer::new(name, ipv4, None, 53).unwrap()
    }

    #[test]
    fn new_server_validates_fields() {
        assert!(UpstreamServer::new("", "1.1.1.1", None, 53).is_err());
        assert!(UpstreamServer::new("Cloudflare", "", None, 53).is_err());
        assert!(UpstreamServer::new("Cloudflare", "1.1.1.1", None, 0).is_err());
        assert!(UpstreamServer::new("Cloudflare", "1.1.1.1", None, 53).is_ok());
    }

    #[test]
    fn address_prefers_ipv4() {
        let s = UpstreamServer::new(
            "Cloudflare",
            "1.1.1.1",
            Some("2606:4700:4700::1111".into()),
            53,
        )
        .unwrap();

        assert_eq!(s.address(), "1.1.1.1:53");
    }

    #[test]
    fn add_and_get() {
        let registry = Registry::new();
        registry.add(server("Google", "8.8.8.8")).unwrap();

        let got = registry.get("Google").unwrap();
        assert_eq!(got.ipv4(), "8.8.8.8");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_duplicate_name_fails_and_leaves_count() {
        let registry = Registry::new();
        registry.add(server("Google", "8.8.8.8")).unwrap();

        let err = registry.add(server("Google", "8.8.4.4")).unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateServer(_)));
        assert_eq!(registry.len(), 1);
        // The original entry survives.
        assert_eq!(registry.get("Google").unwrap().ipv4(), "8.8.8.8");
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = Registry::new();

        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn remove_server() {
        let registry = Registry::new();
        registry.add(server("Quad9", "9.9.9.9")).unwrap();

        registry.remove("Quad9").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_missing_fails() {
        let registry = Registry::new();

        let err = registry.remove("ghost").unwrap_err();
        assert!(matches!(err, ProxyError::UnknownServer(_)));
    }

    #[test]
    fn remove_empty_name_fails() {
        let registry = Registry::new();

        let err = registry.remove("").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidArgument(_)));
    }

    #[test]
    fn all_returns_snapshot() {
        let registry = Registry::new();
        registry.add(server("a", "1.1.1.1")).unwrap();
        registry.add(server("b", "8.8.8.8")).unwrap();

        let servers = registry.all();
        assert_eq!(servers.len(), 2);

        let mut names: Vec<_> = servers.iter().map(|s| s.name().to_owned()).collect();
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn clear_removes_everything() {
        let registry = Registry::new();
        registry.add(server("a", "1.1.1.1")).unwrap();
        registry.add(server("b", "8.8.8.8")).unwrap();

        registry.clear();
        assert_eq!(registry.len(), 0);
        assert!(registry.all().is_empty());
    }
}
