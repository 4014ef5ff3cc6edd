//! Cluster registry lookup

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::ClusterContext;

/// Request-to-cluster resolution
///
/// Called on every inbound request, so implementations must be cheap and
/// non-blocking.
pub trait ClusterRegistry: Send + Sync {
    /// Resolve the cluster context for a request, if any
    fn resolve(&self, host: &str, path: &str) -> Option<ClusterContext>;
}

/// In-memory registry keyed by cluster id
///
/// Matches the request's Host header (port stripped) exactly, or its first
/// DNS label, against registered ids, so `dev.localhost:7788` resolves the
/// cluster registered as `dev`.
#[derive(Default)]
pub struct InMemoryClusterRegistry {
    clusters: RwLock<HashMap<String, ClusterContext>>,
}

impl InMemoryClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a single cluster
    pub fn insert(&self, context: ClusterContext) {
        self.clusters
            .write()
            .insert(context.id().to_string(), context);
    }

    /// Replace the whole cluster set
    pub fn refresh(&self, contexts: Vec<ClusterContext>) {
        let mut clusters = self.clusters.write();
        clusters.clear();
        for context in contexts {
            clusters.insert(context.id().to_string(), context);
        }
        debug!("Cluster registry refreshed, {} clusters", clusters.len());
    }

    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.read().is_empty()
    }
}

impl ClusterRegistry for InMemoryClusterRegistry {
    fn resolve(&self, host: &str, _path: &str) -> Option<ClusterContext> {
        let host = strip_port(host);
        let clusters = self.clusters.read();

        if let Some(context) = clusters.get(host) {
            return Some(context.clone());
        }

        let label = host.split('.').next()?;
        clusters.get(label).cloned()
    }
}

/// Strip a trailing `:port` from a Host header value
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.strip_prefix('[').and_then(|h| h.find(']')) {
        // Bracketed IPv6 literal
        return &host[1..=end];
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticContextHandler;
    use std::sync::Arc;
    use url::Url;

    fn context(id: &str) -> ClusterContext {
        let handler =
            StaticContextHandler::new(&Url::parse("http://127.0.0.1:9001").unwrap()).unwrap();
        ClusterContext::new(id, id, Arc::new(handler))
    }

    #[test]
    fn test_resolve_exact_host() {
        let registry = InMemoryClusterRegistry::new();
        registry.insert(context("dev"));

        assert!(registry.resolve("dev", "/").is_some());
        assert!(registry.resolve("prod", "/").is_none());
    }

    #[test]
    fn test_resolve_strips_port() {
        let registry = InMemoryClusterRegistry::new();
        registry.insert(context("dev"));

        let resolved = registry.resolve("dev:7788", "/api-kube/pods").unwrap();
        assert_eq!(resolved.id(), "dev");
    }

    #[test]
    fn test_resolve_by_first_label() {
        let registry = InMemoryClusterRegistry::new();
        registry.insert(context("dev"));

        let resolved = registry.resolve("dev.localhost:7788", "/").unwrap();
        assert_eq!(resolved.id(), "dev");
    }

    #[test]
    fn test_refresh_replaces_set() {
        let registry = InMemoryClusterRegistry::new();
        registry.insert(context("old"));

        registry.refresh(vec![context("a"), context("b")]);

        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("old", "/").is_none());
        assert!(registry.resolve("a", "/").is_some());
    }

    #[test]
    fn test_strip_port_handles_ipv6() {
        assert_eq!(strip_port("[::1]:7788"), "::1");
        assert_eq!(strip_port("127.0.0.1:7788"), "127.0.0.1");
        assert_eq!(strip_port("localhost"), "localhost");
    }
}
