//! Retry bookkeeping for idempotent requests
//!
//! Counts outstanding retry attempts per request identity key. Entries are
//! removed when a backend response is delivered for the key; the attempt cap
//! enforced by the forwarding engine is the only other bound. Counts are a
//! best-effort upper bound: the read and the increment straddle the backoff
//! sleep, so concurrent failures on one key may interleave.

use dashmap::DashMap;
use http::Uri;

/// Identity key for grouping retries: host + path, query included
///
/// Collisions across clients sharing host and path are intentional; they
/// share the backoff cycle.
pub fn request_key(host: &str, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{}{}", host, path_and_query)
}

/// In-memory retry-attempt counts keyed by request identity
#[derive(Debug, Default)]
pub struct RetryLedger {
    counts: DashMap<String, u32>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    /// Current attempt count for a key, if one is outstanding
    pub fn get(&self, key: &str) -> Option<u32> {
        self.counts.get(key).map(|entry| *entry)
    }

    /// Record the attempt count for a key
    pub fn set(&self, key: &str, count: u32) {
        self.counts.insert(key.to_string(), count);
    }

    /// Clear the entry for a key, ending its backoff cycle
    pub fn remove(&self, key: &str) {
        self.counts.remove(key);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_includes_query() {
        let uri: Uri = "/api-kube/pods?watch=true".parse().unwrap();
        assert_eq!(
            request_key("dev.localhost:7788", &uri),
            "dev.localhost:7788/api-kube/pods?watch=true"
        );
    }

    #[test]
    fn test_request_key_without_query() {
        let uri: Uri = "/app/dashboard".parse().unwrap();
        assert_eq!(request_key("dev", &uri), "dev/app/dashboard");
    }

    #[test]
    fn test_ledger_roundtrip() {
        let ledger = RetryLedger::new();
        assert_eq!(ledger.get("k"), None);

        ledger.set("k", 0);
        assert_eq!(ledger.get("k"), Some(0));

        ledger.set("k", 3);
        assert_eq!(ledger.get("k"), Some(3));

        ledger.remove("k");
        assert_eq!(ledger.get("k"), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let ledger = RetryLedger::new();
        ledger.remove("absent");
        assert!(ledger.is_empty());
    }
}
