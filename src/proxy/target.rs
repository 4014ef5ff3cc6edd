//! Backend-target classification and request rewriting
//!
//! Decides whether a request is bound for the cluster's API surface or for
//! the internal router, and rewrites API-bound requests in place.

use http::header::AUTHORIZATION;
use http::request::Parts;
use http::Uri;

use crate::cluster::{ClusterContext, ProxyTarget};
use crate::error::{PorticoError, Result};

/// Classifies requests against the configured API path prefix
pub struct TargetResolver {
    api_prefix: String,
}

impl TargetResolver {
    pub fn new(api_prefix: impl Into<String>) -> Self {
        Self {
            api_prefix: api_prefix.into(),
        }
    }

    /// Resolve the backend target for a request, if it is API-bound
    ///
    /// On a match the request parts are rewritten in place: the client's
    /// `Authorization` header is removed (the backend's own credentials,
    /// supplied by the context handler, take over) and the matched prefix is
    /// stripped from the path, query preserved. `None` means the request
    /// belongs to the internal router; the parts are left untouched.
    ///
    /// Target resolution failures from the context handler propagate as
    /// forwarding failures.
    pub async fn resolve(
        &self,
        parts: &mut Parts,
        cluster: &ClusterContext,
    ) -> Result<Option<ProxyTarget>> {
        let path = parts.uri.path().to_string();
        let Some(rest) = path.strip_prefix(self.api_prefix.as_str()) else {
            return Ok(None);
        };
        // Prefix must end at a segment boundary
        if !rest.is_empty() && !rest.starts_with('/') {
            return Ok(None);
        }

        parts.headers.remove(AUTHORIZATION);

        let query = parts.uri.query().map(str::to_string);
        let is_watch = is_watch_request(query.as_deref());

        let rewritten = if rest.is_empty() { "/" } else { rest };
        parts.uri = rewrite_uri(rewritten, query.as_deref())?;

        let target = cluster.handler().resolve_api_target(is_watch).await?;
        Ok(Some(target))
    }
}

/// Detect a long-lived streaming call via the `watch=` query marker
fn is_watch_request(query: Option<&str>) -> bool {
    query.map_or(false, |q| q.split('&').any(|p| p.starts_with("watch=")))
}

fn rewrite_uri(path: &str, query: Option<&str>) -> Result<Uri> {
    let path_and_query = match query {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };
    path_and_query
        .parse()
        .map_err(|e| PorticoError::InvalidRequest(format!("cannot rewrite path: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterContext, ContextHandler, FriendlyError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::header::{HeaderMap, HeaderValue};
    use http::Request;
    use http_body_util::Full;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Context handler that records the watch flag and can be made to fail
    struct RecordingHandler {
        fail: bool,
        saw_watch: AtomicBool,
    }

    impl RecordingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                saw_watch: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ContextHandler for RecordingHandler {
        async fn ensure_backend_ready(&self) -> crate::error::Result<()> {
            Ok(())
        }

        async fn resolve_api_target(&self, is_watch: bool) -> crate::error::Result<ProxyTarget> {
            self.saw_watch.store(is_watch, Ordering::SeqCst);
            if self.fail {
                return Err(PorticoError::TargetResolution("backend gone".into()));
            }
            Ok(ProxyTarget {
                scheme: "http".to_string(),
                host: "127.0.0.1".to_string(),
                port: 9001,
                path_prefix: String::new(),
                headers: HeaderMap::new(),
                streaming: is_watch,
            })
        }

        fn friendly_server_error(&self) -> Option<FriendlyError> {
            None
        }
    }

    fn cluster(handler: Arc<RecordingHandler>) -> ClusterContext {
        ClusterContext::new("dev", "dev", handler)
    }

    fn parts_for(uri: &str) -> Parts {
        let mut req = Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap();
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-token"));
        req.into_parts().0
    }

    fn resolver() -> TargetResolver {
        TargetResolver::new("/api-kube")
    }

    #[tokio::test]
    async fn test_non_matching_path_yields_no_target() {
        let handler = RecordingHandler::new(false);
        let mut parts = parts_for("/app/dashboard");

        let target = resolver()
            .resolve(&mut parts, &cluster(handler))
            .await
            .unwrap();

        assert!(target.is_none());
        // Untouched: the internal router sees the original request
        assert_eq!(parts.uri.path(), "/app/dashboard");
        assert!(parts.headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_prefix_boundary_is_respected() {
        let handler = RecordingHandler::new(false);
        let mut parts = parts_for("/api-kubernetes/pods");

        let target = resolver()
            .resolve(&mut parts, &cluster(handler))
            .await
            .unwrap();

        assert!(target.is_none());
    }

    #[tokio::test]
    async fn test_matching_path_is_rewritten_and_auth_stripped() {
        let handler = RecordingHandler::new(false);
        let mut parts = parts_for("/api-kube/api/v1/pods?limit=10");

        let target = resolver()
            .resolve(&mut parts, &cluster(handler.clone()))
            .await
            .unwrap();

        assert!(target.is_some());
        assert_eq!(parts.uri.path(), "/api/v1/pods");
        assert_eq!(parts.uri.query(), Some("limit=10"));
        assert!(!parts.headers.contains_key(AUTHORIZATION));
        assert!(!handler.saw_watch.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bare_prefix_rewrites_to_root() {
        let handler = RecordingHandler::new(false);
        let mut parts = parts_for("/api-kube");

        let target = resolver()
            .resolve(&mut parts, &cluster(handler))
            .await
            .unwrap();

        assert!(target.is_some());
        assert_eq!(parts.uri.path(), "/");
    }

    #[tokio::test]
    async fn test_watch_marker_is_detected() {
        let handler = RecordingHandler::new(false);
        let mut parts = parts_for("/api-kube/api/v1/pods?watch=true&resourceVersion=5");

        let target = resolver()
            .resolve(&mut parts, &cluster(handler.clone()))
            .await
            .unwrap()
            .unwrap();

        assert!(target.streaming);
        assert!(handler.saw_watch.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        let handler = RecordingHandler::new(true);
        let mut parts = parts_for("/api-kube/api/v1/pods");

        let err = resolver()
            .resolve(&mut parts, &cluster(handler))
            .await
            .unwrap_err();

        assert!(matches!(err, PorticoError::TargetResolution(_)));
    }

    #[test]
    fn test_is_watch_request() {
        assert!(is_watch_request(Some("watch=true")));
        assert!(is_watch_request(Some("limit=10&watch=1")));
        assert!(!is_watch_request(Some("limit=10")));
        assert!(!is_watch_request(Some("unwatched=true")));
        assert!(!is_watch_request(None));
    }
}
