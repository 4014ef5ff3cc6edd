//! WebSocket upgrade interception
//!
//! Upgrade requests never enter the HTTP forwarding path. The handshake is
//! completed per connection, with no shared WebSocket server state, and the
//! established socket is handed to the session collaborator.

use std::sync::Arc;

use http::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::cluster::ClusterRegistry;
use crate::error::Result;
use crate::proxy::{empty_body, full_body, ProxyBody};
use crate::session::SessionHandler;

/// Intercepts protocol-upgrade requests and routes them to sessions
pub struct UpgradeHandler {
    registry: Arc<dyn ClusterRegistry>,
    sessions: Arc<dyn SessionHandler>,
}

impl UpgradeHandler {
    pub fn new(registry: Arc<dyn ClusterRegistry>, sessions: Arc<dyn SessionHandler>) -> Self {
        Self { registry, sessions }
    }

    /// Check whether a request asks for a WebSocket upgrade
    pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
        let connection_upgrade = req
            .headers()
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| {
                v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            });

        let upgrade_websocket = req
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.eq_ignore_ascii_case("websocket"));

        connection_upgrade && upgrade_websocket
    }

    /// Handle an upgrade request
    ///
    /// Resolves the cluster first; failures at any point are terminal for the
    /// connection. No retry semantics apply to upgrades.
    pub async fn handle<B>(&self, mut req: Request<B>) -> Result<Response<ProxyBody>> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let path = req.uri().path();

        let Some(cluster) = self.registry.resolve(host, path) else {
            debug!(host = %host, path = %path, "No cluster registered for upgrade request");
            return Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(empty_body())
                .unwrap());
        };

        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return Ok(handshake_rejection("missing Sec-WebSocket-Key header"));
        };
        let accept = derive_accept_key(key.as_bytes());

        if req
            .headers()
            .get(SEC_WEBSOCKET_VERSION)
            .and_then(|v| v.to_str().ok())
            != Some("13")
        {
            return Ok(handshake_rejection("unsupported WebSocket version"));
        }

        let node = node_param(req.uri().query());
        let cluster_id = cluster.id().to_string();

        let on_upgrade = hyper::upgrade::on(&mut req);
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    // Server-role socket scoped to this one handshake
                    let socket = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    sessions.open_session(socket, cluster, node).await;
                }
                Err(e) => {
                    warn!("Upgrade failed: {}", e);
                }
            }
        });

        info!(cluster = %cluster_id, "WebSocket upgrade accepted");

        Ok(Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(empty_body())
            .unwrap())
    }
}

/// Extract the optional node-selection parameter from the query string
fn node_param(query: Option<&str>) -> Option<String> {
    let query = query?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "node")
        .map(|(_, value)| value.into_owned())
}

fn handshake_rejection(reason: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(full_body(reason.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterContext, InMemoryClusterRegistry, StaticContextHandler};
    use crate::session::{SessionHandler, SessionSocket};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::Full;
    use url::Url;

    struct NoopSessions;

    #[async_trait]
    impl SessionHandler for NoopSessions {
        async fn open_session(
            &self,
            _socket: SessionSocket,
            _cluster: ClusterContext,
            _node: Option<String>,
        ) {
        }
    }

    fn registry(with_cluster: bool) -> Arc<InMemoryClusterRegistry> {
        let registry = Arc::new(InMemoryClusterRegistry::new());
        if with_cluster {
            let handler =
                StaticContextHandler::new(&Url::parse("http://127.0.0.1:9001").unwrap()).unwrap();
            registry.insert(ClusterContext::new("dev", "dev", Arc::new(handler)));
        }
        registry
    }

    fn upgrade_handler(with_cluster: bool) -> UpgradeHandler {
        UpgradeHandler::new(registry(with_cluster), Arc::new(NoopSessions))
    }

    fn upgrade_request(host: &str, uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header(HOST, host)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(UpgradeHandler::is_upgrade_request(&upgrade_request(
            "dev", "/shell"
        )));

        let plain = Request::builder()
            .uri("/shell")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert!(!UpgradeHandler::is_upgrade_request(&plain));

        // Connection header may carry multiple tokens
        let mixed = Request::builder()
            .uri("/shell")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert!(UpgradeHandler::is_upgrade_request(&mixed));
    }

    #[test]
    fn test_node_param_extraction() {
        assert_eq!(node_param(Some("node=worker-1")), Some("worker-1".to_string()));
        assert_eq!(
            node_param(Some("shell=1&node=worker%2D2")),
            Some("worker-2".to_string())
        );
        assert_eq!(node_param(Some("shell=1")), None);
        assert_eq!(node_param(None), None);
    }

    #[tokio::test]
    async fn test_unknown_cluster_upgrade_yields_503() {
        let handler = upgrade_handler(false);
        let response = handler.handle(upgrade_request("ghost", "/shell")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected() {
        let handler = upgrade_handler(true);
        let request = Request::builder()
            .uri("/shell")
            .header(HOST, "dev")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = handler.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_handshake_answers_with_derived_accept_key() {
        let handler = upgrade_handler(true);
        let response = handler
            .handle(upgrade_request("dev", "/shell?node=worker-1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        // RFC 6455 sample key/accept pair
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_ACCEPT).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
