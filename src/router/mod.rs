//! Internal application routing
//!
//! Requests that do not match the backend-API path prefix never reach a
//! cluster backend; they are handed to an [`InternalRouter`] instead.

use async_trait::async_trait;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use serde_json::json;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::cluster::ClusterContext;
use crate::error::PorticoError;
use crate::proxy::ProxyBody;

/// Handles requests outside the backend-API surface
#[async_trait]
pub trait InternalRouter: Send + Sync {
    /// Route a request for the given cluster
    ///
    /// Infallible by contract: the router owns its own error rendering.
    async fn route(
        &self,
        cluster: &ClusterContext,
        request: Request<Full<Bytes>>,
    ) -> Response<ProxyBody>;
}

/// Default application router
///
/// Serves the local application surface: a health endpoint and a JSON 404
/// for everything else. Embedders with a real app surface supply their own
/// [`InternalRouter`] instead.
#[derive(Clone)]
pub struct AppRouter {
    router: Router,
}

impl AppRouter {
    pub fn new() -> Self {
        let router = Router::new()
            .route("/health", get(health_check))
            .fallback(not_found)
            .layer(TraceLayer::new_for_http());

        Self { router }
    }
}

impl Default for AppRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "portico"
    }))
}

async fn not_found(uri: http::Uri) -> impl IntoResponse {
    PorticoError::NotFound(uri.path().to_string())
}

#[async_trait]
impl InternalRouter for AppRouter {
    async fn route(
        &self,
        _cluster: &ClusterContext,
        request: Request<Full<Bytes>>,
    ) -> Response<ProxyBody> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, axum::body::Body::new(body));

        let response = match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        response.map(|body| body.map_err(Into::into).boxed_unsync())
    }
}
