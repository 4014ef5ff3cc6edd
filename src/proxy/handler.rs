//! Proxy request handler with retry logic
//!
//! Forwards API-bound requests to the resolved cluster backend and hands
//! everything else to the internal router. Failed GET requests back off
//! through the retry ledger; non-idempotent methods are never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::header::{CONTENT_TYPE, HOST};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, instrument, warn};

use crate::cluster::{ClusterContext, ClusterRegistry, ProxyTarget};
use crate::error::{PorticoError, Result};
use crate::models::RequestRecord;
use crate::proxy::retry::{self, RetryLedger};
use crate::proxy::target::TargetResolver;
use crate::proxy::{empty_body, full_body, BoxError, ProxyBody};
use crate::router::InternalRouter;

/// Configuration for the proxy handler
#[derive(Clone)]
pub struct ProxyHandlerConfig {
    /// Maximum number of retry attempts per request identity key
    pub max_retries: u32,
    /// Linear backoff step between retries
    pub retry_step: Duration,
    /// Timeout for backend connections
    pub connect_timeout: Duration,
    /// Timeout for request/response (watch requests are exempt)
    pub request_timeout: Duration,
    /// Whether to broadcast request records
    pub enable_logging: bool,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 20,
            retry_step: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            enable_logging: true,
        }
    }
}

/// How one dispatch attempt ended up being handled
enum Dispatch {
    /// Forwarded to the cluster backend
    Forwarded(Response<ProxyBody>),
    /// Handed to the internal router
    Routed(Response<ProxyBody>),
}

/// Proxy request handler
pub struct ProxyHandler {
    registry: Arc<dyn ClusterRegistry>,
    resolver: TargetResolver,
    router: Arc<dyn InternalRouter>,
    ledger: RetryLedger,
    config: ProxyHandlerConfig,
    log_sender: Option<broadcast::Sender<RequestRecord>>,
    shutdown: watch::Receiver<bool>,
}

impl ProxyHandler {
    pub fn new(
        registry: Arc<dyn ClusterRegistry>,
        resolver: TargetResolver,
        router: Arc<dyn InternalRouter>,
        config: ProxyHandlerConfig,
        log_sender: Option<broadcast::Sender<RequestRecord>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            resolver,
            router,
            ledger: RetryLedger::new(),
            config,
            log_sender,
            shutdown,
        }
    }

    /// Retry bookkeeping for this handler
    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Handle an incoming request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let path = req.uri().path().to_string();

        let Some(cluster) = self.registry.resolve(&host, &path) else {
            debug!(host = %host, path = %path, "No cluster registered for request");
            self.record(
                "",
                &method,
                &path,
                StatusCode::SERVICE_UNAVAILABLE,
                1,
                started,
                Some("unknown cluster".to_string()),
            );
            return Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(empty_body())
                .unwrap());
        };

        // Retries apply to GET only; the key groups attempts across clients
        let retry_key = (method == Method::GET).then(|| retry::request_key(&host, req.uri()));

        // Collect request body so each attempt can resend it
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| PorticoError::InvalidRequest(format!("failed to read body: {}", e)))?
            .to_bytes();

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;

            match self.attempt(&cluster, &parts, body_bytes.clone()).await {
                Ok(Dispatch::Forwarded(response)) => {
                    let response =
                        self.observe_backend_response(&cluster, retry_key.as_deref(), response);
                    self.record(
                        cluster.id(),
                        &method,
                        &path,
                        response.status(),
                        attempts,
                        started,
                        None,
                    );
                    return Ok(response);
                }
                Ok(Dispatch::Routed(response)) => {
                    self.record(
                        cluster.id(),
                        &method,
                        &path,
                        response.status(),
                        attempts,
                        started,
                        None,
                    );
                    return Ok(response);
                }
                Err(e) => {
                    if *self.shutdown.borrow() {
                        debug!(error = %e, "Dispatch failed during shutdown");
                        return Ok(generic_failure());
                    }

                    warn!(
                        cluster = %cluster.id(),
                        method = %method,
                        path = %path,
                        attempt = attempts,
                        error = %e,
                        "Dispatch failed"
                    );

                    let Some(key) = retry_key.as_deref() else {
                        self.record(
                            cluster.id(),
                            &method,
                            &path,
                            StatusCode::INTERNAL_SERVER_ERROR,
                            attempts,
                            started,
                            Some(e.to_string()),
                        );
                        return Ok(generic_failure());
                    };

                    let count = self.ledger.get(key).unwrap_or(0);
                    if count >= self.config.max_retries {
                        debug!(key = %key, count, "Retry attempts exhausted");
                        self.record(
                            cluster.id(),
                            &method,
                            &path,
                            StatusCode::INTERNAL_SERVER_ERROR,
                            attempts,
                            started,
                            Some(e.to_string()),
                        );
                        return Ok(generic_failure());
                    }

                    let delay = self.config.retry_step * count;
                    debug!(key = %key, count, delay = ?delay, "Scheduling retry");
                    tokio::time::sleep(delay).await;
                    // The count is read before the sleep and written after it,
                    // so concurrent failures on one key may interleave; the
                    // count is an upper bound, not exact.
                    self.ledger.set(key, count + 1);
                }
            }
        }
    }

    /// Run one dispatch attempt
    async fn attempt(
        &self,
        cluster: &ClusterContext,
        parts: &Parts,
        body: Bytes,
    ) -> Result<Dispatch> {
        cluster.handler().ensure_backend_ready().await?;

        let mut parts = parts.clone();
        match self.resolver.resolve(&mut parts, cluster).await? {
            Some(target) => {
                let response = self.forward(&target, &parts, body).await?;
                Ok(Dispatch::Forwarded(response))
            }
            None => {
                let request = Request::from_parts(parts, Full::new(body));
                Ok(Dispatch::Routed(self.router.route(cluster, request).await))
            }
        }
    }

    /// Post-process a delivered backend response
    ///
    /// A delivered response ends the backoff cycle for its key, and a 502 is
    /// replaced with the cluster's own server-error message when it has one.
    fn observe_backend_response(
        &self,
        cluster: &ClusterContext,
        retry_key: Option<&str>,
        response: Response<ProxyBody>,
    ) -> Response<ProxyBody> {
        if let Some(key) = retry_key {
            self.ledger.remove(key);
        }

        if response.status() == StatusCode::BAD_GATEWAY {
            if let Some(friendly) = cluster.handler().friendly_server_error() {
                return Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .header(CONTENT_TYPE, friendly.content_type)
                    .body(full_body(friendly.message))
                    .unwrap();
            }
        }

        response
    }

    /// Forward a request to a resolved backend target
    async fn forward(
        &self,
        target: &ProxyTarget,
        parts: &Parts,
        body: Bytes,
    ) -> Result<Response<ProxyBody>> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = target.uri_for(path_and_query)?;

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| PorticoError::Timeout)?
        .map_err(|e| PorticoError::BackendUnavailable(format!("connect failed: {}", e)))?;

        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);

        // Copy headers, except hop-by-hop headers; Host is rewritten below
        for (name, value) in &parts.headers {
            if !is_hop_by_hop_header(name.as_str()) && name != &HOST {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(HOST, target.authority());

        let mut request = builder
            .body(Full::new(body))
            .map_err(|e| PorticoError::InvalidRequest(format!("failed to build request: {}", e)))?;

        // Backend-supplied headers (its own credentials) take over
        for (name, value) in target.headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| PorticoError::BackendUnavailable(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection ended: {}", e);
            }
        });

        // Watch calls stay open for as long as the backend keeps them open
        let response = if target.streaming {
            sender.send_request(request).await
        } else {
            tokio::time::timeout(self.config.request_timeout, sender.send_request(request))
                .await
                .map_err(|_| PorticoError::Timeout)?
        }
        .map_err(|e| PorticoError::BackendUnavailable(format!("request failed: {}", e)))?;

        Ok(response.map(|body| body.map_err(BoxError::from).boxed_unsync()))
    }

    fn record(
        &self,
        cluster_id: &str,
        method: &Method,
        path: &str,
        status: StatusCode,
        attempts: u32,
        started: Instant,
        error_message: Option<String>,
    ) {
        if !self.config.enable_logging {
            return;
        }

        if let Some(sender) = &self.log_sender {
            let _ = sender.send(RequestRecord {
                cluster_id: cluster_id.to_string(),
                method: method.to_string(),
                path: path.to_string(),
                status_code: status.as_u16() as i32,
                attempts,
                response_time: started.elapsed().as_millis() as i32,
                error_message,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Generic failure response written when no retry owns the request
///
/// Never leaks internal error detail to the client.
pub(crate) fn generic_failure() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body("Oops, something went wrong"))
        .unwrap()
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
