//! Proxy server implementation using hyper
//!
//! Owns the listening socket and dispatches each inbound request to the
//! upgrade handler or the HTTP forwarding path.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument};

use crate::cluster::ClusterRegistry;
use crate::config::ProxyServerConfig;
use crate::error::{PorticoError, Result};
use crate::models::RequestRecord;
use crate::proxy::handler::{generic_failure, ProxyHandler, ProxyHandlerConfig};
use crate::proxy::target::TargetResolver;
use crate::proxy::upgrade::UpgradeHandler;
use crate::router::InternalRouter;
use crate::session::SessionHandler;

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    handler: Arc<ProxyHandler>,
    upgrades: Arc<UpgradeHandler>,
    shutdown: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyServerConfig,
        registry: Arc<dyn ClusterRegistry>,
        router: Arc<dyn InternalRouter>,
        sessions: Arc<dyn SessionHandler>,
        log_sender: Option<broadcast::Sender<RequestRecord>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handler_config = ProxyHandlerConfig {
            max_retries: config.max_retries,
            retry_step: Duration::from_millis(config.retry_step_ms),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            request_timeout: Duration::from_secs(config.request_timeout),
            enable_logging: true,
        };

        let handler = Arc::new(ProxyHandler::new(
            registry.clone(),
            TargetResolver::new(config.api_prefix.clone()),
            router,
            handler_config,
            log_sender,
            shutdown.clone(),
        ));

        let upgrades = Arc::new(UpgradeHandler::new(registry, sessions));

        Self {
            config,
            handler,
            upgrades,
            shutdown,
        }
    }

    /// Run the proxy server on the configured address
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| {
                PorticoError::InvalidConfig(format!(
                    "invalid proxy server address {}:{}",
                    self.config.host, self.config.port
                ))
            })?;

        let listener = TcpListener::bind(addr).await?;
        self.run_on(listener).await
    }

    /// Run the proxy server on a caller-supplied listener
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Proxy server listening on {}", addr);

        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            let upgrades = self.upgrades.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, handler, upgrades).await
                                {
                                    debug!(client = %client_addr, "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        handler: Arc<ProxyHandler>,
        upgrades: Arc<UpgradeHandler>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let upgrades = upgrades.clone();

            async move {
                let result = if UpgradeHandler::is_upgrade_request(&req) {
                    upgrades.handle(req).await
                } else {
                    handler.handle(req).await
                };

                match result {
                    Ok(response) => Ok::<_, Infallible>(response),
                    Err(e) => {
                        debug!("Request handling error: {}", e);
                        Ok(generic_failure())
                    }
                }
            }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| PorticoError::Http(e.to_string()))?;

        Ok(())
    }
}

/// Guard for managing proxy server lifecycle
pub struct ProxyServerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyServerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    /// Mark the server closed: stop accepting and go quiet on errors
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ProxyServerHandle {
    fn default() -> Self {
        Self::new().0
    }
}

/// Builder for creating a proxy server
pub struct ProxyServerBuilder {
    config: ProxyServerConfig,
    registry: Option<Arc<dyn ClusterRegistry>>,
    router: Option<Arc<dyn InternalRouter>>,
    sessions: Option<Arc<dyn SessionHandler>>,
    log_sender: Option<broadcast::Sender<RequestRecord>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyServerConfig) -> Self {
        Self {
            config,
            registry: None,
            router: None,
            sessions: None,
            log_sender: None,
            shutdown: None,
        }
    }

    pub fn registry(mut self, registry: Arc<dyn ClusterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn router(mut self, router: Arc<dyn InternalRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionHandler>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn log_sender(mut self, sender: broadcast::Sender<RequestRecord>) -> Self {
        self.log_sender = Some(sender);
        self
    }

    pub fn shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> ProxyServer {
        let registry = self.registry.expect("Cluster registry is required");
        let router = self.router.expect("Internal router is required");
        let sessions = self.sessions.expect("Session handler is required");
        let shutdown = self
            .shutdown
            .unwrap_or_else(|| ProxyServerHandle::new().1);

        ProxyServer::new(
            self.config,
            registry,
            router,
            sessions,
            self.log_sender,
            shutdown,
        )
    }
}
