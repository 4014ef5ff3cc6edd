//! Portico Proxy Server - Entry Point
//!
//! Starts the front-door proxy with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cluster;
mod config;
mod error;
mod models;
mod proxy;
mod router;
mod session;

use cluster::{ClusterContext, InMemoryClusterRegistry, StaticContextHandler};
use config::Config;
use proxy::{ProxyServerBuilder, ProxyServerHandle};
use router::AppRouter;
use session::EchoSessionHandler;

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portico=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Portico Proxy Server");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    // Register configured clusters
    let registry = Arc::new(InMemoryClusterRegistry::new());
    for entry in &config.clusters {
        let handler = StaticContextHandler::new(&entry.url)?
            .with_friendly_message(format!("Cluster {} is not ready yet", entry.id));
        registry.insert(ClusterContext::new(
            entry.id.clone(),
            entry.id.clone(),
            Arc::new(handler),
        ));
    }
    info!("Registered {} clusters", registry.len());

    // Create request-record broadcast channel (bounded to prevent memory leaks)
    let (log_sender, log_receiver) = broadcast::channel::<models::RequestRecord>(1024);

    // Forward request records to the log
    let log_task = tokio::spawn(drain_request_records(log_receiver));

    // Create proxy server
    let (handle, shutdown_rx) = ProxyServerHandle::new();
    let server = ProxyServerBuilder::new(config.proxy.clone())
        .registry(registry)
        .router(Arc::new(AppRouter::new()))
        .sessions(Arc::new(EchoSessionHandler))
        .log_sender(log_sender)
        .shutdown(shutdown_rx)
        .build();

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Proxy server started on {}", config.proxy_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    handle.shutdown();

    let _ = tokio::join!(server_task);
    log_task.abort();

    info!("Portico Proxy Server stopped");
    Ok(())
}

/// Log each broadcast request record
async fn drain_request_records(mut receiver: broadcast::Receiver<models::RequestRecord>) {
    loop {
        match receiver.recv().await {
            Ok(record) => {
                debug!(
                    cluster = %record.cluster_id,
                    method = %record.method,
                    path = %record.path,
                    status = record.status_code,
                    attempts = record.attempts,
                    response_time_ms = record.response_time,
                    "Request dispatched"
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Request log lagged, missed {} records", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
