//! Portico - Cluster Front Door Proxy
//!
//! A local reverse proxy that sits between a desktop client and
//! independently-managed backend API servers, one per cluster.
//!
//! ## Features
//!
//! - Host-based cluster resolution with pluggable registries
//! - Kubernetes-API-style path rewriting behind a configurable prefix
//! - Transparent linear-backoff retries for GET requests while a backend
//!   starts up
//! - WebSocket upgrade handoff to interactive session handlers
//! - Friendly gateway-error substitution per cluster
//! - Request-record broadcasting for request-log subscribers

pub mod cluster;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod router;
pub mod session;

pub use config::Config;
pub use error::{PorticoError, Result};
