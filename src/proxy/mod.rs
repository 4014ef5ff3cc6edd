//! Proxy front door
//!
//! This module provides the proxy core:
//! - Request dispatch for plain HTTP and WebSocket upgrades
//! - Backend-target resolution with API path rewriting
//! - Retry/backoff bookkeeping for GET requests
//! - Error-to-status translation

pub mod handler;
pub mod retry;
pub mod server;
pub mod target;
pub mod upgrade;

pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use retry::RetryLedger;
pub use server::{ProxyServer, ProxyServerBuilder, ProxyServerHandle};
pub use target::TargetResolver;
pub use upgrade::UpgradeHandler;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Boxed error type carried by proxy response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body shared by all proxy components
///
/// Boxed so backend responses stream through instead of being buffered.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Whole-body response payload
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Empty response payload
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
