//! Cluster contexts and lookup
//!
//! A cluster context is an opaque handle for one backend API server. The
//! proxy core resolves a context per request through the registry, then uses
//! the context's handler to reach the live backend.

pub mod context;
pub mod registry;

pub use context::{ClusterContext, ContextHandler, FriendlyError, ProxyTarget, StaticContextHandler};
pub use registry::{ClusterRegistry, InMemoryClusterRegistry};
