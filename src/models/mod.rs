//! Shared data types
//!
//! Everything here is process-lifetime only; nothing is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of one dispatched request, broadcast for request-log subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Id of the cluster the request resolved to (empty if none)
    pub cluster_id: String,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    /// Number of dispatch attempts, including the first
    pub attempts: u32,
    /// Total handling time in milliseconds
    pub response_time: i32,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}
