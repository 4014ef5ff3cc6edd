use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the Portico application
#[derive(Error, Debug)]
pub enum PorticoError {
    // Cluster resolution errors
    #[error("No cluster registered for this request")]
    UnknownCluster,

    #[error("Backend not ready: {0}")]
    BackendUnavailable(String),

    #[error("Target resolution failed: {0}")]
    TargetResolution(String),

    #[error("Invalid backend URL: {0}")]
    InvalidBackendUrl(String),

    // Upgrade errors
    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Portico operations
pub type Result<T> = std::result::Result<T, PorticoError>;

impl PorticoError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PorticoError::InvalidRequest(_)
            | PorticoError::UpgradeFailed(_)
            | PorticoError::InvalidBackendUrl(_)
            | PorticoError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            PorticoError::NotFound(_) => StatusCode::NOT_FOUND,

            // 502 Bad Gateway
            PorticoError::BackendUnavailable(_) | PorticoError::TargetResolution(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            PorticoError::UnknownCluster => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            PorticoError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            PorticoError::Io(_) | PorticoError::Http(_) | PorticoError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for the internal app router's endpoints
impl IntoResponse for PorticoError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for PorticoError {
    fn from(err: hyper::Error) -> Self {
        PorticoError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for PorticoError {
    fn from(err: url::ParseError) -> Self {
        PorticoError::InvalidBackendUrl(err.to_string())
    }
}
