use crate::error::{PorticoError, Result};
use std::env;
use url::Url;

/// Default API path prefix for backend-bound requests
pub const DEFAULT_API_PREFIX: &str = "/api-kube";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Statically registered clusters (id=url pairs)
    pub clusters: Vec<ClusterEntry>,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 7788)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Path prefix that marks backend-API requests
    pub api_prefix: String,
    /// Maximum retry attempts for failed GET requests
    pub max_retries: u32,
    /// Linear backoff step between retries in milliseconds
    pub retry_step_ms: u64,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Request timeout in seconds (not applied to watch requests)
    pub request_timeout: u64,
}

/// One statically configured cluster backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEntry {
    /// Cluster id, matched against the request's Host header
    pub id: String,
    /// Base URL of the backend API server
    pub url: Url,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PORTICO_PORT", "7788").parse().map_err(|_| {
                    PorticoError::InvalidConfig("PORTICO_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PORTICO_HOST", "127.0.0.1"),
                api_prefix: normalize_prefix(&get_env_or("PORTICO_API_PREFIX", DEFAULT_API_PREFIX))?,
                max_retries: get_env_or("PORTICO_MAX_RETRIES", "20").parse().unwrap_or(20),
                retry_step_ms: get_env_or("PORTICO_RETRY_STEP_MS", "250")
                    .parse()
                    .unwrap_or(250),
                connect_timeout: get_env_or("PORTICO_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("PORTICO_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
            },
            clusters: parse_clusters(&get_env_or("PORTICO_CLUSTERS", ""))?,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

/// Parse the PORTICO_CLUSTERS value: comma-separated `id=url` pairs
fn parse_clusters(raw: &str) -> Result<Vec<ClusterEntry>> {
    let mut entries = Vec::new();

    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, url) = pair.split_once('=').ok_or_else(|| {
            PorticoError::InvalidConfig(format!(
                "PORTICO_CLUSTERS entry must be `id=url`, got: {}",
                pair
            ))
        })?;

        let id = id.trim();
        if id.is_empty() {
            return Err(PorticoError::InvalidConfig(
                "PORTICO_CLUSTERS entry has an empty cluster id".into(),
            ));
        }

        let url = Url::parse(url.trim()).map_err(|e| {
            PorticoError::InvalidConfig(format!(
                "PORTICO_CLUSTERS entry {} has an invalid URL: {}",
                id, e
            ))
        })?;

        // The forwarding transport speaks plain HTTP/1.1
        if url.scheme() != "http" {
            return Err(PorticoError::InvalidConfig(format!(
                "PORTICO_CLUSTERS entry {} has unsupported scheme: {}",
                id,
                url.scheme()
            )));
        }

        entries.push(ClusterEntry {
            id: id.to_string(),
            url,
        });
    }

    Ok(entries)
}

/// Validate and normalize the API prefix: leading slash, no trailing slash
fn normalize_prefix(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !trimmed.starts_with('/') || trimmed.len() < 2 {
        return Err(PorticoError::InvalidConfig(
            "PORTICO_API_PREFIX must be a non-root path starting with `/`".into(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
