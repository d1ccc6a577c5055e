use crate::config::ValidationError;
use crate::jsonrpc::{INTERNAL_ERROR, METHOD_NOT_FOUND};
use http::StatusCode;
use thiserror::Error;

/// Result type alias for rpc-router operations
pub type Result<T, E = RouterError> = std::result::Result<T, E>;

/// Errors that stop the router from starting or serving
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Why a single call could not be answered by an upstream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("no upstream supports method {0}")]
    MethodNotSupported(String),

    #[error("no upstreams support this block: {0}")]
    UnsupportedBlock(u64),

    #[error("no upstream available: {stage}: {reason}")]
    NoUpstream { stage: &'static str, reason: String },

    #[error("upstream {0} timed out")]
    UpstreamTimeout(String),

    #[error("upstream {upstream} request failed: {reason}")]
    UpstreamFailed { upstream: String, reason: String },
}

impl RouteError {
    /// JSON-RPC error code reported to the caller
    pub fn code(&self) -> i64 {
        match self {
            RouteError::MethodNotSupported(_) => METHOD_NOT_FOUND,
            _ => INTERNAL_ERROR,
        }
    }

    /// HTTP status of a single (non-batch) response carrying this error
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_GATEWAY
    }

    /// Short tag for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::MethodNotSupported(_) => "method_not_supported",
            RouteError::UnsupportedBlock(_) => "unsupported_block",
            RouteError::NoUpstream { .. } => "no_upstream",
            RouteError::UpstreamTimeout(_) => "upstream_timeout",
            RouteError::UpstreamFailed { .. } => "upstream_failed",
        }
    }
}
