//! Error taxonomy for the balancer.
//!
//! Only the API layer turns these into HTTP statuses. The node registry and
//! the caches never produce an `AppError`; they answer with options, flags
//! and counts.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("External service error: {0}")]
    ExternalService(#[from] ExternalServiceError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Access denied: {0}")]
    Authorization(String),

    #[error("Quota exceeded for access id {0}")]
    QuotaExceeded(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

}

/// Fatal startup configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid node entry #{index}: {message}")]
    InvalidNode { index: usize, message: String },

    #[error("Node list is empty")]
    EmptyNodeList,

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Problems with the inbound request itself
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Malformed JSON-RPC body: {0}")]
    MalformedBody(String),

    #[error("Unknown data source: {0}")]
    UnknownDataSource(String),
}

/// Failures talking to the backend node fleet
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("No available node for chain {0}")]
    NoAvailableNode(String),

    #[error("All {attempts} attempts failed for chain {chain}")]
    AttemptsExhausted { chain: String, attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Failures talking to the authorization service or telemetry sink
#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<reqwest::Error> for ExternalServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::ParseError(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}
