//! Error types for the proxy

use thiserror::Error;

pub use edgeproxy_core::StageError;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Main error type for the proxy
#[derive(Error, Debug)]
#[allow(clippy::result_large_err)]
pub enum ProxyError {
    /// Rejected locally while the circuit breaker is open
    #[error("circuit breaker open")]
    CircuitOpen,

    /// gRPC status returned by the broker gateway
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC channel error
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// HTTP request failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP response with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// The record stream ended with an error
    #[error("source error: {0}")]
    Source(#[from] StageError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True when the error describes the downstream broker gateway
    ///
    /// Only these count against the circuit breaker. Admission rejections,
    /// source errors and local setup errors do not.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Grpc(_)
                | ProxyError::Transport(_)
                | ProxyError::Http(_)
                | ProxyError::HttpStatus { .. }
        )
    }

    /// True for the local circuit-breaker rejection
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ProxyError::CircuitOpen)
    }
}

impl From<prometheus::Error> for ProxyError {
    fn from(err: prometheus::Error) -> Self {
        ProxyError::Metrics(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}
