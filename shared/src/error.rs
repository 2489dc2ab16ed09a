//! Error types for Tunnelgate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint missing or malformed when the tunnel is built.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The tunnel rejected or dropped a request.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// HTTP status a gateway should answer with when this error ends a request.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Configuration(_) => 500,
            Error::Timeout => 504,
            _ => 502,
        }
    }
}
