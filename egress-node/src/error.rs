use thiserror::Error;

/// Errors that can occur in the egress node library
#[derive(Error, Debug)]
pub enum EgressError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node identity load/generation error
    #[error("Identity error: {0}")]
    Identity(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Coordinator API error
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// Coordinator rate limited the request; retried with backoff
    #[error("Rate limited: retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Relay link error
    #[error("Relay link error: {0}")]
    RelayLink(String),

    /// Packet could not be parsed or forwarded
    #[error("Forwarding error: {0}")]
    Forwarding(String),

    /// STUN probe error
    #[error("STUN error: {0}")]
    Stun(String),

    /// OS NAT/forwarding error
    #[error("NAT error: {0}")]
    Nat(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using EgressError
pub type Result<T> = std::result::Result<T, EgressError>;

impl From<serde_json::Error> for EgressError {
    fn from(err: serde_json::Error) -> Self {
        EgressError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for EgressError {
    fn from(err: reqwest::Error) -> Self {
        EgressError::Coordinator(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EgressError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        EgressError::RelayLink(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EgressError::Nat("masquerade rule failed".to_string());
        assert_eq!(err.to_string(), "NAT error: masquerade rule failed");
    }

    #[test]
    fn test_rate_limited_display() {
        let err = EgressError::RateLimited {
            retry_after_seconds: 10,
        };
        assert_eq!(err.to_string(), "Rate limited: retry after 10s");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err: EgressError = io_err.into();
        assert!(matches!(err, EgressError::Io(_)));
    }
}
