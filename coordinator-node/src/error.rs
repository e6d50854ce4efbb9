use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors that can occur in the coordinator library
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Malformed request shape, out-of-range values, bad identifiers
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid bearer token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Node, session, or route lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// No active nodes or no feasible route
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Node HTTP call failed or timed out; WS send to an attached session failed
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Cache or store transient error; retried with jitter by callers
    #[error("Transient error: {0}")]
    Transient(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using CoordinatorError
pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for CoordinatorError {
    fn from(err: reqwest::Error) -> Self {
        CoordinatorError::Upstream(err.to_string())
    }
}

impl CoordinatorError {
    /// HTTP status this error translates to at the API boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::Upstream(_)
            | CoordinatorError::Transient(_)
            | CoordinatorError::Io(_)
            | CoordinatorError::Serialization(_)
            | CoordinatorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
