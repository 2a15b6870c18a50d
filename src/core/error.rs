use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid graph_ref: {0}")]
    InvalidGraphRef(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No uplink URL is available")]
    NoUplinkAvailable,

    #[error("Uplink error: {0}")]
    Uplink(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pinning error: {0}")]
    Pinning(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidGraphRef(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoUplinkAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Uplink(_)
            | Self::Cache(_)
            | Self::Config(_)
            | Self::Pinning(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            RelayError::InvalidRequest("bad body".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::InvalidGraphRef("acme".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::NotFound("pq:abc:0".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::NoUplinkAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::Uplink("status 500".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            RelayError::Cache("set failed".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::InvalidGraphRef("acme".to_string());
        assert_eq!(err.to_string(), "Invalid graph_ref: acme");

        let err = RelayError::NoUplinkAvailable;
        assert_eq!(err.to_string(), "No uplink URL is available");
    }

    #[test]
    fn test_error_into_response() {
        let err = RelayError::NotFound("manifest".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
