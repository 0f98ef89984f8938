//! Error types for the risk stream client.

use thiserror::Error;

/// Risk stream client error types
#[derive(Error, Debug)]
pub enum StreamError {
    /// Client is not configured (API URL or assistant id missing)
    #[error("Client not configured: {0}")]
    NotConfigured(String),

    /// Graph service could not be reached
    #[error("Service unreachable: {0}")]
    ServiceUnreachable(String),

    /// Graph service answered with a non-success status
    #[error("Service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Run creation failed while resuming a workflow
    #[error("Failed to create run: {0}")]
    RunCreation(String),

    /// Run cancellation failed
    #[error("Failed to cancel run {run_id}: {message}")]
    Cancel { run_id: String, message: String },

    /// Stream transport failure
    #[error("Stream error: {0}")]
    Stream(String),

    /// Invalid input supplied by the caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Step state persistence failed
    #[error("Step state storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] envy::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StreamError {
    /// Stable error code, used in log lines and user-facing notices
    pub fn error_code(&self) -> &'static str {
        match self {
            StreamError::NotConfigured(_) => "NOT_CONFIGURED",
            StreamError::ServiceUnreachable(_) => "SERVICE_UNAVAILABLE",
            StreamError::Status { status, .. } => error_codes::from_http_status(*status),
            StreamError::RunCreation(_) => "RUN_CREATION_FAILED",
            StreamError::Cancel { .. } => "CANCEL_FAILED",
            StreamError::Stream(_) => "STREAM_ERROR",
            StreamError::InvalidInput(_) => "INVALID_INPUT",
            StreamError::Storage(_) => "STORAGE_ERROR",
            StreamError::Config(_) => "CONFIG_ERROR",
            StreamError::Http(e) if e.is_timeout() => "TIMEOUT",
            StreamError::Http(e) if e.is_connect() => "SERVICE_UNAVAILABLE",
            StreamError::Http(_) => "HTTP_ERROR",
            StreamError::Url(_) => "INVALID_INPUT",
            StreamError::Serialization(_) => "SERIALIZATION_ERROR",
            StreamError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Connectivity errors are the only ones surfaced to the user as a notice.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StreamError::ServiceUnreachable(_) => true,
            StreamError::Http(e) => e.is_connect() || e.is_timeout(),
            StreamError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias for risk stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

pub mod error_codes {
    /// Map an HTTP status returned by the graph service to an error code
    pub fn from_http_status(status: u16) -> &'static str {
        match status {
            400 => "INVALID_INPUT",
            401 => "UNAUTHORIZED",
            403 => "PERMISSION_DENIED",
            404 => "NOT_FOUND",
            408 => "TIMEOUT",
            409 => "CONFLICT",
            422 => "UNPROCESSABLE_ENTITY",
            429 => "RATE_LIMITED",
            500 => "INTERNAL_ERROR",
            502 => "BAD_GATEWAY",
            503 => "SERVICE_UNAVAILABLE",
            504 => "GATEWAY_TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            StreamError::RunCreation("boom".to_string()).error_code(),
            "RUN_CREATION_FAILED"
        );
        assert_eq!(
            StreamError::Status {
                status: 409,
                body: String::new()
            }
            .error_code(),
            "CONFLICT"
        );
        assert_eq!(
            StreamError::NotConfigured("api_url".to_string()).error_code(),
            "NOT_CONFIGURED"
        );
    }

    #[test]
    fn test_run_creation_display() {
        let err = StreamError::RunCreation("connection refused".to_string());
        assert_eq!(err.to_string(), "Failed to create run: connection refused");
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(StreamError::ServiceUnreachable("down".to_string()).is_connectivity());
        assert!(StreamError::Status {
            status: 503,
            body: String::new()
        }
        .is_connectivity());
        assert!(!StreamError::InvalidInput("x".to_string()).is_connectivity());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(error_codes::from_http_status(401), "UNAUTHORIZED");
        assert_eq!(error_codes::from_http_status(504), "GATEWAY_TIMEOUT");
        assert_eq!(error_codes::from_http_status(999), "INTERNAL_ERROR");
    }
}
