//! Error types for fedcourier
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! Inbound signature verification has its own taxonomy in
//! [`crate::federation::VerifyError`] and never surfaces as `AppError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Request was not authenticated (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local private key is malformed; nothing may be sent unsigned (500)
    #[error("Signing error: {0}")]
    Signing(String),

    /// Remote actor key could not be resolved (502)
    #[error("Key resolution failed: {0}")]
    KeyResolution(String),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Durable queue store is unreachable (503)
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[from] sqlx::Error),

    /// Queue payload could not be (de)serialized (500)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Short label used for the `errors_total` metric
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::Validation(_) => "validation",
            AppError::Signing(_) => "signing",
            AppError::KeyResolution(_) => "key_resolution",
            AppError::HttpClient(_) => "http_client",
            AppError::QueueUnavailable(_) => "queue_unavailable",
            AppError::Serialization(_) => "serialization",
            AppError::Config(_) => "config",
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::KeyResolution(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::QueueUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Queue unavailable".to_string(),
            ),
            AppError::Signing(_) | AppError::Serialization(_) | AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
