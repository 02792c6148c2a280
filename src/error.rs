//! # Error Handling
//!
//! Custom error types shared by every component of the dialer, plus their
//! conversion into HTTP responses for the local relay/diagnostics server.
//!
//! ## Error Categories:
//! - **Handshake**: the voice session never opened (fatal to the call's AI participation)
//! - **Session**: a live session failed (send failure, reconnects exhausted)
//! - **Driver**: the browser page refused an action (selector missing, script error)
//! - **Audio**: malformed PCM/WAV data or a playback sink failure
//! - **Config/Validation**: bad configuration values
//!
//! ## Why one enum:
//! The call runner has to decide a terminal outcome for every failure path, so
//! all components report through the same type and the runner matches on it.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// use voice_dialer::error::AppError;
/// let err = AppError::Handshake("401 Unauthorized".to_string());
/// assert!(err.to_string().contains("handshake"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Internal errors (task failures, poisoned state, etc.)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested resource was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// User input failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The conversational session could not complete its opening handshake
    #[error("Session handshake failed: {0}")]
    Handshake(String),

    /// The conversational session failed after it was established
    #[error("Session error: {0}")]
    Session(String),

    /// The browser page driver failed to perform an action
    #[error("Page driver error: {0}")]
    Driver(String),

    /// Audio data or playback problems
    #[error("Audio error: {0}")]
    Audio(String),

    /// Filesystem and process I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Machine-readable error type used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Handshake(_) => "handshake_error",
            AppError::Session(_) => "session_error",
            AppError::Driver(_) => "driver_error",
            AppError::Audio(_) => "audio_error",
            AppError::Io(_) => "io_error",
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - Handshake/Session → 502 (the upstream voice service misbehaved)
/// - everything else → 500
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Server port cannot be 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Handshake(_) | AppError::Session(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error, it becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors almost always come from a peer sending malformed data,
/// so they map to BadRequest rather than Internal.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Configuration loading failures (bad config.toml syntax, wrong env types).
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
