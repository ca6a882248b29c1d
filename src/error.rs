//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **`AppError`**: what the HTTP surface returns. Every variant maps to a status
//!   code and a JSON body through actix-web's `ResponseError` trait.
//! - **`VoiceError`**: what the audio pipeline returns. It is derived with
//!   `thiserror` because most of its variants wrap errors from other crates
//!   (Opus, IO, HTTP) and `#[from]` gives us the conversions for free.
//!
//! ## Key Rust Concepts:
//! - **Result<T, E>**: every fallible pipeline step returns `VoiceResult<T>`
//! - **From trait**: lets `?` convert a lower-level error into ours automatically
//! - **Display**: `AppError` implements it by hand, `VoiceError` through `#[error(...)]`
//!
//! ## Error policy in the pipeline:
//! Most pipeline errors are *not* fatal. A bad Opus frame is dropped, a failed
//! synthesis drops one sentence, and a closed channel just stops sending. Only
//! the callers decide what a failure means for the session.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by the HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found (e.g. an unknown session id)
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "speech_threshold must be between 0 and 1",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they become 400s.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Pipeline errors surfacing through HTTP (e.g. a rejected runtime threshold).
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::OutOfRange { .. } | VoiceError::Config(_) => {
                AppError::ValidationError(err.to_string())
            }
            VoiceError::SessionNotFound(id) => AppError::NotFound(format!("session {}", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised by the voice pipeline components.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("Opus codec error: {0}")]
    Codec(#[from] opus::Error),

    #[error("Invalid audio frame: {0}")]
    InvalidFrame(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Speech probability model error: {0}")]
    Model(String),

    #[error("Speech recognition error: {0}")]
    Stt(String),

    #[error("Speech synthesis error: {0}")]
    Tts(String),

    #[error("Language model error: {0}")]
    Llm(String),

    #[error("Device directory error: {0}")]
    Device(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session limit reached ({0} concurrent sessions)")]
    SessionLimit(usize),

    #[error("Outbound channel is closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VoiceError {
    /// Builds an `OutOfRange` error for a numeric setting.
    pub fn out_of_range(name: &'static str, value: f64, min: f64, max: f64) -> Self {
        VoiceError::OutOfRange {
            name,
            value,
            min,
            max,
        }
    }
}

/// Shorthand for `Result<T, VoiceError>`.
pub type VoiceResult<T> = Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = VoiceError::out_of_range("speech_threshold", 1.5, 0.0, 1.0);
        assert_eq!(
            err.to_string(),
            "speech_threshold must be between 0 and 1, got 1.5"
        );
    }

    #[test]
    fn test_voice_error_maps_to_http_status() {
        let app: AppError = VoiceError::out_of_range("factor", 4.0, 1.0, 3.0).into();
        assert!(matches!(app, AppError::ValidationError(_)));

        let app: AppError = VoiceError::SessionNotFound("abc".to_string()).into();
        assert_eq!(
            app.error_response().status(),
            actix_web::http::StatusCode::NOT_FOUND
        );

        let app: AppError = VoiceError::ChannelClosed.into();
        assert!(matches!(app, AppError::Internal(_)));
    }
}
