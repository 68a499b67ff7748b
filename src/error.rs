//! # Error Handling
//!
//! One error type covers both the session lifecycle taxonomy and the HTTP layer.
//!
//! ## Propagation:
//! - Inner components (chunk store, transcoder, pipeline adapter, transports)
//!   return [`AppResult`] and propagate with `?`.
//! - Synchronous endpoints turn the error straight into a JSON response through
//!   [`ResponseError`].
//! - The background processing task is the only place that catches errors: it
//!   logs them, pushes a diagnostic text to the client if a channel is
//!   attached, and closes the session.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "session_conflict",
//!     "message": "A recording is already active for client 'c1'",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::audio::session::SessionState;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;

/// Every failure the service can report.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// `start` called while a session for the client is still live
    #[error("A recording is already active for client '{0}'")]
    SessionConflict(String),

    /// Operation on a client with no live session
    #[error("No active session for client '{0}'")]
    SessionNotFound(String),

    /// Session exists but is past the point where the operation makes sense
    #[error("Session for client '{client_id}' is {state}, expected recording")]
    InvalidState {
        client_id: String,
        state: SessionState,
    },

    /// The registry is full
    #[error("Maximum concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),

    /// Disk write, move or delete failed
    #[error("I/O failure while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Container could not be decoded into a waveform
    #[error("Could not decode recording: {0}")]
    Transcode(String),

    /// The external voice pipeline failed
    #[error("Voice pipeline failed: {0}")]
    Pipeline(String),

    /// Sending on the push channel failed
    #[error("Push channel failed: {0}")]
    Transport(String),

    /// Processing or streaming ran past the configured deadline
    #[error("Processing exceeded the {0:?} deadline")]
    ProcessingTimeout(Duration),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Build an [`AppError::Io`] with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Io {
            context: context.into(),
            source,
        }
    }

    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::SessionConflict(_) => "session_conflict",
            AppError::SessionNotFound(_) => "session_not_found",
            AppError::InvalidState { .. } => "invalid_state",
            AppError::CapacityExceeded(_) => "capacity_exceeded",
            AppError::Io { .. } => "io_failure",
            AppError::Transcode(_) => "transcode_failure",
            AppError::Pipeline(_) => "pipeline_failure",
            AppError::Transport(_) => "transport_failure",
            AppError::ProcessingTimeout(_) => "processing_timeout",
            AppError::BadRequest(_) => "bad_request",
            AppError::Config(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// Maps each error to an HTTP status and the JSON error body.
///
/// ## HTTP Status Code Mapping:
/// - SessionConflict/InvalidState → 409
/// - SessionNotFound → 404
/// - CapacityExceeded → 503
/// - Transcode → 422, Pipeline → 502, ProcessingTimeout → 504
/// - BadRequest → 400
/// - everything else → 500
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::SessionConflict(_) | AppError::InvalidState { .. } => StatusCode::CONFLICT,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Transcode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Pipeline(_) => StatusCode::BAD_GATEWAY,
            AppError::ProcessingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Io { .. }
            | AppError::Transport(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
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
        AppError::Config(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
