//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: HTTP-facing failures, converted into JSON error responses through
//!   actix's `ResponseError` trait.
//! - **BridgeError**: failures inside one call's audio bridge. Every variant is fatal to
//!   the session that raised it and to nothing else; recoverable protocol problems are
//!   modelled separately by `bridge::protocol::ProtocolError`.
//!
//! ## Error Categories:
//! - **Internal**: server-side problems (500)
//! - **BadRequest**: malformed request data (400)
//! - **NotFound**: no live session with that id (404)
//! - **Conflict**: the session cannot take the request in its current state (409)
//! - **ServiceUnavailable**: the bridge is at its session limit (503)

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// HTTP-level errors returned by request handlers.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::ServiceUnavailable("session limit reached".to_string()));
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Bad request errors (validation failures)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// The target exists but is not ready for this request
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No capacity for another media stream right now
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    fn kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

/// Converts errors into HTTP responses with a consistent JSON body:
///
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent media streams (50) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.kind().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = self.kind();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.message(),
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

/// Failures that end one call's audio bridge.
///
/// ## Session Impact:
/// None of these are retried. A transcoder that dies mid-call breaks the continuity of
/// the audio stream, so the session moves to `Failed`, closes the socket with an error
/// status and releases its process.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The transcoder binary is missing or could not be launched
    #[error("failed to start transcoder `{program}`: {source}")]
    PipeStart {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a batch to the transcoder failed (usually a broken pipe)
    #[error("failed to write to transcoder: {0}")]
    PipeWrite(#[source] std::io::Error),

    /// Reading converted audio back from the transcoder failed
    #[error("failed to read from transcoder: {0}")]
    PipeRead(#[source] std::io::Error),

    /// The transcoder has already been drained and stopped
    #[error("transcoder pipe is closed")]
    PipeClosed,

    /// The provider announced an audio encoding we cannot transcode
    #[error("unsupported media encoding `{0}`")]
    UnsupportedEncoding(String),

    /// The recognition sink rejected audio or failed to start/stop
    #[error("recognition sink error: {0}")]
    Recognition(String),
}

pub type AppResult<T> = Result<T, AppError>;
