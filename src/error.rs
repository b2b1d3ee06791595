//! # Error Handling
//!
//! HTTP-facing error type. Component errors (`ServiceError` and everything
//! it wraps) are converted into `AppError` at the handler boundary, which
//! decides the status code and renders the JSON body.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "voice_unavailable",
//!     "message": "voice 'amy' is not available for model ...",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//! `type` is the machine-readable kind of the underlying error; `message`
//! carries its full diagnostic text, including engine stderr where there is
//! one.

use crate::service::ServiceError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::convert::Infallible;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Server-side failure with a specific kind (engine crash, fetch failure, ...)
    Internal { kind: &'static str, message: String },

    /// The request could not be served as sent
    BadRequest { kind: &'static str, message: String },

    /// The service is not ready (missing models or binaries)
    Unavailable(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest {
            kind: "bad_request",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Internal {
            kind: "internal_error",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Internal { .. } | AppError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Internal { kind, .. } | AppError::BadRequest { kind, .. } => *kind,
            AppError::Unavailable(_) => "unavailable",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal { message, .. } | AppError::BadRequest { message, .. } => message,
            AppError::Unavailable(message) => message,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal { message, .. } => write!(f, "Internal error: {}", message),
            AppError::BadRequest { message, .. } => write!(f, "Bad request: {}", message),
            AppError::Unavailable(message) => write!(f, "Service unavailable: {}", message),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        if err.is_client_error() {
            AppError::BadRequest { kind, message }
        } else {
            AppError::Internal { kind, message }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(format!("{:#}", err))
    }
}

/// The blocking pool went away or the job panicked.
impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<Infallible> for AppError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl From<tokio::sync::AcquireError> for AppError {
    fn from(_: tokio::sync::AcquireError) -> Self {
        AppError::Unavailable("job queue is closed".to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
