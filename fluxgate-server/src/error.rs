use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Request-level failures with their HTTP status codes.
///
/// A safety rejection is not an error; it is reported through
/// [`crate::InferenceOutcome::Rejected`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed payload or empty prompt, detected before any model work
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Loading or warming a worker failed; the instance was discarded
    #[error("Worker activation failed: {0}")]
    Activation(String),

    /// The pipeline or safety classifier raised during inference
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The image host refused or could not be reached
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Request exceeded the {0:?} timeout")]
    Timeout(Duration),

    #[error("Internal server error")]
    Internal(String),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Activation(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Generation(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upload(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Activation(_) => "activation_error",
            Self::Generation(_) => "generation_error",
            Self::Upload(_) => "upload_error",
            Self::Timeout(_) => "timeout_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message that is safe to expose to API consumers
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(body)).into_response()
    }
}
