// Error types surfaced by the relay

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    BackendStatus { status: u16, body: String },

    #[error("Failed to get ollama models: {0}")]
    ModelListing(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::BackendUnreachable(_) | RelayError::BackendStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::ModelListing(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
