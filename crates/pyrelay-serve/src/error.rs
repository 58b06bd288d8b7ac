use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pyrelay_core::wire::ErrorBody;

use crate::llm::LlmError;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::Validation(_) => StatusCode::BAD_REQUEST,
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::Llm(LlmError::Unreachable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Llm(LlmError::TimedOut) => StatusCode::GATEWAY_TIMEOUT,
            ServeError::Llm(_) => StatusCode::BAD_GATEWAY,
            ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ServeError {
    fn from(rejection: JsonRejection) -> Self {
        ServeError::Validation(rejection.body_text())
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
