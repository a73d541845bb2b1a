use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Every failure the API can surface. A single variation-call failure
/// terminates only the remaining loop; preprocessing and missing-field
/// failures terminate the whole session before any network call.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    MissingField(String),
    #[error("preprocessing failed: {0}")]
    Preprocess(String),
    #[error("style analysis failed: {0}")]
    Analysis(String),
    #[error("generation failed: {0}")]
    GenerationCall(String),
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::MissingField(_) => StatusCode::BAD_REQUEST,
            AppError::Analysis(_) | AppError::GenerationCall(_) => StatusCode::BAD_GATEWAY,
            AppError::Preprocess(_) | AppError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kind() {
        assert_eq!(
            AppError::MissingField("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::GenerationCall("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Preprocess("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
