use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::services::federation::{QueryError, QueryErrorBody};

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub body: QueryErrorBody,
}

impl AppError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: QueryErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        let status = if matches!(err, QueryError::Cancelled) {
            StatusCode::SERVICE_UNAVAILABLE
        } else if err.is_batch_level() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            body: err.to_api_error(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
