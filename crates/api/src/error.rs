//! Mapping of service errors onto HTTP responses.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::service::ServiceError;

/// Error returned by every handler. Bodies are `{"error": "..."}`;
/// validation failures add the individual reasons under `details`.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(ServiceError::BadRequest(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::Validation(_) | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::WorkflowNotFound | ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self.0 {
            ServiceError::Validation(errors) => json!({
                "error": errors.join("; "),
                "details": errors,
            }),
            ServiceError::Internal(detail) => {
                error!(%detail, "request failed");
                json!({ "error": "internal server error" })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
