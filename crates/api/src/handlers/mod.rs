//! Axum handlers for the management API.

pub mod executions;
pub mod workflows;

use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{error::ApiError, service::ServiceError};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// An id that is not a UUID cannot name an existing resource, so it is
/// reported as `missing`.
fn parse_id(raw: &str, missing: ServiceError) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError(missing))
}

fn parse_version(raw: &str) -> Result<i32, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid version number"))
}
