use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::parse_id;
use crate::{error::ApiError, service::ServiceError, AppState};
use db::models::ExecutionRow;

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<ExecutionRow> for ExecutionResponse {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            status: row.status,
            result: row.result_json,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        }
    }
}

#[derive(Serialize)]
pub struct RunResponse {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
}

#[derive(Serialize)]
pub struct ExecutionListResponse {
    pub workflow_id: Uuid,
    pub executions: Vec<ExecutionResponse>,
    pub total: i64,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub execution_id: Uuid,
    pub cancel_requested: bool,
}

pub async fn run(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let workflow_id = parse_id(&id, ServiceError::WorkflowNotFound)?;
    let exec = state.executions.start(workflow_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunResponse {
            execution_id: exec.id,
            workflow_id,
            status: exec.status,
        }),
    ))
}

pub async fn get(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let id = parse_id(&id, ServiceError::NotFound("execution"))?;
    let exec = state.executions.get(id).await?;
    Ok(Json(exec.into()))
}

pub async fn list(
    Path(id): Path<String>,
    params: Result<Query<ListParams>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionListResponse>, ApiError> {
    let workflow_id = parse_id(&id, ServiceError::WorkflowNotFound)?;
    let Query(params) = params?;
    let (rows, total) = state
        .executions
        .list(
            workflow_id,
            params.limit.unwrap_or(0),
            params.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(ExecutionListResponse {
        workflow_id,
        executions: rows.into_iter().map(Into::into).collect(),
        total,
    }))
}

pub async fn cancel(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let execution_id = parse_id(&id, ServiceError::NotFound("execution"))?;
    state.executions.cancel(execution_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            execution_id,
            cancel_requested: true,
        }),
    ))
}
