use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{parse_id, parse_version};
use crate::{
    error::ApiError,
    service::{ServiceError, Workflow},
    AppState,
};
use db::models::{WorkflowSummaryRow, WorkflowVersionRow};
use engine::{Dag, Edge, Node};

#[derive(Deserialize)]
pub struct CreateWorkflowDto {
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Deserialize)]
pub struct UpdateWorkflowDto {
    pub name: Option<String>,
    pub nodes: Option<Vec<Node>>,
    pub edges: Option<Vec<Edge>>,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub search: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub id: Uuid,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Workflow> for WorkflowResponse {
    fn from(wf: Workflow) -> Self {
        Self {
            id: wf.id,
            name: wf.name,
            nodes: wf.dag.nodes,
            edges: wf.dag.edges,
            version: wf.version,
            created_at: wf.created_at,
            updated_at: wf.updated_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastExecution {
    pub id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub node_count: i32,
    pub edge_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<LastExecution>,
}

impl From<WorkflowSummaryRow> for WorkflowSummary {
    fn from(row: WorkflowSummaryRow) -> Self {
        let last_execution = row.last_exec_id.map(|id| LastExecution {
            id,
            status: row.last_exec_status.unwrap_or_default(),
            finished_at: row.last_exec_finished_at,
        });
        Self {
            id: row.id,
            name: row.name,
            updated_at: row.updated_at,
            node_count: row.node_count,
            edge_count: row.edge_count,
            last_execution,
        }
    }
}

#[derive(Serialize)]
pub struct WorkflowListResponse {
    pub items: Vec<WorkflowSummary>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_number: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<WorkflowVersionRow> for VersionSummary {
    fn from(v: WorkflowVersionRow) -> Self {
        Self {
            id: v.id,
            workflow_id: v.workflow_id,
            version_number: v.version_number,
            name: v.name,
            created_at: v.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionListResponse {
    pub versions: Vec<VersionSummary>,
    pub total: usize,
    pub current_version: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_number: i32,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WorkflowVersionRow> for VersionResponse {
    type Error = ServiceError;

    fn try_from(v: WorkflowVersionRow) -> Result<Self, Self::Error> {
        let dag = Dag::from_json(&v.dag_json)?;
        Ok(Self {
            id: v.id,
            workflow_id: v.workflow_id,
            version_number: v.version_number,
            name: v.name,
            nodes: dag.nodes,
            edges: dag.edges,
            created_at: v.created_at,
        })
    }
}

pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<CreateWorkflowDto>, JsonRejection>,
) -> Result<(StatusCode, Json<WorkflowResponse>), ApiError> {
    let Json(payload) = payload?;
    let dag = Dag::new(payload.nodes, payload.edges);
    let wf = state.workflows.create(&payload.name, &dag).await?;
    Ok((StatusCode::CREATED, Json(wf.into())))
}

pub async fn get(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let id = parse_id(&id, ServiceError::WorkflowNotFound)?;
    let wf = state.workflows.get(id).await?;
    Ok(Json(wf.into()))
}

/// Sending either `nodes` or `edges` replaces the whole DAG; a missing half
/// counts as empty.
pub async fn update(
    Path(id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<UpdateWorkflowDto>, JsonRejection>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let id = parse_id(&id, ServiceError::WorkflowNotFound)?;
    let Json(payload) = payload?;
    let dag = match (payload.nodes, payload.edges) {
        (None, None) => None,
        (nodes, edges) => Some(Dag::new(nodes.unwrap_or_default(), edges.unwrap_or_default())),
    };
    let wf = state
        .workflows
        .update(id, payload.name.as_deref(), dag.as_ref())
        .await?;
    Ok(Json(wf.into()))
}

pub async fn list(
    params: Result<Query<ListParams>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowListResponse>, ApiError> {
    let Query(params) = params?;
    let page = state
        .workflows
        .list(
            params.limit.unwrap_or(0),
            params.offset.unwrap_or(0),
            params.search.as_deref(),
        )
        .await?;
    Ok(Json(WorkflowListResponse {
        items: page.items.into_iter().map(Into::into).collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
    }))
}

pub async fn list_versions(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<VersionListResponse>, ApiError> {
    let id = parse_id(&id, ServiceError::WorkflowNotFound)?;
    let (versions, current_version) = state.workflows.list_versions(id).await?;
    Ok(Json(VersionListResponse {
        total: versions.len(),
        versions: versions.into_iter().map(Into::into).collect(),
        current_version,
    }))
}

pub async fn get_version(
    Path((id, version)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<VersionResponse>, ApiError> {
    let version = parse_version(&version)?;
    let id = parse_id(&id, ServiceError::NotFound("version"))?;
    let row = state.workflows.get_version(id, version).await?;
    Ok(Json(VersionResponse::try_from(row)?))
}

pub async fn restore(
    Path((id, version)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let version = parse_version(&version)?;
    let id = parse_id(&id, ServiceError::NotFound("version"))?;
    let wf = state.workflows.restore(id, version).await?;
    Ok(Json(wf.into()))
}
