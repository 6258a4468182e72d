//! Workflow version history. Append-only.

use chrono::Utc;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::{DbError, models::WorkflowVersionRow};

const VERSION_COLUMNS: &str = "id, workflow_id, version_number, name, dag_json, created_at";

pub async fn insert_version<'e>(
    exec: impl PgExecutor<'e>,
    workflow_id: Uuid,
    version_number: i32,
    name: &str,
    dag_json: &serde_json::Value,
) -> Result<WorkflowVersionRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowVersionRow>(&format!(
        r#"
        INSERT INTO workflow_versions (id, workflow_id, version_number, name, dag_json, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {VERSION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(workflow_id)
    .bind(version_number)
    .bind(name)
    .bind(dag_json)
    .bind(Utc::now())
    .fetch_one(exec)
    .await?;

    Ok(row)
}

/// Highest version number for the workflow, `0` if it has none.
pub async fn current_version<'e>(exec: impl PgExecutor<'e>, workflow_id: Uuid) -> Result<i32, DbError> {
    let max: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version_number), 0) FROM workflow_versions WHERE workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_one(exec)
    .await?;
    Ok(max)
}

/// All versions of a workflow, newest first.
pub async fn list_versions(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowVersionRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowVersionRow>(&format!(
        r#"
        SELECT {VERSION_COLUMNS}
        FROM workflow_versions
        WHERE workflow_id = $1
        ORDER BY version_number DESC
        "#
    ))
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn get_version(
    pool: &PgPool,
    workflow_id: Uuid,
    version_number: i32,
) -> Result<WorkflowVersionRow, DbError> {
    sqlx::query_as::<_, WorkflowVersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 AND version_number = $2"
    ))
    .bind(workflow_id)
    .bind(version_number)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}
