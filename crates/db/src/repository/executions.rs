//! Execution repository functions.
//!
//! Status writes are guarded in SQL so that a terminal execution never
//! changes again: `RUNNING` is only reachable from `PENDING`, and the
//! terminal writes only match non-terminal rows.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{ExecutionRow, ExecutionStatus},
    repository::tasks,
};

const EXECUTION_COLUMNS: &str =
    "id, workflow_id, status, result_json, error, started_at, finished_at";

/// Create a new execution record in `PENDING` status and enqueue its run
/// task, in one transaction.
pub async fn create_execution(
    pool: &PgPool,
    execution_id: Uuid,
    workflow_id: Uuid,
    task_queue: &str,
) -> Result<ExecutionRow, DbError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, ExecutionRow>(&format!(
        r#"
        INSERT INTO executions (id, workflow_id, status, started_at)
        VALUES ($1, $2, $3, $4)
        RETURNING {EXECUTION_COLUMNS}
        "#
    ))
    .bind(execution_id)
    .bind(workflow_id)
    .bind(ExecutionStatus::Pending.as_str())
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tasks::enqueue_task(&mut *tx, execution_id, workflow_id, task_queue).await?;

    tx.commit().await?;
    Ok(row)
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRow, DbError> {
    sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

pub async fn list_executions(
    pool: &PgPool,
    workflow_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<(Vec<ExecutionRow>, i64), DbError> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        r#"
        SELECT {EXECUTION_COLUMNS}
        FROM executions
        WHERE workflow_id = $1
        ORDER BY started_at DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(workflow_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executions WHERE workflow_id = $1")
        .bind(workflow_id)
        .fetch_one(pool)
        .await?;

    Ok((rows, total))
}

/// Update the `status` (and `finished_at` for terminal states) of an
/// execution. Returns whether a row changed.
pub async fn update_execution_status(
    pool: &PgPool,
    execution_id: Uuid,
    status: ExecutionStatus,
) -> Result<bool, DbError> {
    let result = match status {
        ExecutionStatus::Completed | ExecutionStatus::Failed => {
            sqlx::query(
                r#"
                UPDATE executions
                SET status = $1, finished_at = $2
                WHERE id = $3 AND status NOT IN ('COMPLETED', 'FAILED')
                "#,
            )
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(execution_id)
            .execute(pool)
            .await?
        }
        ExecutionStatus::Running => {
            sqlx::query("UPDATE executions SET status = $1 WHERE id = $2 AND status = 'PENDING'")
                .bind(status.as_str())
                .bind(execution_id)
                .execute(pool)
                .await?
        }
        ExecutionStatus::Pending => return Ok(false),
    };

    Ok(result.rows_affected() > 0)
}

pub async fn complete_execution(
    pool: &PgPool,
    execution_id: Uuid,
    result_json: &serde_json::Value,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = 'COMPLETED', result_json = $1, error = NULL, finished_at = $2
        WHERE id = $3 AND status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .bind(result_json)
    .bind(Utc::now())
    .bind(execution_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn fail_execution(pool: &PgPool, execution_id: Uuid, error: &str) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = 'FAILED', error = $1, result_json = NULL, finished_at = $2
        WHERE id = $3 AND status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .bind(error)
    .bind(Utc::now())
    .bind(execution_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
