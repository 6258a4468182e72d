//! Run-task queue repository functions.
//!
//! The queue is backed by the `run_tasks` table. Workers claim tasks with
//! `SELECT … FOR UPDATE SKIP LOCKED` and hold them under a lease; a task
//! whose lease expired (its worker died) becomes claimable again.

use chrono::Utc;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::{
    DbError,
    models::{RunTaskRow, TaskStatus},
    store::Lease,
};

const TASK_COLUMNS: &str = "id, execution_id, workflow_id, task_queue, status, attempts, \
     max_attempts, lease_owner, lease_expires_at, cancel_requested, last_error, created_at, updated_at";

/// Attempts before a task is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Enqueue a new task for the given execution.
pub async fn enqueue_task<'e>(
    exec: impl PgExecutor<'e>,
    execution_id: Uuid,
    workflow_id: Uuid,
    task_queue: &str,
) -> Result<RunTaskRow, DbError> {
    let now = Utc::now();

    let row = sqlx::query_as::<_, RunTaskRow>(&format!(
        r#"
        INSERT INTO run_tasks
            (id, execution_id, workflow_id, task_queue, status, attempts, max_attempts,
             cancel_requested, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'pending', 0, $5, FALSE, $6, $6)
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(execution_id)
    .bind(workflow_id)
    .bind(task_queue)
    .bind(DEFAULT_MAX_ATTEMPTS)
    .bind(now)
    .fetch_one(exec)
    .await?;

    Ok(row)
}

/// Atomically fetch the oldest runnable task and lease it to `lease.owner`.
///
/// Returns `None` if nothing is runnable.
pub async fn claim_next_task(
    pool: &PgPool,
    task_queue: &str,
    lease: &Lease,
) -> Result<Option<RunTaskRow>, DbError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let candidate: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id
        FROM run_tasks
        WHERE task_queue = $1
          AND (status = 'pending' OR (status = 'running' AND lease_expires_at < $2))
        ORDER BY created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(task_queue)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(task_id) = candidate else {
        tx.rollback().await?;
        return Ok(None);
    };

    let row = sqlx::query_as::<_, RunTaskRow>(&format!(
        r#"
        UPDATE run_tasks
        SET status = 'running', attempts = attempts + 1, lease_owner = $1,
            lease_expires_at = $2, updated_at = $3
        WHERE id = $4
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(&lease.owner)
    .bind(now + lease.duration)
    .bind(now)
    .bind(task_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row))
}

/// Extend the lease if still held by `lease.owner`; report the cancel flag.
pub async fn heartbeat_task(pool: &PgPool, task_id: Uuid, lease: &Lease) -> Result<bool, DbError> {
    let now = Utc::now();
    let cancel: Option<bool> = sqlx::query_scalar(
        r#"
        UPDATE run_tasks
        SET lease_expires_at = $1, updated_at = $2
        WHERE id = $3 AND lease_owner = $4 AND status = 'running'
        RETURNING cancel_requested
        "#,
    )
    .bind(now + lease.duration)
    .bind(now)
    .bind(task_id)
    .bind(&lease.owner)
    .fetch_optional(pool)
    .await?;

    match cancel {
        Some(flag) => Ok(flag),
        None => Err(DbError::Conflict(format!("lease on task {task_id} lost"))),
    }
}

/// Mark a task as completed.
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE run_tasks SET status = $1, lease_expires_at = NULL, updated_at = $2 WHERE id = $3",
    )
    .bind(TaskStatus::Completed.as_str())
    .bind(Utc::now())
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Return a task to the queue (or dead-letter it when `max_attempts` is reached).
pub async fn release_task(pool: &PgPool, task_id: Uuid, error: &str) -> Result<(), DbError> {
    sqlx::query(
        r#"
        UPDATE run_tasks
        SET status = CASE WHEN attempts >= max_attempts THEN 'dead_lettered' ELSE 'pending' END,
            lease_owner = NULL,
            lease_expires_at = NULL,
            last_error = $1,
            updated_at = $2
        WHERE id = $3
        "#,
    )
    .bind(error)
    .bind(Utc::now())
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn request_cancel(pool: &PgPool, execution_id: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE run_tasks SET cancel_requested = TRUE, updated_at = $1 WHERE execution_id = $2",
    )
    .bind(Utc::now())
    .bind(execution_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
