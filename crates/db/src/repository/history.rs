//! Activity history: one row per activity call of an execution.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::ActivityEventRow};

pub async fn load_history(pool: &PgPool, execution_id: Uuid) -> Result<Vec<ActivityEventRow>, DbError> {
    let rows = sqlx::query_as::<_, ActivityEventRow>(
        r#"
        SELECT execution_id, seq, activity, input_json, output_json, error, recorded_at
        FROM activity_events
        WHERE execution_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn get_history_event(
    pool: &PgPool,
    execution_id: Uuid,
    seq: i32,
) -> Result<Option<ActivityEventRow>, DbError> {
    let row = sqlx::query_as::<_, ActivityEventRow>(
        r#"
        SELECT execution_id, seq, activity, input_json, output_json, error, recorded_at
        FROM activity_events
        WHERE execution_id = $1 AND seq = $2
        "#,
    )
    .bind(execution_id)
    .bind(seq)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Insert an event; a second write for the same `(execution_id, seq)` is
/// ignored and reported as `false`.
pub async fn append_history(pool: &PgPool, event: &ActivityEventRow) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO activity_events
            (execution_id, seq, activity, input_json, output_json, error, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (execution_id, seq) DO NOTHING
        "#,
    )
    .bind(event.execution_id)
    .bind(event.seq)
    .bind(&event.activity)
    .bind(&event.input_json)
    .bind(&event.output_json)
    .bind(&event.error)
    .bind(event.recorded_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
