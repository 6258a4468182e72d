//! Workflow CRUD operations.

use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    DbError,
    models::{WorkflowChange, WorkflowListQuery, WorkflowRow, WorkflowSummaryRow},
    repository::versions,
};

const WORKFLOW_COLUMNS: &str = "id, name, dag_json, created_at, updated_at";

/// Insert a new workflow and its version 1 in a single transaction.
///
/// If the version write fails the workflow row is rolled back too.
pub async fn create_workflow(
    pool: &PgPool,
    name: &str,
    dag_json: &serde_json::Value,
) -> Result<WorkflowRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, WorkflowRow>(&format!(
        r#"
        INSERT INTO workflows (id, name, dag_json, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        RETURNING {WORKFLOW_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(name)
    .bind(dag_json)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    versions::insert_version(&mut *tx, id, 1, name, dag_json).await?;

    tx.commit().await?;
    Ok(row)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(exec)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

pub async fn workflow_exists(pool: &PgPool, id: Uuid) -> Result<bool, DbError> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM workflows WHERE id = $1)")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

/// One page of workflow summaries (most recently updated first) and the
/// total number of workflows matching the search.
///
/// The last execution of each workflow is picked by
/// `finished_at DESC NULLS LAST, started_at DESC`.
pub async fn list_workflow_summaries(
    pool: &PgPool,
    query: &WorkflowListQuery,
) -> Result<(Vec<WorkflowSummaryRow>, i64), DbError> {
    let pattern = query
        .search
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", escape_like(s)));

    let mut page: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT
            w.id,
            w.name,
            w.updated_at,
            COALESCE(jsonb_array_length(w.dag_json->'nodes'), 0) AS node_count,
            COALESCE(jsonb_array_length(w.dag_json->'edges'), 0) AS edge_count,
            e.id AS last_exec_id,
            e.status AS last_exec_status,
            e.finished_at AS last_exec_finished_at
        FROM workflows w
        LEFT JOIN LATERAL (
            SELECT id, status, finished_at
            FROM executions
            WHERE workflow_id = w.id
            ORDER BY finished_at DESC NULLS LAST, started_at DESC
            LIMIT 1
        ) e ON true
        "#,
    );
    if let Some(pattern) = &pattern {
        page.push(" WHERE w.name ILIKE ").push_bind(pattern.clone());
    }
    page.push(" ORDER BY w.updated_at DESC LIMIT ")
        .push_bind(query.limit)
        .push(" OFFSET ")
        .push_bind(query.offset);

    let rows = page
        .build_query_as::<WorkflowSummaryRow>()
        .fetch_all(pool)
        .await?;

    let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM workflows w");
    if let Some(pattern) = pattern {
        count.push(" WHERE w.name ILIKE ").push_bind(pattern);
    }
    let total: i64 = count.build_query_scalar::<i64>().fetch_one(pool).await?;

    Ok((rows, total))
}

/// Apply a [`WorkflowChange`] atomically.
///
/// The workflow row is locked with `FOR UPDATE` so version numbers are
/// allocated without gaps or races, then the snapshots are appended and the
/// current `(name, dag)` overwritten.
pub async fn apply_workflow_change(
    pool: &PgPool,
    change: &WorkflowChange,
) -> Result<WorkflowRow, DbError> {
    let mut tx = pool.begin().await?;

    let locked_at: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT updated_at FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(change.id)
            .fetch_optional(&mut *tx)
            .await?;

    match locked_at {
        None => return Err(DbError::NotFound),
        Some(ts) if ts != change.expected_updated_at => {
            return Err(DbError::Conflict(format!("workflow {}", change.id)));
        }
        Some(_) => {}
    }

    let mut next = versions::current_version(&mut *tx, change.id).await? + 1;
    for snapshot in &change.snapshots {
        versions::insert_version(&mut *tx, change.id, next, &snapshot.name, &snapshot.dag_json)
            .await?;
        next += 1;
    }

    let row = sqlx::query_as::<_, WorkflowRow>(&format!(
        r#"
        UPDATE workflows
        SET name = $1, dag_json = $2, updated_at = $3
        WHERE id = $4
        RETURNING {WORKFLOW_COLUMNS}
        "#
    ))
    .bind(&change.name)
    .bind(&change.dag_json)
    .bind(Utc::now())
    .bind(change.id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
