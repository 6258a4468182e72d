//! Workflow Service and version store.
//!
//! Every persisted workflow carries at least one version. Versions are
//! appended, never rewritten:
//!
//! - `create` writes version 1 together with the workflow.
//! - `update` snapshots the *pre-update* state as a new version when the DAG
//!   changes (canonically); name-only updates leave the history alone.
//! - `restore` snapshots the current state, then overwrites it with the
//!   chosen version.
//!
//! Writes go through [`Store::apply_workflow_change`], which rejects a change
//! computed from a stale read; those are recomputed and retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use db::{
    models::{
        VersionSnapshot, WorkflowChange, WorkflowListQuery, WorkflowRow, WorkflowSummaryRow,
        WorkflowVersionRow,
    },
    DbError, Store,
};
use engine::{validate, Dag};

use super::{canonical::canonical_eq, ServiceError};

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

/// How many times a change is recomputed after losing a race.
const MAX_CHANGE_ATTEMPTS: usize = 3;

/// A workflow with its parsed DAG and current version number.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub dag: Dag,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    fn from_row(row: WorkflowRow, version: i32) -> Result<Self, ServiceError> {
        Ok(Self {
            dag: Dag::from_json(&row.dag_json)?,
            id: row.id,
            name: row.name,
            // rows written before versioning existed report version 1
            version: version.max(1),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// One page of the workflow list, with the effective paging values.
#[derive(Debug, Clone)]
pub struct WorkflowPage {
    pub items: Vec<WorkflowSummaryRow>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub struct WorkflowService {
    store: Arc<dyn Store>,
}

impl WorkflowService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validate and persist a new workflow together with its version 1.
    #[instrument(skip(self, dag), fields(nodes = dag.nodes.len(), edges = dag.edges.len()))]
    pub async fn create(&self, name: &str, dag: &Dag) -> Result<Workflow, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::BadRequest("name is required".into()));
        }
        check(dag)?;

        let row = self.store.insert_workflow(name, &dag.to_json()?).await?;
        info!(workflow_id = %row.id, "workflow created");
        Workflow::from_row(row, 1)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> Result<Workflow, ServiceError> {
        let row = self.load(id).await?;
        let version = self.store.current_version(id).await?;
        Workflow::from_row(row, version)
    }

    /// Change the name and/or DAG of a workflow.
    ///
    /// An absent or blank `name` keeps the current one.
    #[instrument(skip(self, dag))]
    pub async fn update(
        &self,
        id: Uuid,
        name: Option<&str>,
        dag: Option<&Dag>,
    ) -> Result<Workflow, ServiceError> {
        // existence first, so an unknown id is a 404 even with a bad DAG
        self.load(id).await?;
        if let Some(dag) = dag {
            check(dag)?;
        }
        let new_dag = dag.map(Dag::to_json).transpose()?;
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        self.apply(id, |current, versions| {
            let mut snapshots = Vec::new();
            if versions == 0 {
                snapshots.push(VersionSnapshot::from(current));
            }
            let dag_json = match &new_dag {
                Some(new) if !canonical_eq(new, &current.dag_json) => {
                    snapshots.push(VersionSnapshot::from(current));
                    new.clone()
                }
                _ => current.dag_json.clone(),
            };
            Ok(WorkflowChange {
                id,
                expected_updated_at: current.updated_at,
                snapshots,
                name: name.map_or_else(|| current.name.clone(), str::to_owned),
                dag_json,
            })
        })
        .await
    }

    /// Make version `version_number` the current state again. The state
    /// being replaced is kept as the newest version.
    #[instrument(skip(self))]
    pub async fn restore(&self, id: Uuid, version_number: i32) -> Result<Workflow, ServiceError> {
        let target = self.get_version(id, version_number).await?;

        self.apply(id, |current, versions| {
            let mut snapshots = Vec::new();
            if versions == 0 {
                snapshots.push(VersionSnapshot::from(current));
            }
            snapshots.push(VersionSnapshot::from(current));
            Ok(WorkflowChange {
                id,
                expected_updated_at: current.updated_at,
                snapshots,
                name: target.name.clone(),
                dag_json: target.dag_json.clone(),
            })
        })
        .await
    }

    /// Summaries ordered by `updated_at` descending. A non-positive `limit`
    /// means the default; limits above the cap are clamped.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
        search: Option<&str>,
    ) -> Result<WorkflowPage, ServiceError> {
        let limit = if limit <= 0 { DEFAULT_LIST_LIMIT } else { limit.min(MAX_LIST_LIMIT) };
        let offset = offset.max(0);
        let query = WorkflowListQuery {
            limit,
            offset,
            search: search.map(str::to_owned),
        };
        let (items, total) = self.store.list_workflow_summaries(&query).await?;
        Ok(WorkflowPage { items, total, limit, offset })
    }

    /// All versions, newest first, and the current version number.
    #[instrument(skip(self))]
    pub async fn list_versions(
        &self,
        id: Uuid,
    ) -> Result<(Vec<WorkflowVersionRow>, i32), ServiceError> {
        let versions = self.store.list_versions(id).await?;
        let current = versions.first().map_or(0, |v| v.version_number);
        Ok((versions, current))
    }

    pub async fn get_version(
        &self,
        id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, ServiceError> {
        match self.store.get_version(id, version_number).await {
            Ok(v) => Ok(v),
            Err(DbError::NotFound) => Err(ServiceError::NotFound("version")),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowRow, ServiceError> {
        match self.store.get_workflow(id).await {
            Ok(row) => Ok(row),
            Err(DbError::NotFound) => Err(ServiceError::WorkflowNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the workflow, build a change from it and write it, starting over
    /// when another writer got there first.
    async fn apply<F>(&self, id: Uuid, build: F) -> Result<Workflow, ServiceError>
    where
        F: Fn(&WorkflowRow, i32) -> Result<WorkflowChange, ServiceError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(id).await?;
            let versions = self.store.current_version(id).await?;
            let change = build(&current, versions)?;
            let appended = change.snapshots.len();

            match self.store.apply_workflow_change(&change).await {
                Ok(row) => {
                    let version = self.store.current_version(id).await?;
                    debug!(workflow_id = %id, appended, version, "workflow change applied");
                    return Workflow::from_row(row, version);
                }
                Err(DbError::NotFound) => return Err(ServiceError::WorkflowNotFound),
                Err(DbError::Conflict(what)) if attempt < MAX_CHANGE_ATTEMPTS => {
                    warn!(workflow_id = %id, attempt, "concurrent change to {what}, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn check(dag: &Dag) -> Result<(), ServiceError> {
    let errors = validate(dag);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;
    use engine::{Edge, Node};
    use serde_json::json;

    fn dag(url: &str) -> Dag {
        Dag::new(
            vec![
                Node::new("s", "start", json!({"label": "Start"})),
                Node::new("h", "http", json!({"method": "GET", "url": url})),
                Node::new("o", "output", json!({})),
            ],
            vec![Edge::new("s", "h"), Edge::new("h", "o")],
        )
    }

    fn service() -> (Arc<MemoryStore>, WorkflowService) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), WorkflowService::new(store))
    }

    async fn numbers(svc: &WorkflowService, id: Uuid) -> Vec<i32> {
        let (versions, _) = svc.list_versions(id).await.unwrap();
        versions.iter().map(|v| v.version_number).collect()
    }

    #[tokio::test]
    async fn create_rejects_invalid_dag_with_every_reason() {
        let (_, svc) = service();
        let bad = Dag::new(
            vec![
                Node::new("a", "http", json!({"method": "FETCH", "url": ""})),
                Node::new("b", "mystery", json!({})),
            ],
            vec![],
        );
        match svc.create("wf", &bad).await {
            Err(ServiceError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.contains("at least one start node")));
                assert!(errors.iter().any(|e| e.contains("at least one output node")));
                assert!(errors.iter().any(|e| e.contains("requires a URL")));
                assert!(errors.iter().any(|e| e.contains("FETCH")));
                assert!(errors.iter().any(|e| e.contains("mystery")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_requires_a_name() {
        let (_, svc) = service();
        assert!(matches!(
            svc.create("  ", &dag("https://a.example")).await,
            Err(ServiceError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn dag_changing_updates_append_contiguous_versions() {
        let (_, svc) = service();
        let wf = svc.create("wf", &dag("https://a.example/0")).await.unwrap();
        assert_eq!(wf.version, 1);

        for i in 1..=4 {
            let url = format!("https://a.example/{i}");
            let updated = svc.update(wf.id, None, Some(&dag(&url))).await.unwrap();
            assert_eq!(updated.version, i + 1);
        }
        assert_eq!(numbers(&svc, wf.id).await, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn snapshot_captures_the_pre_update_state() {
        let (_, svc) = service();
        let d1 = dag("https://a.example/1");
        let wf = svc.create("wf", &d1).await.unwrap();
        svc.update(wf.id, Some("renamed"), Some(&dag("https://a.example/2")))
            .await
            .unwrap();

        let v2 = svc.get_version(wf.id, 2).await.unwrap();
        assert_eq!(v2.name, "wf");
        assert_eq!(Dag::from_json(&v2.dag_json).unwrap(), d1);
    }

    #[tokio::test]
    async fn name_only_and_equal_dag_updates_do_not_bump() {
        let (_, svc) = service();
        let d = dag("https://a.example");
        let wf = svc.create("wf", &d).await.unwrap();

        let renamed = svc.update(wf.id, Some("renamed"), None).await.unwrap();
        assert_eq!(renamed.name, "renamed");
        let same = svc.update(wf.id, None, Some(&d)).await.unwrap();
        assert_eq!(same.version, 1);
        assert_eq!(numbers(&svc, wf.id).await, vec![1]);
    }

    #[tokio::test]
    async fn blank_name_keeps_the_current_one() {
        let (_, svc) = service();
        let wf = svc.create("wf", &dag("https://a.example")).await.unwrap();
        let updated = svc.update(wf.id, Some(""), None).await.unwrap();
        assert_eq!(updated.name, "wf");
    }

    #[tokio::test]
    async fn update_validates_after_existence() {
        let (_, svc) = service();
        let bad = Dag::default();
        assert!(matches!(
            svc.update(Uuid::new_v4(), None, Some(&bad)).await,
            Err(ServiceError::WorkflowNotFound)
        ));

        let wf = svc.create("wf", &dag("https://a.example")).await.unwrap();
        assert!(matches!(
            svc.update(wf.id, None, Some(&bad)).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(numbers(&svc, wf.id).await, vec![1]);
    }

    #[tokio::test]
    async fn legacy_workflow_gets_version_one_synthesised() {
        let (store, svc) = service();
        let d1 = dag("https://a.example/1");
        let row = store.insert_workflow("legacy", &d1.to_json().unwrap()).await.unwrap();
        store.clear_versions(row.id).await;
        assert_eq!(svc.get(row.id).await.unwrap().version, 1);

        let updated = svc
            .update(row.id, None, Some(&dag("https://a.example/2")))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(numbers(&svc, row.id).await, vec![2, 1]);
    }

    #[tokio::test]
    async fn restore_appends_current_state_then_overwrites() {
        let (_, svc) = service();
        let (d1, d2, d3) = (dag("https://a/1"), dag("https://a/2"), dag("https://a/3"));
        let wf = svc.create("wf", &d1).await.unwrap();
        svc.update(wf.id, None, Some(&d2)).await.unwrap();
        svc.update(wf.id, None, Some(&d3)).await.unwrap();

        let restored = svc.restore(wf.id, 1).await.unwrap();
        assert_eq!(restored.dag, d1);
        assert_eq!(restored.version, 4);
        assert_eq!(numbers(&svc, wf.id).await, vec![4, 3, 2, 1]);

        let v4 = svc.get_version(wf.id, 4).await.unwrap();
        assert_eq!(Dag::from_json(&v4.dag_json).unwrap(), d3);
    }

    #[tokio::test]
    async fn restore_of_unknown_version_is_not_found() {
        let (_, svc) = service();
        let wf = svc.create("wf", &dag("https://a.example")).await.unwrap();
        assert!(matches!(
            svc.restore(wf.id, 9).await,
            Err(ServiceError::NotFound("version"))
        ));
    }

    #[tokio::test]
    async fn list_applies_limit_defaults_and_cap() {
        let (_, svc) = service();
        svc.create("alpha", &dag("https://a.example")).await.unwrap();
        svc.create("Beta", &dag("https://a.example")).await.unwrap();

        let page = svc.list(0, -5, None).await.unwrap();
        assert_eq!((page.limit, page.offset, page.total), (20, 0, 2));
        assert_eq!(svc.list(1000, 0, None).await.unwrap().limit, 100);

        let found = svc.list(10, 0, Some("bet")).await.unwrap();
        assert_eq!(found.total, 1);
        assert_eq!(found.items[0].name, "Beta");
    }
}
