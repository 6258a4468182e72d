//! Request-level tests against the full router, backed by the in-memory
//! store.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use db::{MemoryStore, Store};
use engine::{mock::MockActivities, ExecutorConfig, RetryPolicy, WorkflowExecutor};
use queue::{RuntimeClient, Worker, WorkerConfig};

use crate::{parse_origins, router, AppState, DEFAULT_ALLOWED_ORIGINS};

const URL: &str = "https://api.example.com/ok";

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
}

fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone(), RuntimeClient::new(store.clone()));
    TestApp {
        app: router(state, &parse_origins(DEFAULT_ALLOWED_ORIGINS)),
        store,
    }
}

impl TestApp {
    async fn send_raw(&self, method: Method, uri: &str, body: Option<String>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.send_raw(method, uri, body.map(|b| b.to_string())).await
    }

    async fn create(&self, body: Value) -> String {
        let (status, wf) = self.send(Method::POST, "/api/v1/workflows", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{wf}");
        wf["id"].as_str().unwrap().to_owned()
    }

    async fn version_numbers(&self, id: &str) -> Vec<i64> {
        let (status, body) = self
            .send(Method::GET, &format!("/api/v1/workflows/{id}/versions"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        body["versions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["versionNumber"].as_i64().unwrap())
            .collect()
    }
}

fn node(id: &str, kind: &str, data: Value) -> Value {
    json!({"id": id, "type": kind, "position": {"x": 0.0, "y": 0.0}, "data": data})
}

fn edge(source: &str, target: &str) -> Value {
    json!({"id": format!("{source}-{target}"), "source": source, "target": target})
}

fn http_workflow(url: &str) -> Value {
    json!({
        "name": "fetch",
        "nodes": [
            node("s", "start", json!({"label": "Start"})),
            node("h", "http", json!({"method": "GET", "url": url})),
            node("o", "output", json!({"label": "Out"})),
        ],
        "edges": [edge("s", "h"), edge("h", "o")],
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let t = test_app();
    let (status, body) = t.send(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn create_then_get_round_trips_the_dag() {
    let t = test_app();
    let id = t.create(http_workflow(URL)).await;

    let (status, wf) = t.send(Method::GET, &format!("/api/v1/workflows/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wf["name"], "fetch");
    assert_eq!(wf["version"], 1);
    assert_eq!(wf["nodes"].as_array().unwrap().len(), 3);
    assert_eq!(wf["edges"][1]["target"], "o");
    assert!(wf["createdAt"].is_string());
    assert!(wf["updatedAt"].is_string());
}

#[tokio::test]
async fn cyclic_dag_is_rejected() {
    let t = test_app();
    let body = json!({
        "name": "loop",
        "nodes": [
            node("s", "start", json!({})),
            node("a", "http", json!({"url": URL})),
            node("b", "http", json!({"url": URL})),
            node("o", "output", json!({})),
        ],
        "edges": [edge("s", "a"), edge("a", "b"), edge("b", "a"), edge("a", "o")],
    });
    let (status, err) = t.send(Method::POST, "/api/v1/workflows", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("DAG contains a cycle"));
}

#[tokio::test]
async fn dag_without_output_is_rejected() {
    let t = test_app();
    let body = json!({
        "name": "no-output",
        "nodes": [node("s", "start", json!({})), node("a", "http", json!({"url": URL}))],
        "edges": [edge("s", "a")],
    });
    let (status, err) = t.send(Method::POST, "/api/v1/workflows", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"]
        .as_str()
        .unwrap()
        .contains("DAG must have at least one output node"));
    assert!(err["details"].is_array());
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let t = test_app();
    let (status, err) = t
        .send_raw(Method::POST, "/api/v1/workflows", Some("{not json".into()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].is_string());

    let (status, _) = t
        .send(Method::POST, "/api/v1/workflows", Some(json!({"name": "x"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn resubmitting_a_reordered_dag_keeps_one_version() {
    let t = test_app();
    let id = t.create(http_workflow(URL)).await;

    // same DAG and name, keys reordered and reformatted
    let reordered = format!(
        r#"{{
            "edges": [
                {{"target": "h", "source": "s", "id": "s-h"}},
                {{"source": "h", "id": "h-o", "target": "o"}}
            ],
            "nodes": [
                {{"data": {{"label": "Start"}}, "position": {{"y": 0.0, "x": 0.0}}, "type": "start", "id": "s"}},
                {{"type": "http", "id": "h", "data": {{"url": "{URL}", "method": "GET"}}, "position": {{"x": 0.0, "y": 0.0}}}},
                {{"position": {{"x": 0.0, "y": 0.0}}, "id": "o", "data": {{"label": "Out"}}, "type": "output"}}
            ],
            "name": "fetch"
        }}"#
    );
    let (status, wf) = t
        .send_raw(Method::PUT, &format!("/api/v1/workflows/{id}"), Some(reordered))
        .await;
    assert_eq!(status, StatusCode::OK, "{wf}");
    assert_eq!(wf["version"], 1);
    assert_eq!(t.version_numbers(&id).await, vec![1]);
}

#[tokio::test]
async fn updates_bump_versions_and_restore_appends_the_replaced_state() {
    let t = test_app();
    let id = t.create(http_workflow("https://api.example.com/1")).await;
    let path = format!("/api/v1/workflows/{id}");

    for n in [2, 3] {
        let mut body = http_workflow(&format!("https://api.example.com/{n}"));
        body.as_object_mut().unwrap().remove("name");
        let (status, wf) = t.send(Method::PUT, &path, Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(wf["version"], n);
    }

    let (status, wf) = t
        .send(Method::POST, &format!("{path}/restore/1"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wf["nodes"][1]["data"]["url"], "https://api.example.com/1");
    assert_eq!(wf["version"], 4);

    let (_, listing) = t.send(Method::GET, &format!("{path}/versions"), None).await;
    assert_eq!(listing["total"], 4);
    assert_eq!(listing["currentVersion"], 4);
    assert_eq!(t.version_numbers(&id).await, vec![4, 3, 2, 1]);

    let (status, v4) = t.send(Method::GET, &format!("{path}/versions/4"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v4["versionNumber"], 4);
    assert_eq!(v4["nodes"][1]["data"]["url"], "https://api.example.com/3");
}

#[tokio::test]
async fn version_lookups_report_bad_numbers_and_missing_versions() {
    let t = test_app();
    let id = t.create(http_workflow(URL)).await;

    let (status, err) = t
        .send(Method::GET, &format!("/api/v1/workflows/{id}/versions/abc"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid version number");

    let (status, _) = t
        .send(Method::POST, &format!("/api/v1/workflows/{id}/restore/x"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, err) = t
        .send(Method::GET, &format!("/api/v1/workflows/{id}/versions/7"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "version not found");
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let t = test_app();
    let missing = Uuid::new_v4();
    for (method, uri) in [
        (Method::GET, format!("/api/v1/workflows/{missing}")),
        (Method::GET, "/api/v1/workflows/not-a-uuid".to_owned()),
        (Method::POST, format!("/api/v1/workflows/{missing}/run")),
        (Method::GET, format!("/api/v1/executions/{missing}")),
        (Method::POST, format!("/api/v1/executions/{missing}/cancel")),
    ] {
        let (status, err) = t.send(method, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(err["error"].as_str().unwrap().ends_with("not found"));
    }

    let (status, _) = t
        .send(
            Method::PUT,
            &format!("/api/v1/workflows/{missing}"),
            Some(json!({"name": "x"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_pages_and_searches_summaries() {
    let t = test_app();
    for name in ["Alpha", "beta", "Gamma"] {
        let mut body = http_workflow(URL);
        body["name"] = json!(name);
        t.create(body).await;
    }

    let (status, page) = t.send(Method::GET, "/api/v1/workflows?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["offset"], 0);
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["name"], "Gamma");
    assert_eq!(items[0]["nodeCount"], 3);
    assert_eq!(items[0]["edgeCount"], 2);
    assert!(items[0].get("lastExecution").is_none());

    let (_, found) = t.send(Method::GET, "/api/v1/workflows?search=ALP", None).await;
    assert_eq!(found["total"], 1);
    assert_eq!(found["items"][0]["name"], "Alpha");
    assert_eq!(found["limit"], 20);
}

#[tokio::test]
async fn bad_query_parameters_get_a_json_error() {
    let t = test_app();
    let id = t.create(http_workflow(URL)).await;

    for uri in [
        "/api/v1/workflows?limit=abc".to_owned(),
        format!("/api/v1/workflows/{id}/executions?offset=-x"),
    ] {
        let (status, err) = t.send(Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        let message = err["error"].as_str().unwrap();
        assert!(message.contains("Failed to deserialize query string"), "{message}");
    }
}

#[tokio::test]
async fn run_is_accepted_and_listed_as_pending() {
    let t = test_app();
    let id = t.create(http_workflow(URL)).await;

    let (status, run) = t
        .send(Method::POST, &format!("/api/v1/workflows/{id}/run"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(run["workflow_id"], id.as_str());
    assert_eq!(run["status"], "PENDING");
    let exec_id = run["execution_id"].as_str().unwrap().to_owned();

    let (status, exec) = t
        .send(Method::GET, &format!("/api/v1/executions/{exec_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(exec["status"], "PENDING");
    assert!(exec.get("finished_at").is_none());

    let (_, listing) = t
        .send(Method::GET, &format!("/api/v1/workflows/{id}/executions"), None)
        .await;
    assert_eq!(listing["workflow_id"], id.as_str());
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["executions"][0]["id"], exec_id.as_str());

    let (status, cancel) = t
        .send(Method::POST, &format!("/api/v1/executions/{exec_id}/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(cancel["cancel_requested"], true);
    assert!(t.store.tasks().await[0].cancel_requested);
}

#[tokio::test]
async fn run_through_a_worker_completes_with_the_http_result() {
    let t = test_app();
    let store: Arc<dyn Store> = t.store.clone();
    let mock = Arc::new(MockActivities::new(store.clone()).unwrap());
    mock.respond(URL, Ok(MockActivities::json_response(200, json!({"x": 1}))));
    let config = ExecutorConfig {
        retry: RetryPolicy {
            initial_interval: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        ..ExecutorConfig::default()
    };
    let executor = Arc::new(WorkflowExecutor::new(store.clone(), mock, config));
    let worker = Worker::new(store, executor, WorkerConfig::default());

    let id = t.create(http_workflow(URL)).await;
    let (_, run) = t
        .send(Method::POST, &format!("/api/v1/workflows/{id}/run"), None)
        .await;
    let exec_id = run["execution_id"].as_str().unwrap().to_owned();

    assert!(worker.run_once().await.unwrap());

    let (_, exec) = t
        .send(Method::GET, &format!("/api/v1/executions/{exec_id}"), None)
        .await;
    assert_eq!(exec["status"], "COMPLETED");
    assert_eq!(exec["result"]["data"], json!({"x": 1}));
    assert!(exec["finished_at"].is_string());
    assert!(exec.get("error").is_none());

    let (_, page) = t.send(Method::GET, "/api/v1/workflows", None).await;
    let last = &page["items"][0]["lastExecution"];
    assert_eq!(last["id"], exec_id.as_str());
    assert_eq!(last["status"], "COMPLETED");
}

#[tokio::test]
async fn preflight_echoes_an_allowed_origin() {
    let t = test_app();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/v1/workflows")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    let headers = response.headers();
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
}
