//! `api` crate — the management HTTP API.
//!
//! Routes (all JSON):
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows
//!   GET    /api/v1/workflows/{id}
//!   PUT    /api/v1/workflows/{id}
//!   GET    /api/v1/workflows/{id}/versions
//!   GET    /api/v1/workflows/{id}/versions/{version}
//!   POST   /api/v1/workflows/{id}/restore/{version}
//!   POST   /api/v1/workflows/{id}/run
//!   GET    /api/v1/workflows/{id}/executions
//!   GET    /api/v1/executions/{id}
//!   POST   /api/v1/executions/{id}/cancel
//!   GET    /health

pub mod cors;
pub mod error;
pub mod handlers;
pub mod service;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use db::Store;
use queue::RuntimeClient;

pub use cors::{cors_layer, parse_origins, DEFAULT_ALLOWED_ORIGINS};
pub use error::ApiError;
pub use service::{ExecutionService, ServiceError, WorkflowService};

#[derive(Clone)]
pub struct AppState {
    pub workflows: Arc<WorkflowService>,
    pub executions: Arc<ExecutionService>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, runtime: RuntimeClient) -> Self {
        Self {
            workflows: Arc::new(WorkflowService::new(store.clone())),
            executions: Arc::new(ExecutionService::new(store, runtime)),
        }
    }
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let api = Router::new()
        .route("/workflows", get(handlers::workflows::list).post(handlers::workflows::create))
        .route(
            "/workflows/{id}",
            get(handlers::workflows::get).put(handlers::workflows::update),
        )
        .route("/workflows/{id}/versions", get(handlers::workflows::list_versions))
        .route(
            "/workflows/{id}/versions/{version}",
            get(handlers::workflows::get_version),
        )
        .route(
            "/workflows/{id}/restore/{version}",
            post(handlers::workflows::restore),
        )
        .route("/workflows/{id}/run", post(handlers::executions::run))
        .route("/workflows/{id}/executions", get(handlers::executions::list))
        .route("/executions/{id}", get(handlers::executions::get))
        .route("/executions/{id}/cancel", post(handlers::executions::cancel));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` fires, letting in-flight
/// requests finish.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod api_tests;
