pub mod auth;
pub mod dto;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::executions::ExecutionRepo;
use crate::model::ExecutionJob;
use queue::SqlxJobQueue;
use storage::ArtifactStore;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn ExecutionRepo>,
    pub artifacts: Arc<ArtifactStore>,
    pub queue: Arc<SqlxJobQueue<ExecutionJob>>,
    pub max_reference_images: usize,
    pub max_reference_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/workflows", get(routes::list_workflows))
        .route("/workflows/:id", get(routes::get_workflow))
        .route("/workflows/:id/execute", post(routes::execute_workflow))
        .route(
            "/workflows/:id/executions",
            get(routes::list_executions_for_workflow),
        )
        .route("/workflows/executions/all", get(routes::list_all_executions))
        .route("/executions/:id", get(routes::get_execution))
        .route(
            "/executions/:id/batch-results",
            get(routes::list_batch_results),
        )
        .with_state(state)
}
