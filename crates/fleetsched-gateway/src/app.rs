use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use fleetsched_scheduler::ExecutionEngine;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    /// Bearer keys accepted for manual trigger calls.
    pub api_keys: Vec<String>,
}

impl AppState {
    pub fn new(engine: Arc<ExecutionEngine>, api_keys: Vec<String>) -> Self {
        Self { engine, api_keys }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/schedules/execute",
            post(crate::http::execute::execute_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
