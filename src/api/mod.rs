mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use handlers::{AppState, CleanupResponse, StalledResponse};

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Features
        .route("/features", get(handlers::list_features))
        .route("/features", post(handlers::create_feature))
        .route("/features/{id}", get(handlers::get_feature))
        .route("/features/{id}/tasks", post(handlers::create_task))
        .route("/plans", post(handlers::create_plan))
        // Tasks
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/start", post(handlers::start_task))
        .route("/tasks/{id}/progress", post(handlers::report_progress))
        .route("/tasks/{id}/complete", post(handlers::complete_task))
        .route("/tasks/{id}/fail", post(handlers::fail_task))
        .route("/tasks/{id}/retry", post(handlers::retry_task))
        .route("/tasks/{id}/assign", post(handlers::assign_task))
        // Dispatch
        .route("/dispatch", post(handlers::dispatch_pending))
        .route("/reports", post(handlers::post_report))
        // Recovery
        .route("/recovery/stalled", post(handlers::recover_stalled))
        .route("/recovery/retry", post(handlers::retry_failed))
        .route("/recovery/cleanup", post(handlers::cleanup))
        .route("/recovery/full", post(handlers::full_recovery))
        // Statistics & agents
        .route("/statistics", get(handlers::statistics))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{agent}/pending", get(handlers::agent_pending))
        // Health
        .route("/health", get(handlers::health))
        .route("/health/tasks", get(handlers::health_report));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
