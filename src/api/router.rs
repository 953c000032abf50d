use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers::{
    AppState, complete_request, complete_schedule, create_item, create_request, create_schedule,
    dashboard, decide_request, delete_item, handoff_qr, list_items, list_requests, list_schedules,
    return_qr, scan, submit_feedback, update_item,
};

/// Creates the API router with all lending endpoints
///
/// Every endpoint except `/health` requires the `x-user-id` header.
///
/// Items:
/// - GET /items, POST /items
/// - PUT /items/:id, DELETE /items/:id
///
/// Requests:
/// - GET /requests, POST /requests
/// - POST /requests/:id/decision
/// - POST /requests/:id/complete
/// - POST /requests/:id/feedback
///
/// Schedules:
/// - GET /schedules, POST /schedules
/// - GET /schedules/:id/handoff-qr
/// - POST /schedules/:id/return-qr
/// - POST /schedules/:id/scan
/// - POST /schedules/:id/complete
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check endpoint
        .route("/health", get(health_check))
        .route("/items", get(list_items).post(create_item))
        .route("/items/:id", put(update_item).delete(delete_item))
        .route("/requests", get(list_requests).post(create_request))
        .route("/requests/:id/decision", post(decide_request))
        .route("/requests/:id/complete", post(complete_request))
        .route("/requests/:id/feedback", post(submit_feedback))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/:id/handoff-qr", get(handoff_qr))
        .route("/schedules/:id/return-qr", post(return_qr))
        .route("/schedules/:id/scan", post(scan))
        .route("/schedules/:id/complete", post(complete_schedule))
        .route("/dashboard", get(dashboard))
        // Add tracing middleware
        .layer(TraceLayer::new_for_http())
        // Add application state
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
