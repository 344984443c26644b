use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - JSON boundary over the engine
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Sessions
            .route("/sessions", post(handlers::api::create_session))
            .route("/sessions/{id}", delete(handlers::api::delete_session))
            .route("/sessions/{id}/history", get(handlers::api::get_history))

            // Turns
            .route("/sessions/{id}/questions", post(handlers::api::ask_question))
            .route("/sessions/{id}/confirm", post(handlers::api::confirm_pending))
            .route("/sessions/{id}/cancel", post(handlers::api::cancel_pending))

            // Schema management
            .route("/schema", get(handlers::api::get_schema))
            .route("/schema/refresh", post(handlers::api::refresh_schema))

            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
