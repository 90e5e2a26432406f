use crate::{handlers::{diagnostics, health_check, ready_check, room_export}, AppState};
use axum::{routing::get, Router};

/// Create API routes
pub fn create_api_routes() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/rooms/:resource_type/:resource_id/export", get(room_export))
}
