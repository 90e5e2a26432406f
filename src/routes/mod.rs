pub mod api;

use axum::{http::HeaderValue, routing::get, Json, Router};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;
use utoipa::OpenApi;

use crate::{docs::ApiDoc, ws::ws_handler, AppState};

pub use api::create_api_routes;

/// Full application router: REST API, WebSocket endpoint and OpenAPI document.
pub fn build_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origin_list()
        .into_iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    let router = Router::new()
        // Mount API routes
        .nest("/api", create_api_routes())
        .route("/ws/:resource_type/:resource_id", get(ws_handler))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state)
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    if origins.is_empty() {
        router
    } else {
        router.layer(CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any))
    }
}
