use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready, with the number of live rooms", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Room and process diagnostics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Aggregated room statistics", body = DiagnosticsResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// Export the live state of a room
#[utoipa::path(
    get,
    path = "/api/v1/rooms/{resource_type}/{resource_id}/export",
    params(
        ("resource_type" = String, Path, description = "Kind of resource edited in the room"),
        ("resource_id" = String, Path, description = "Identifier of the resource")
    ),
    responses(
        (status = 200, description = "Rendered document and snapshot", body = RoomExportResponse),
        (status = 400, description = "Invalid room id", body = ErrorResponse),
        (status = 404, description = "Room is not live", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn room_export_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        room_export_doc,
    ),
    components(
        schemas(HealthResponse, DiagnosticsResponse, RoomExportResponse, ErrorResponse, AwarenessRecord)
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
