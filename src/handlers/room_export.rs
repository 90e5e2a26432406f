use crate::{
    models::{CollabError, ErrorResponse, RoomExportResponse, RoomId},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::error;

/// Export the live state of a room
pub async fn room_export(
    State(state): State<AppState>,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<RoomExportResponse>), (StatusCode, Json<ErrorResponse>)> {
    let room_id = RoomId::new(&resource_type, &resource_id)
        .map_err(|e| ErrorResponse::reply(StatusCode::BAD_REQUEST, e.to_string()))?;

    // Only rooms that are live in this process can be exported
    let export = state.registry.export(&room_id).await.map_err(|e| {
        if !matches!(e, CollabError::RoomNotFound(_)) {
            error!("Failed to export room {}: {}", room_id, e);
        }
        ErrorResponse::reply(e.status(), e.to_string())
    })?;

    let view = serde_json::to_value(&export.view).map_err(|e| {
        error!("Failed to render room {}: {}", room_id, e);
        ErrorResponse::reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok((
        StatusCode::OK,
        Json(RoomExportResponse {
            room_id: room_id.to_string(),
            view,
            snapshot: export.snapshot,
            connections: export.connections as u32,
            last_persisted_at: export.last_persisted_at,
        }),
    ))
}
