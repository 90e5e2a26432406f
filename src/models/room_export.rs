use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use utoipa::ToSchema;

/// Live state of a room, as served by the export endpoint
#[serde_as]
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoomExportResponse {
    pub room_id: String,
    /// Rendered document: rich-text tree plus graph nodes and edges
    pub view: serde_json::value::Value,
    /// Full snapshot, base64 encoded
    #[serde_as(as = "Base64")]
    #[schema(value_type = String, format = Byte)]
    pub snapshot: Vec<u8>,
    pub connections: u32,
    pub last_persisted_at: Option<DateTime<Utc>>,
}
