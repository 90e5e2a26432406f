use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Ephemeral presence of one user in a room. Never persisted.
///
/// `cursor`, `selection` and `ghostNode` are opaque to the server: rich-text
/// clients put anchors there, graph clients put canvas coordinates or a drag
/// preview of the node being moved.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessRecord {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ghost_node: Option<Value>,
}

impl AwarenessRecord {
    pub fn new(user_id: &str, display_name: &str, color: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            color: color.to_string(),
            ..Default::default()
        }
    }
}
