use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::db::GatewayError;
use crate::doc::DocError;
use crate::models::RoomIdError;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn reply(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
        (
            status,
            Json(ErrorResponse {
                code: status.as_u16(),
                status: status.to_string(),
                error: error.into(),
            }),
        )
    }
}

/// Errors surfaced by rooms and the registry.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("room capacity exhausted ({max} rooms)")]
    CapacityExhausted { max: usize },
    #[error("room {0} is closed")]
    RoomClosed(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error(transparent)]
    InvalidRoomId(#[from] RoomIdError),
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl CollabError {
    pub fn status(&self) -> StatusCode {
        match self {
            CollabError::CapacityExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CollabError::RoomClosed(_) => StatusCode::CONFLICT,
            CollabError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            CollabError::InvalidRoomId(_) => StatusCode::BAD_REQUEST,
            CollabError::Doc(_) | CollabError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
