//! Durable snapshot storage for rooms.
//!
//! Rooms talk to storage only through [`PersistenceGateway`]; every call is
//! wrapped in a bounded timeout so a slow backend never stalls a room.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::models::RoomId;

pub use fs::FsGateway;
pub use memory::MemoryGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Latest stored snapshot of a room, `None` when the room was never stored.
    async fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>, GatewayError>;

    /// Replaces the stored snapshot of a room.
    async fn store(&self, room_id: &RoomId, snapshot: Vec<u8>) -> Result<(), GatewayError>;
}

/// Loads with a per-attempt timeout, retrying with exponential backoff.
pub async fn load_with_retry(
    gateway: &dyn PersistenceGateway,
    room_id: &RoomId,
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
) -> Result<Option<Vec<u8>>, GatewayError> {
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, gateway.load(room_id)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(timeout)),
        };
        match result {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) if attempt < attempts => {
                warn!("Load of room {} failed (attempt {}/{}): {}", room_id, attempt, attempts, e);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stores with a bounded timeout. Failures are not retried here; the room
/// retries on a later persist cycle.
pub async fn store_with_timeout(
    gateway: &dyn PersistenceGateway,
    room_id: &RoomId,
    snapshot: Vec<u8>,
    timeout: Duration,
) -> Result<(), GatewayError> {
    match tokio::time::timeout(timeout, gateway.store(room_id, snapshot)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}
