//! Rooms: the live session of one collaboratively edited resource.
//!
//! Each room runs as a single task that owns its document and presence
//! state. Everything else talks to it through a [`RoomHandle`], which
//! enqueues [`RoomCommand`]s on the room's bounded queue; the room processes
//! them one at a time, so room state has exactly one writer.

pub mod awareness;
pub mod registry;
mod session;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::db::GatewayError;
use crate::doc::DocView;
use crate::models::{AwarenessRecord, CollabError, RoomId};
use crate::ws::connctx::{Connection, ConnectionId};

pub use awareness::AwarenessStore;
pub use registry::Registry;

/// Tunables shared by every room of a registry.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long an empty room lingers before eviction.
    pub grace: Duration,
    pub snapshot_interval: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_rooms: usize,
    pub queue_capacity: usize,
    pub conn_queue_capacity: usize,
    /// Ops a document may hold before its room is torn down.
    pub max_doc_ops: usize,
    pub gateway_timeout: Duration,
    pub load_attempts: u32,
    pub load_backoff: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(30),
            max_rooms: 10_000,
            queue_capacity: 1024,
            conn_queue_capacity: 256,
            max_doc_ops: 1_000_000,
            gateway_timeout: Duration::from_secs(5),
            load_attempts: 3,
            load_backoff: Duration::from_millis(200),
        }
    }
}

/// What a joining connection receives: the full document and the presence
/// of everyone else already in the room.
#[derive(Debug, Clone)]
pub struct InitialSnapshot {
    pub snapshot: Vec<u8>,
    pub peers: Vec<AwarenessRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub room_id: String,
    pub connections: usize,
    pub awareness: usize,
    pub ops: usize,
    pub pending_ops: usize,
    pub dirty: bool,
    pub store_failures: u32,
    pub last_persisted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RoomExport {
    pub view: DocView,
    pub snapshot: Vec<u8>,
    pub connections: usize,
    pub last_persisted_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum RoomCommand {
    Join {
        connection: Connection,
        reply: oneshot::Sender<Result<InitialSnapshot, CollabError>>,
    },
    Delta {
        connection_id: ConnectionId,
        bytes: Vec<u8>,
    },
    Awareness {
        connection_id: ConnectionId,
        record: AwarenessRecord,
    },
    Pong {
        connection_id: ConnectionId,
    },
    Leave {
        connection_id: ConnectionId,
    },
    Snapshot {
        reply: oneshot::Sender<Result<Vec<u8>, CollabError>>,
    },
    Export {
        reply: oneshot::Sender<Result<RoomExport, CollabError>>,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
    /// Persist now if dirty; the reply comes once the write is done.
    Flush {
        reply: oneshot::Sender<Result<(), CollabError>>,
    },
    /// Sent by the registry's grace timer.
    EvictIfIdle,
    /// Outcome of a store running off the room task.
    StoreFinished {
        version: u64,
        result: Result<(), GatewayError>,
        reply: Option<oneshot::Sender<Result<(), CollabError>>>,
    },
}

/// Cheap, cloneable address of a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    instance: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Distinguishes successive rooms created for the same id.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    fn closed(&self) -> CollabError {
        CollabError::RoomClosed(self.room_id.to_string())
    }

    /// Waits for queue capacity; a flooding client is slowed down here.
    pub async fn send(&self, cmd: RoomCommand) -> Result<(), CollabError> {
        self.tx.send(cmd).await.map_err(|_| self.closed())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn join(&self, connection: Connection) -> Result<InitialSnapshot, CollabError> {
        self.request(|reply| RoomCommand::Join { connection, reply }).await?
    }

    pub async fn apply_delta(&self, connection_id: ConnectionId, bytes: Vec<u8>) -> Result<(), CollabError> {
        self.send(RoomCommand::Delta { connection_id, bytes }).await
    }

    pub async fn update_awareness(
        &self,
        connection_id: ConnectionId,
        record: AwarenessRecord,
    ) -> Result<(), CollabError> {
        self.send(RoomCommand::Awareness { connection_id, record }).await
    }

    pub async fn pong(&self, connection_id: ConnectionId) -> Result<(), CollabError> {
        self.send(RoomCommand::Pong { connection_id }).await
    }

    pub async fn leave(&self, connection_id: ConnectionId) -> Result<(), CollabError> {
        self.send(RoomCommand::Leave { connection_id }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>, CollabError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await?
    }

    pub async fn export(&self) -> Result<RoomExport, CollabError> {
        self.request(|reply| RoomCommand::Export { reply }).await?
    }

    pub async fn stats(&self) -> Result<RoomStats, CollabError> {
        self.request(|reply| RoomCommand::Stats { reply }).await
    }

    pub async fn flush(&self) -> Result<(), CollabError> {
        self.request(|reply| RoomCommand::Flush { reply }).await?
    }
}
