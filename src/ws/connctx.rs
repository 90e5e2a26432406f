use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frame queued for one client's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The client is not draining its queue fast enough.
    Stalled,
    /// The writer task is gone.
    Closed,
}

/// One client's membership in a room.
///
/// The room never awaits a socket: frames go into a bounded queue drained by
/// the connection's own writer task.
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub display_name: String,
    outbound: mpsc::Sender<Outbound>,
    closer: Arc<Notify>,
    pub last_seen: Instant,
}

impl Connection {
    /// Creates a connection and the receiving end its writer task drains.
    pub fn new(user_id: &str, display_name: &str, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                connection_id: ConnectionId::new(),
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                outbound: tx,
                closer: Arc::new(Notify::new()),
                last_seen: Instant::now(),
            },
            rx,
        )
    }

    pub fn send(&self, frame: Outbound) -> Result<(), SendFailure> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::Stalled,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    pub fn send_message(&self, msg: &ServerMessage) -> Result<(), SendFailure> {
        self.send(Outbound::Text(msg.to_text()))
    }

    /// Closes the socket after the frames already queued. A connection whose
    /// queue is full is killed instead.
    pub fn close(&self) {
        if self.outbound.try_send(Outbound::Close).is_err() {
            self.kill();
        }
    }

    /// Drops the socket immediately, without flushing.
    pub fn kill(&self) {
        self.closer.notify_one();
    }

    /// Signalled by [`Connection::kill`]; awaited by the socket handler.
    pub fn kill_signal(&self) -> Arc<Notify> {
        self.closer.clone()
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}
