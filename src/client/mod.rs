//! WebSocket client for a collaboration room.
//!
//! Keeps a local [`Replica`]: edits apply locally first and ship as deltas,
//! the room's snapshot and relayed deltas are merged in as they arrive.
//! Reconnecting with an existing replica resends whatever the room missed.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use crate::doc::codec::{self, FrameKind};
use crate::doc::{Delta, DocError, DocView, Replica};
use crate::models::{AwarenessRecord, ClientMessage, ErrorMessage, RoomId, ServerMessage};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
}

/// What the application hears from the room.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The room's snapshot was merged into the local replica.
    Synced,
    RemoteDelta(Delta),
    /// Presence of everyone else, never including this client's user.
    Presence(Vec<AwarenessRecord>),
    Error(ErrorMessage),
    /// The room was torn down; connect again to get a fresh one.
    Reconnect(String),
    Closed,
}

pub struct CollabClient {
    user_id: String,
    replica: Arc<Mutex<Replica>>,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

fn lock(replica: &Mutex<Replica>) -> MutexGuard<'_, Replica> {
    replica.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Percent-encodes a query value.
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

impl CollabClient {
    /// Joins `room` on the server at `base_url` (e.g. `ws://127.0.0.1:3000`)
    /// with an empty local replica.
    pub async fn connect(base_url: &str, room: &RoomId, user_id: &str, display_name: &str) -> Result<Self, ClientError> {
        let peer = uuid::Uuid::new_v4().as_u64_pair().0;
        Self::connect_with_replica(base_url, room, user_id, display_name, Replica::new(peer)).await
    }

    /// Joins `room` keeping the edits already in `replica`.
    pub async fn connect_with_replica(
        base_url: &str,
        room: &RoomId,
        user_id: &str,
        display_name: &str,
        replica: Replica,
    ) -> Result<Self, ClientError> {
        let url = format!(
            "{}/ws/{}/{}?user={}&name={}",
            base_url.trim_end_matches('/'),
            encode_query(room.resource_type()),
            encode_query(room.resource_id()),
            encode_query(user_id),
            encode_query(display_name)
        );
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();
        debug!("Connected to {}", url);

        let replica = Arc::new(Mutex::new(replica));
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (events_tx, events) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader = {
            let replica = replica.clone();
            let outgoing = outgoing.clone();
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                while let Some(msg) = source.next().await {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!("Read error: {}", e);
                            break;
                        }
                    };
                    let event = match msg {
                        Message::Binary(bytes) => on_binary(&replica, &outgoing, &bytes).await,
                        Message::Text(text) => on_text(&outgoing, &user_id, text.as_str()).await,
                        Message::Close(_) => break,
                        _ => None,
                    };
                    if let Some(event) = event {
                        let _ = events_tx.send(event);
                    }
                }
                let _ = events_tx.send(ClientEvent::Closed);
            })
        };

        Ok(Self {
            user_id: user_id.to_string(),
            replica,
            outgoing,
            events,
            writer,
            reader,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Applies a local edit and ships the resulting delta.
    pub async fn edit<F>(&self, f: F) -> Result<Delta, ClientError>
    where
        F: FnOnce(&mut Replica) -> Result<Delta, DocError>,
    {
        let delta = f(&mut lock(&self.replica))?;
        self.send_delta(&delta).await?;
        Ok(delta)
    }

    pub async fn send_delta(&self, delta: &Delta) -> Result<(), ClientError> {
        let bytes = codec::encode_delta(delta)?;
        self.send_delta_bytes(bytes).await
    }

    /// Sends an already encoded frame as is.
    pub async fn send_delta_bytes(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::binary(bytes))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn send_awareness(&self, state: AwarenessRecord) -> Result<(), ClientError> {
        let text = serde_json::to_string(&ClientMessage::Awareness { state })?;
        self.outgoing
            .send(Message::text(text))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub fn view(&self) -> DocView {
        lock(&self.replica).view()
    }

    /// A copy of the local replica, e.g. to reconnect with later.
    pub fn replica(&self) -> Replica {
        lock(&self.replica).clone()
    }

    /// Next event from the room; `None` once the connection is gone and
    /// every event was read.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Closes the socket and returns the local replica.
    pub async fn close(self) -> Replica {
        let _ = self.outgoing.send(Message::Close(None)).await;
        let _ = self.writer.await;
        self.reader.abort();
        lock(&self.replica).clone()
    }
}

async fn on_binary(replica: &Mutex<Replica>, outgoing: &mpsc::Sender<Message>, bytes: &[u8]) -> Option<ClientEvent> {
    let result = match codec::frame_kind(bytes) {
        Ok(FrameKind::Snapshot) => {
            let missing = lock(replica).merge_snapshot(bytes);
            match missing {
                Ok(missing) if missing.is_empty() => Ok(ClientEvent::Synced),
                Ok(missing) => {
                    debug!("Resending {} ops the room is missing", missing.len());
                    match codec::encode_delta(&missing) {
                        Ok(frame) => {
                            let _ = outgoing.send(Message::binary(frame)).await;
                            Ok(ClientEvent::Synced)
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        }
        Ok(FrameKind::Delta) => codec::decode_delta(bytes).and_then(|delta| {
            lock(replica).apply_remote(&delta)?;
            Ok(ClientEvent::RemoteDelta(delta))
        }),
        Err(e) => Err(e),
    };
    match result {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Ignoring unreadable frame from the room: {}", e);
            None
        }
    }
}

async fn on_text(outgoing: &mpsc::Sender<Message>, user_id: &str, text: &str) -> Option<ClientEvent> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Ping) => {
            if let Ok(pong) = serde_json::to_string(&ClientMessage::Pong) {
                let _ = outgoing.send(Message::text(pong)).await;
            }
            None
        }
        Ok(ServerMessage::Pong) => None,
        Ok(ServerMessage::AwarenessBroadcast { users }) => Some(ClientEvent::Presence(
            users.into_iter().filter(|u| u.user_id != user_id).collect(),
        )),
        Ok(ServerMessage::Error(error)) => Some(ClientEvent::Error(error)),
        Ok(ServerMessage::Reconnect { reason }) => Some(ClientEvent::Reconnect(reason)),
        Err(e) => {
            warn!("Ignoring unreadable message from the room: {}", e);
            None
        }
    }
}
