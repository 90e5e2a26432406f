use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{ClientMessage, CollabError, ErrorCode, ErrorResponse, RoomId, ServerMessage};
use crate::room::RoomHandle;
use crate::ws::connctx::{Connection, ConnectionId, Outbound};
use crate::AppState;

/// Identity passed by the (already authenticated) client.
#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub user: Option<String>,
    pub name: Option<String>,
}

/// WebSocket handler
pub async fn ws_handler(
    Path((resource_type, resource_id)): Path<(String, String)>,
    Query(params): Query<JoinParams>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let room_id = match RoomId::new(&resource_type, &resource_id) {
        Ok(room_id) => room_id,
        Err(e) => return ErrorResponse::reply(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let user_id = params
        .user
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| format!("anonymous-{}", Uuid::new_v4()));
    let display_name = params.name.filter(|n| !n.is_empty()).unwrap_or_else(|| user_id.clone());

    info!("New WebSocket connection attempt for room {} (user {})", room_id, user_id);
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id, user_id, display_name))
}

fn error_code(e: &CollabError) -> ErrorCode {
    match e {
        CollabError::CapacityExhausted { .. } => ErrorCode::CapacityExhausted,
        CollabError::RoomClosed(_) => ErrorCode::RoomClosed,
        _ => ErrorCode::Internal,
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, room_id: RoomId, user_id: String, display_name: String) {
    let (mut sender, mut receiver) = socket.split();

    let (connection, mut outbound) =
        Connection::new(&user_id, &display_name, state.registry.config().conn_queue_capacity);
    let connection_id = connection.connection_id;
    let kill = connection.kill_signal();
    let replier = connection.clone();

    let room = match state.registry.join(&room_id, connection).await {
        Ok((room, _)) => room,
        Err(e) => {
            warn!("Connection {} could not join room {}: {}", connection_id, room_id, e);
            let frame = ServerMessage::error(error_code(&e), e.to_string()).to_text();
            let _ = sender.send(Message::Text(frame)).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!(
        "WebSocket connection {} established for room {} (user {})",
        connection_id, room_id, user_id
    );

    // Drains the frames the room queued for this client.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let msg = match frame {
                Outbound::Binary(bytes) => Message::Binary(bytes),
                Outbound::Text(text) => Message::Text(text),
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Forwards client frames to the room, in order.
    let reader_room = room.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Read error on connection {}: {}", connection_id, e);
                    break;
                }
            };
            let result = match msg {
                Message::Binary(bytes) => reader_room.apply_delta(connection_id, bytes).await,
                Message::Text(text) => handle_text(&reader_room, &replier, &text).await,
                Message::Ping(_) | Message::Pong(_) => reader_room.pong(connection_id).await,
                Message::Close(_) => break,
            };
            if let Err(e) = result {
                debug!("Connection {} lost its room: {}", connection_id, e);
                break;
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
        _ = kill.notified() => {
            send_task.abort();
            recv_task.abort();
        }
    };

    // Queued behind every delta this connection sent.
    let _ = room.leave(connection_id).await;
    info!("WebSocket connection {} terminated", connection_id);
}

async fn handle_text(room: &RoomHandle, connection: &Connection, text: &str) -> Result<(), CollabError> {
    let connection_id: ConnectionId = connection.connection_id;
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Awareness { state }) => room.update_awareness(connection_id, state).await,
        Ok(ClientMessage::Ping) => {
            let _ = connection.send_message(&ServerMessage::Pong);
            room.pong(connection_id).await
        }
        Ok(ClientMessage::Pong) => room.pong(connection_id).await,
        Err(e) => {
            warn!("Invalid message on connection {}: {}", connection_id, e);
            let _ = connection.send_message(&ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()));
            Ok(())
        }
    }
}
