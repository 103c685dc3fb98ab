use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{MessageKind, RoomId, UserId},
    error::ErrorCode,
    protocol::{ClientEvent, LocationPayload, ServerEvent},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

type Outbound = mpsc::UnboundedSender<ServerEvent>;

#[derive(Default)]
struct Registry {
    rooms: HashMap<RoomId, HashMap<ConnectionId, Outbound>>,
    active_room: HashMap<ConnectionId, RoomId>,
    connections: HashMap<ConnectionId, Outbound>,
}

/// Room membership and fan-out index over live connections.
///
/// Owns no durable state: rooms exist while at least one connection is
/// joined and vanish with their last member. One instance per process,
/// passed by handle to the socket handlers; independent instances can be
/// constructed freely in tests.
pub(crate) struct ChannelManager {
    registry: Mutex<Registry>,
    next_connection_id: AtomicU64,
}

impl ChannelManager {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection and hands back the receiving end of its
    /// outbound event queue.
    pub(crate) async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().await.connections.insert(id, tx);
        (id, rx)
    }

    /// Adds the connection to a room. A connection holds at most one active
    /// room; joining another implicitly leaves the previous one.
    pub(crate) async fn join(&self, connection: ConnectionId, room: RoomId) {
        let mut registry = self.registry.lock().await;
        let Some(outbound) = registry.connections.get(&connection).cloned() else {
            return;
        };
        if let Some(previous) = registry.active_room.get(&connection).cloned() {
            if previous != room {
                remove_membership(&mut registry, connection, &previous);
            }
        }
        registry
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(connection, outbound);
        registry.active_room.insert(connection, room);
    }

    pub(crate) async fn leave(&self, connection: ConnectionId, room: &RoomId) {
        let mut registry = self.registry.lock().await;
        remove_membership(&mut registry, connection, room);
        if registry.active_room.get(&connection) == Some(room) {
            registry.active_room.remove(&connection);
        }
    }

    /// Implicit leave for everything the connection held, then forget it.
    pub(crate) async fn disconnect(&self, connection: ConnectionId) {
        let mut registry = self.registry.lock().await;
        if let Some(room) = registry.active_room.remove(&connection) {
            remove_membership(&mut registry, connection, &room);
        }
        registry.connections.remove(&connection);
    }

    /// Best-effort delivery to every connection currently joined to the
    /// room, the sender's own included. Nothing is queued for absentees.
    pub(crate) async fn broadcast(&self, room: &RoomId, event: &ServerEvent) {
        let registry = self.registry.lock().await;
        if let Some(members) = registry.rooms.get(room) {
            for outbound in members.values() {
                let _ = outbound.send(event.clone());
            }
        }
    }

    pub(crate) async fn broadcast_except(
        &self,
        room: &RoomId,
        skip: ConnectionId,
        event: &ServerEvent,
    ) {
        let registry = self.registry.lock().await;
        if let Some(members) = registry.rooms.get(room) {
            for (member, outbound) in members {
                if *member != skip {
                    let _ = outbound.send(event.clone());
                }
            }
        }
    }

    pub(crate) async fn send_to(&self, connection: ConnectionId, event: ServerEvent) {
        let registry = self.registry.lock().await;
        if let Some(outbound) = registry.connections.get(&connection) {
            let _ = outbound.send(event);
        }
    }

    #[cfg(test)]
    pub(crate) async fn has_room(&self, room: &RoomId) -> bool {
        self.registry.lock().await.rooms.contains_key(room)
    }
}

fn remove_membership(registry: &mut Registry, connection: ConnectionId, room: &RoomId) {
    if let Some(members) = registry.rooms.get_mut(room) {
        members.remove(&connection);
        if members.is_empty() {
            registry.rooms.remove(room);
        }
    }
}

/// Per-connection event loop. Inbound events are processed to completion in
/// arrival order for this connection; events from other connections
/// interleave freely and are ordered only by the store.
pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound_rx) = state.channels.register().await;
    info!(user_id = user_id.0, connection = connection.0, "live channel connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => handle_event(&state, connection, event).await,
            Err(err) => {
                // Malformed input is reported to this connection alone and
                // never tears it down.
                state
                    .channels
                    .send_to(
                        connection,
                        ServerEvent::MessageError {
                            error: "invalid event".to_string(),
                            details: Some(err.to_string()),
                        },
                    )
                    .await;
            }
        }
    }

    state.channels.disconnect(connection).await;
    send_task.abort();
    info!(user_id = user_id.0, connection = connection.0, "live channel disconnected");
}

async fn handle_event(state: &AppState, connection: ConnectionId, event: ClientEvent) {
    match event {
        ClientEvent::JoinRoom { room_id } => {
            state.channels.join(connection, room_id.clone()).await;
            info!(room_id = %room_id, connection = connection.0, "joined room");
            state
                .channels
                .send_to(
                    connection,
                    ServerEvent::RoomJoined {
                        room_id,
                        message: "Successfully joined room".to_string(),
                    },
                )
                .await;
        }
        ClientEvent::LeaveRoom { room_id } => {
            state.channels.leave(connection, &room_id).await;
            info!(room_id = %room_id, connection = connection.0, "left room");
        }
        ClientEvent::SendMessage {
            sender_id,
            receiver_id,
            message,
            message_type,
            location_data,
        } => {
            handle_send(
                state,
                connection,
                sender_id,
                receiver_id,
                message,
                message_type,
                location_data,
            )
            .await;
        }
        ClientEvent::Typing {
            sender_id,
            receiver_id,
            is_typing,
        } => {
            // Ephemeral: never persisted, never acknowledged. A lost frame
            // self-heals on the next keystroke.
            let room = RoomId::for_pair(sender_id, receiver_id);
            state
                .channels
                .broadcast_except(
                    &room,
                    connection,
                    &ServerEvent::UserTyping {
                        sender_id,
                        is_typing,
                    },
                )
                .await;
        }
    }
}

async fn handle_send(
    state: &AppState,
    connection: ConnectionId,
    sender_id: UserId,
    receiver_id: UserId,
    message: String,
    message_type: MessageKind,
    location_data: Option<LocationPayload>,
) {
    if message_type == MessageKind::Location && location_data.is_none() {
        state
            .channels
            .send_to(
                connection,
                ServerEvent::MessageError {
                    error: "Invalid location data".to_string(),
                    details: None,
                },
            )
            .await;
        return;
    }

    match server_api::send_chat_message(
        &state.api,
        sender_id,
        receiver_id,
        &message,
        message_type,
        location_data.as_ref(),
    )
    .await
    {
        Ok(persisted) => {
            let room = RoomId::for_pair(sender_id, receiver_id);
            info!(
                room_id = %room,
                message_id = persisted.id.0,
                sender_id = sender_id.0,
                "message persisted and broadcast"
            );
            // The sender's connection receives the broadcast too; its
            // optimistic copy reconciles against the server-assigned id.
            state
                .channels
                .broadcast(&room, &ServerEvent::ReceiveMessage(persisted.clone()))
                .await;
            state
                .channels
                .send_to(
                    connection,
                    ServerEvent::MessageSent {
                        success: true,
                        message_id: persisted.id,
                        message_type: persisted.message_type,
                    },
                )
                .await;
        }
        Err(err) => {
            warn!(
                sender_id = sender_id.0,
                receiver_id = receiver_id.0,
                error = %err.message,
                "send failed; nothing was broadcast"
            );
            let event = match err.code {
                ErrorCode::Validation => ServerEvent::MessageError {
                    error: err.message,
                    details: None,
                },
                _ => ServerEvent::MessageError {
                    error: "Failed to save message".to_string(),
                    details: Some(err.message),
                },
            };
            state.channels.send_to(connection, event).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/channels_tests.rs"]
mod tests;
