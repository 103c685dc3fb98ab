use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{stream::SplitStream, SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{MessageId, MessageKind, RoomId, UserId},
    protocol::{ClientEvent, LocationPayload, MessagePayload, ServerEvent},
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use uuid::Uuid;

pub mod backoff;
pub mod view;

pub use backoff::ReconnectPolicy;
pub use view::{ChatEntry, ConversationView, LiveOutcome};

/// A remote typing flag is cleared if no further typing event arrives
/// within this window.
const TYPING_EXPIRY: Duration = Duration::from_secs(3);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Events surfaced to the embedding UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    RoomJoined { room_id: RoomId },
    ConversationUpdated,
    MessageConfirmed { message_id: MessageId },
    SendFailed { error: String },
    CounterpartTyping { is_typing: bool },
}

struct SessionState {
    view: ConversationView,
    ws_tx: Option<mpsc::UnboundedSender<Message>>,
    connected: bool,
    typing_generation: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    user_id: i64,
    counterpart_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResponse {
    updated_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountResponse {
    unread_count: u64,
}

/// One chat conversation between this user and a counterpart: owns the live
/// channel, the local conversation view and the reconnect lifecycle.
///
/// Activation performs the full entry sequence (connect, join the resolved
/// room, fetch history, mark the counterpart's messages read); there is no
/// incremental resume, so every reconnect repeats it from scratch.
pub struct ChatSession {
    http: Client,
    server_url: String,
    user_id: UserId,
    counterpart_id: UserId,
    room: RoomId,
    policy: ReconnectPolicy,
    inner: Mutex<SessionState>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    pub fn new(
        server_url: impl Into<String>,
        user_id: UserId,
        counterpart_id: UserId,
    ) -> Arc<Self> {
        Self::with_policy(server_url, user_id, counterpart_id, ReconnectPolicy::default())
    }

    pub fn with_policy(
        server_url: impl Into<String>,
        user_id: UserId,
        counterpart_id: UserId,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into(),
            user_id,
            counterpart_id,
            room: RoomId::for_pair(user_id, counterpart_id),
            policy,
            inner: Mutex::new(SessionState {
                view: ConversationView::new(),
                ws_tx: None,
                connected: false,
                typing_generation: 0,
            }),
            shutdown,
            events,
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connected
    }

    /// Snapshot of the merged conversation in `(timestamp, id)` order.
    pub async fn conversation(&self) -> Vec<ChatEntry> {
        self.inner.lock().await.view.entries().to_vec()
    }

    /// Full entry sequence: connect, join the room, load history, mark the
    /// counterpart's messages read. History is loaded before any live event
    /// is trusted.
    pub async fn activate(self: &Arc<Self>) -> Result<()> {
        self.connect_live_channel().await?;
        self.refresh_history().await?;
        self.mark_read().await?;
        Ok(())
    }

    /// Manual disconnect: leaves the room, cancels pending reconnect
    /// attempts and closes the connection.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let _ = self
            .send_client_event(&ClientEvent::LeaveRoom {
                room_id: self.room.clone(),
            })
            .await;
        let mut guard = self.inner.lock().await;
        // Dropping the outbound handle ends the writer task and closes the
        // socket; the read loop observes the close and winds down.
        guard.ws_tx = None;
        guard.connected = false;
    }

    /// Optimistically inserts the message, then emits it over the live
    /// channel. The returned token identifies the local entry until the
    /// broadcast copy confirms it.
    pub async fn send_text(&self, body: &str) -> Result<Uuid> {
        self.send_message(body.to_string(), MessageKind::Text, None)
            .await
    }

    /// Shares a location; the visible message text is the human-readable
    /// address, never the raw coordinates.
    pub async fn send_location(&self, location: LocationPayload) -> Result<Uuid> {
        let summary = location
            .address
            .clone()
            .unwrap_or_else(|| "Location shared".to_string());
        self.send_message(summary, MessageKind::Location, Some(location))
            .await
    }

    /// Fire-and-forget typing signal; losses self-heal on the next
    /// keystroke.
    pub async fn set_typing(&self, is_typing: bool) -> Result<()> {
        self.send_client_event(&ClientEvent::Typing {
            sender_id: self.user_id,
            receiver_id: self.counterpart_id,
            is_typing,
        })
        .await
    }

    pub async fn location_history(&self) -> Result<Vec<MessagePayload>> {
        let pins = self
            .http
            .get(format!(
                "{}/locations/{}/{}",
                self.server_url, self.user_id.0, self.counterpart_id.0
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(pins)
    }

    /// Marks everything the counterpart sent as read; returns the number of
    /// messages that changed.
    pub async fn mark_read(&self) -> Result<u64> {
        let response: MarkReadResponse = self
            .http
            .put(format!("{}/messages/read", self.server_url))
            .json(&MarkReadRequest {
                user_id: self.user_id.0,
                counterpart_id: self.counterpart_id.0,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.updated_count)
    }

    /// Fetches the full persisted history and merges it into the local
    /// view, deduplicating against optimistic entries.
    async fn refresh_history(&self) -> Result<()> {
        let history: Vec<MessagePayload> = self
            .http
            .get(format!(
                "{}/messages/{}/{}",
                self.server_url, self.user_id.0, self.counterpart_id.0
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.inner.lock().await.view.merge_history(history);
        let _ = self.events.send(SessionEvent::ConversationUpdated);
        Ok(())
    }

    pub async fn unread_count(&self) -> Result<u64> {
        let response: UnreadCountResponse = self
            .http
            .get(format!(
                "{}/messages/unread/{}",
                self.server_url, self.user_id.0
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.unread_count)
    }

    async fn send_message(
        &self,
        body: String,
        kind: MessageKind,
        location: Option<LocationPayload>,
    ) -> Result<Uuid> {
        let token = {
            let mut guard = self.inner.lock().await;
            if !guard.connected {
                return Err(anyhow!("not connected to server"));
            }
            guard.view.insert_optimistic(
                self.user_id,
                self.counterpart_id,
                body.clone(),
                kind,
                location.clone(),
            )
        };
        let _ = self.events.send(SessionEvent::ConversationUpdated);

        let emit = self
            .send_client_event(&ClientEvent::SendMessage {
                sender_id: self.user_id,
                receiver_id: self.counterpart_id,
                message: body,
                message_type: kind,
                location_data: location,
            })
            .await;
        if let Err(err) = emit {
            self.inner.lock().await.view.remove_pending(token);
            let _ = self.events.send(SessionEvent::ConversationUpdated);
            return Err(err);
        }

        let _ = self.set_typing(false).await;
        Ok(token)
    }

    async fn connect_live_channel(self: &Arc<Self>) -> Result<()> {
        let ws_url = ws_url(&self.server_url, self.user_id)?;
        let (stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        self.install_stream(stream).await?;
        Ok(())
    }

    async fn install_stream(self: &Arc<Self>, stream: WsStream) -> Result<()> {
        let (mut ws_writer, ws_reader) = stream.split();
        let (ws_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut guard = self.inner.lock().await;
            guard.ws_tx = Some(ws_tx);
            guard.connected = true;
        }
        let _ = self.events.send(SessionEvent::Connected);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Join the resolved room before trusting any live events.
        self.send_client_event(&ClientEvent::JoinRoom {
            room_id: self.room.clone(),
        })
        .await?;

        let client = Arc::clone(self);
        tokio::spawn(async move { client.read_loop(ws_reader).await });
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut ws_reader: SplitStream<WsStream>) {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => self.handle_server_event(event).await,
                    Err(err) => warn!("invalid server event: {err}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.handle_disconnect().await;
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::RoomJoined { room_id, .. } => {
                info!(room_id = %room_id, "room joined");
                let _ = self.events.send(SessionEvent::RoomJoined { room_id });
            }
            ServerEvent::ReceiveMessage(message) => {
                let outcome = self.inner.lock().await.view.apply_live(message);
                if outcome != LiveOutcome::Duplicate {
                    let _ = self.events.send(SessionEvent::ConversationUpdated);
                }
            }
            ServerEvent::MessageSent { message_id, .. } => {
                let _ = self.events.send(SessionEvent::MessageConfirmed { message_id });
            }
            ServerEvent::MessageError { error, details } => {
                warn!(error = %error, "send rejected");
                let error = match details {
                    Some(details) => format!("{error}: {details}"),
                    None => error,
                };
                let _ = self.events.send(SessionEvent::SendFailed { error });
            }
            ServerEvent::UserTyping {
                sender_id,
                is_typing,
            } => {
                if sender_id != self.counterpart_id {
                    return;
                }
                let generation = {
                    let mut guard = self.inner.lock().await;
                    guard.typing_generation += 1;
                    guard.typing_generation
                };
                let _ = self.events.send(SessionEvent::CounterpartTyping { is_typing });
                if is_typing {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(TYPING_EXPIRY).await;
                        let expired = {
                            let guard = client.inner.lock().await;
                            guard.typing_generation == generation
                        };
                        if expired {
                            let _ = client
                                .events
                                .send(SessionEvent::CounterpartTyping { is_typing: false });
                        }
                    });
                }
            }
        }
    }

    async fn handle_disconnect(self: &Arc<Self>) {
        {
            let mut guard = self.inner.lock().await;
            guard.connected = false;
            guard.ws_tx = None;
        }
        let _ = self.events.send(SessionEvent::Disconnected);
        if *self.shutdown.borrow() {
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move { client.reconnect_with_backoff().await });
    }

    /// Bounded retry loop; a manual shutdown cancels pending attempts. Each
    /// successful reconnect repeats the full join and history sequence.
    ///
    /// Returns a boxed future with an explicit `Send` bound: this method sits
    /// in a mutually recursive cycle with `activate`/`install_stream` (via the
    /// spawned read loop), so asserting `Send` at this signature boundary lets
    /// auto-trait inference terminate instead of chasing the opaque cycle.
    fn reconnect_with_backoff(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut shutdown_rx = self.shutdown.subscribe();
            for attempt in 0.. {
                let Some(delay) = self.policy.delay(attempt) else {
                    warn!(attempts = attempt, "reconnect attempts exhausted");
                    return;
                };
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    return;
                }
                if self.inner.lock().await.connected {
                    return;
                }

                info!(attempt = attempt + 1, "reconnecting live channel");
                match self.activate().await {
                    Ok(()) => return,
                    Err(err) => warn!(attempt = attempt + 1, "reconnect failed: {err}"),
                }
            }
        })
    }

    async fn send_client_event(&self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event)?;
        let guard = self.inner.lock().await;
        let ws_tx = guard
            .ws_tx
            .as_ref()
            .ok_or_else(|| anyhow!("live channel is not connected"))?;
        ws_tx
            .send(Message::Text(text))
            .map_err(|_| anyhow!("live channel closed"))?;
        Ok(())
    }
}

fn ws_url(server_url: &str, user_id: UserId) -> Result<String> {
    let ws_base = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{ws_base}/ws?user_id={}", user_id.0))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
