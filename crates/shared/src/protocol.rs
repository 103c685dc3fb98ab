use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageKind, RoomId, UserId},
    error::{ApiException, ErrorCode},
};

/// Structured coordinates attached to a location share. `message` on the
/// carrying payload holds the human-readable summary; the raw coordinates
/// live here and must survive a storage round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl LocationPayload {
    /// Coordinates must be finite and within geographic bounds.
    pub fn validate(&self) -> Result<(), ApiException> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ApiException::new(
                ErrorCode::Validation,
                format!("latitude out of range: {}", self.latitude),
            ));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ApiException::new(
                ErrorCode::Validation,
                format!("longitude out of range: {}", self.longitude),
            ));
        }
        Ok(())
    }
}

/// Normalized message shape delivered over the live channel and from the
/// history endpoints. `timestamp` and `id` are server-assigned and define
/// conversation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_data: Option<LocationPayload>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    SendMessage {
        sender_id: UserId,
        receiver_id: UserId,
        message: String,
        #[serde(default)]
        message_type: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location_data: Option<LocationPayload>,
    },
    Typing {
        sender_id: UserId,
        receiver_id: UserId,
        is_typing: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    RoomJoined {
        room_id: RoomId,
        message: String,
    },
    ReceiveMessage(MessagePayload),
    MessageSent {
        success: bool,
        message_id: MessageId,
        message_type: MessageKind,
    },
    MessageError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    UserTyping {
        sender_id: UserId,
        is_typing: bool,
    },
}
