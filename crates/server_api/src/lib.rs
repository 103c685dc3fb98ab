use shared::{
    domain::{MessageKind, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{LocationPayload, MessagePayload},
};
use storage::{Storage, StoredMessage, LOCATION_HISTORY_LIMIT};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Persist step of the send pipeline: the message is durably written (and
/// assigned its id and timestamp) before anything is broadcast. A failure
/// here means the send failed; callers must not fan out.
pub async fn send_chat_message(
    ctx: &ApiContext,
    sender_id: UserId,
    receiver_id: UserId,
    body: &str,
    kind: MessageKind,
    location: Option<&LocationPayload>,
) -> Result<MessagePayload, ApiError> {
    let stored = ctx
        .storage
        .append_message(sender_id, receiver_id, kind, body, location)
        .await
        .map_err(storage_error)?;
    Ok(normalize(stored))
}

/// Full ordered history for the pair, in either direction. An unknown pair
/// is an empty conversation, not an error.
pub async fn conversation_history(
    ctx: &ApiContext,
    user_a: UserId,
    user_b: UserId,
) -> Result<Vec<MessagePayload>, ApiError> {
    let messages = ctx
        .storage
        .conversation_history(user_a, user_b)
        .await
        .map_err(storage_error)?;
    Ok(messages.into_iter().map(normalize).collect())
}

/// Latest location shares for the pair, newest first, capped for map
/// rendering.
pub async fn location_history(
    ctx: &ApiContext,
    user_a: UserId,
    user_b: UserId,
) -> Result<Vec<MessagePayload>, ApiError> {
    let messages = ctx
        .storage
        .location_history(user_a, user_b, LOCATION_HISTORY_LIMIT)
        .await
        .map_err(storage_error)?;
    Ok(messages.into_iter().map(normalize).collect())
}

/// Marks everything the counterpart sent to the recipient as read and
/// returns how many rows changed. Safe to call repeatedly.
pub async fn mark_conversation_read(
    ctx: &ApiContext,
    recipient_id: UserId,
    counterpart_id: UserId,
) -> Result<u64, ApiError> {
    ctx.storage
        .mark_read(recipient_id, counterpart_id)
        .await
        .map_err(storage_error)
}

pub async fn unread_count(ctx: &ApiContext, recipient_id: UserId) -> Result<u64, ApiError> {
    ctx.storage
        .unread_count(recipient_id)
        .await
        .map_err(storage_error)
}

fn normalize(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: stored.message_id,
        sender_id: stored.sender_id,
        receiver_id: stored.receiver_id,
        message: stored.body,
        message_type: stored.kind,
        location_data: stored.location,
        timestamp: stored.created_at,
        is_read: stored.is_read,
    }
}

fn storage_error(err: anyhow::Error) -> ApiError {
    match err.downcast::<ApiException>() {
        Ok(exception) => exception.into(),
        Err(other) => ApiError::new(ErrorCode::Storage, other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
