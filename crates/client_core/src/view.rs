use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, MessageKind, UserId},
    protocol::{LocationPayload, MessagePayload},
};
use uuid::Uuid;

/// Window for matching a live message to an optimistic local entry that has
/// no server id yet.
const RECONCILE_TOLERANCE_MS: i64 = 1_000;

/// One visible row of the conversation: either a server-confirmed message or
/// a locally inserted optimistic entry awaiting its broadcast copy.
#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub token: Option<Uuid>,
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
    pub message_type: MessageKind,
    pub location_data: Option<LocationPayload>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

impl ChatEntry {
    fn confirmed(message: MessagePayload) -> Self {
        Self {
            token: None,
            id: Some(message.id),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            message: message.message,
            message_type: message.message_type,
            location_data: message.location_data,
            timestamp: message.timestamp,
            is_read: message.is_read,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }
}

/// Outcome of merging a live-delivered message into the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// Replaced the matching optimistic entry with the confirmed copy.
    Confirmed,
    /// New message, appended.
    Appended,
    /// Already present under the same id; nothing changed.
    Duplicate,
}

/// Local conversation cache merging fetched history, optimistic sends and
/// live deliveries into a single duplicate-free sequence.
#[derive(Debug, Default)]
pub struct ConversationView {
    entries: Vec<ChatEntry>,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces confirmed state with `history`, keeping optimistic entries
    /// the history does not already cover.
    pub fn merge_history(&mut self, history: Vec<MessagePayload>) {
        let pending: Vec<ChatEntry> = self
            .entries
            .drain(..)
            .filter(ChatEntry::is_pending)
            .collect();
        self.entries = history.into_iter().map(ChatEntry::confirmed).collect();
        for entry in pending {
            if !self.covers(&entry) {
                self.entries.push(entry);
            }
        }
        self.sort();
    }

    /// Inserts the local copy of an outgoing message before the server has
    /// confirmed it, stamped with a client-local timestamp and a correlation
    /// token. Returns the token.
    pub fn insert_optimistic(
        &mut self,
        sender_id: UserId,
        receiver_id: UserId,
        message: String,
        message_type: MessageKind,
        location_data: Option<LocationPayload>,
    ) -> Uuid {
        let token = Uuid::new_v4();
        self.entries.push(ChatEntry {
            token: Some(token),
            id: None,
            sender_id,
            receiver_id,
            message,
            message_type,
            location_data,
            timestamp: Utc::now(),
            is_read: false,
        });
        token
    }

    /// Drops an optimistic entry whose send never reached the server.
    pub fn remove_pending(&mut self, token: Uuid) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.token != Some(token) || !entry.is_pending());
        before != self.entries.len()
    }

    /// Merges a live-delivered message. An id match is a duplicate; failing
    /// that, an optimistic entry from the same sender to the same receiver
    /// within the tolerance window is confirmed in place; anything else is
    /// appended.
    pub fn apply_live(&mut self, message: MessagePayload) -> LiveOutcome {
        if self.entries.iter().any(|e| e.id == Some(message.id)) {
            return LiveOutcome::Duplicate;
        }
        if let Some(slot) = self.entries.iter_mut().find(|e| {
            e.is_pending()
                && e.sender_id == message.sender_id
                && e.receiver_id == message.receiver_id
                && within_tolerance(e.timestamp, message.timestamp)
        }) {
            let token = slot.token;
            *slot = ChatEntry::confirmed(message);
            slot.token = token;
            self.sort();
            return LiveOutcome::Confirmed;
        }
        self.entries.push(ChatEntry::confirmed(message));
        self.sort();
        LiveOutcome::Appended
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn covers(&self, pending: &ChatEntry) -> bool {
        self.entries.iter().any(|existing| {
            existing.id.is_some()
                && existing.sender_id == pending.sender_id
                && existing.receiver_id == pending.receiver_id
                && within_tolerance(existing.timestamp, pending.timestamp)
        })
    }

    /// `(timestamp, id)` is the authoritative order; unconfirmed entries
    /// sort after confirmed ones at the same instant. The sort is stable,
    /// so ties keep arrival order.
    fn sort(&mut self) {
        self.entries.sort_by_key(|entry| {
            (
                entry.timestamp,
                entry.id.map_or(i64::MAX, |id| id.0),
            )
        });
    }
}

fn within_tolerance(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_milliseconds().abs() <= RECONCILE_TOLERANCE_MS
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
