//! Message type

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{ContactId, ConversationId, MessageId};

/// A message as reported by the replication engine.
///
/// `timestamp` is `None` when the engine delivered a missing or malformed
/// value; such messages are kept and ordered after every timestamped one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique within the conversation
    pub id: MessageId,
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Author
    pub sender_id: ContactId,
    /// Unix millis assigned by the author
    pub timestamp: Option<i64>,
    /// Opaque payload reference
    pub payload_ref: String,
}

impl Message {
    pub fn new(
        id: impl Into<MessageId>,
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<ContactId>,
        timestamp: Option<i64>,
        payload_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            timestamp,
            payload_ref: payload_ref.into(),
        }
    }

    /// Whether the timestamp was missing or malformed
    pub fn is_degraded(&self) -> bool {
        self.timestamp.is_none()
    }

    /// Presentation order: timestamp ascending, degraded last, id breaks ties.
    pub fn presentation_cmp(&self, other: &Message) -> Ordering {
        match (self.timestamp, other.timestamp) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.id.cmp(&other.id))
    }
}
