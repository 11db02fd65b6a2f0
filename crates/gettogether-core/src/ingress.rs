//! Event ingress: raw engine callbacks to typed domain events.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  EngineEvent (as delivered by the replication engine)           │
//! │  ├── PresenceChanged      → BroadcastSignal                     │
//! │  ├── MessageReceived      → Message + ActivitySignal(sender)    │
//! │  ├── ConversationSync     → ConversationSync + ActivitySignal*  │
//! │  ├── ContactEvent         → ContactAdded / ContactRemoved       │
//! │  ├── ContactDetailsUpdated→ ContactDetailsUpdated               │
//! │  ├── TrustRequestReceived → TrustRequest                        │
//! │  ├── ConversationRequestReceived → ConversationRequest          │
//! │  └── ComposingChanged     → ActivitySignal(contact)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Normalization is pure: it never looks at reconciled state, so the same raw
//! event always yields the same domain events for a given `now`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{ContactId, ConversationId, Message, MessageId};

/// Kind of contact-management notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactEventKind {
    Added,
    Removed,
    Banned,
}

/// A message as carried inside a raw engine event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub payload_ref: String,
}

/// Raw signal delivered by the replication engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    PresenceChanged { contact_id: String, online: bool },
    #[serde(rename_all = "camelCase")]
    MessageReceived {
        conversation_id: String,
        message_id: String,
        sender_id: String,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        payload_ref: String,
    },
    #[serde(rename_all = "camelCase")]
    ConversationSync {
        conversation_id: String,
        participant_ids: Vec<String>,
        #[serde(default)]
        messages: Vec<RawMessage>,
    },
    #[serde(rename_all = "camelCase")]
    ContactEvent {
        contact_id: String,
        kind: ContactEventKind,
        #[serde(default)]
        ban: bool,
    },
    #[serde(rename_all = "camelCase")]
    ContactDetailsUpdated {
        contact_id: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        avatar_uri: Option<String>,
        #[serde(default)]
        uri: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TrustRequestReceived {
        contact_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConversationRequestReceived {
        conversation_id: String,
        from: String,
        #[serde(default)]
        participant_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ComposingChanged {
        conversation_id: String,
        contact_id: String,
        composing: bool,
    },
}

/// Liveness signal consumed by the presence tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceSignal {
    /// Reliable same-network announcement
    Broadcast { contact_id: ContactId, online: bool },
    /// Inferred from inbound communication at `at`
    Activity { contact_id: ContactId, at: i64 },
}

impl PresenceSignal {
    pub fn contact_id(&self) -> &ContactId {
        match self {
            PresenceSignal::Broadcast { contact_id, .. } => contact_id,
            PresenceSignal::Activity { contact_id, .. } => contact_id,
        }
    }
}

/// Optional field updates for an existing contact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDetails {
    pub display_name: Option<String>,
    pub avatar_uri: Option<String>,
    pub uri: Option<String>,
}

/// Typed event handed to the reconcilers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    Presence(PresenceSignal),
    MessageArrived(Message),
    ConversationSync {
        conversation_id: ConversationId,
        participants: Vec<ContactId>,
        messages: Vec<Message>,
    },
    ContactAdded {
        contact_id: ContactId,
    },
    /// `ban` is carried explicitly; nothing downstream defaults it
    ContactRemoved {
        contact_id: ContactId,
        ban: bool,
    },
    ContactDetailsUpdated {
        contact_id: ContactId,
        details: ContactDetails,
    },
    TrustRequest {
        contact_id: ContactId,
        display_name: Option<String>,
    },
    /// Invitation to a conversation; `participants` may be empty
    ConversationRequest {
        conversation_id: ConversationId,
        from: ContactId,
        participants: Vec<ContactId>,
    },
}

/// Treat missing or negative engine timestamps as malformed
fn sanitize_timestamp(message_id: &str, timestamp: Option<i64>) -> Option<i64> {
    match timestamp {
        Some(t) if t >= 0 => Some(t),
        other => {
            warn!(message = %message_id, raw = ?other, "Malformed message timestamp, ordering last");
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Normalize one raw engine event into zero or more domain events.
///
/// `now` stands in for the activity time of messages whose own timestamp is
/// unusable, so a malformed message still proves its sender is alive.
pub fn normalize(event: EngineEvent, now: i64) -> Vec<DomainEvent> {
    match event {
        EngineEvent::PresenceChanged { contact_id, online } => {
            vec![DomainEvent::Presence(PresenceSignal::Broadcast {
                contact_id: contact_id.into(),
                online,
            })]
        }
        EngineEvent::MessageReceived {
            conversation_id,
            message_id,
            sender_id,
            timestamp,
            payload_ref,
        } => {
            let timestamp = sanitize_timestamp(&message_id, timestamp);
            let activity = PresenceSignal::Activity {
                contact_id: ContactId::new(sender_id.clone()),
                at: timestamp.unwrap_or(now),
            };
            let message = Message::new(
                MessageId::new(message_id),
                ConversationId::new(conversation_id),
                ContactId::new(sender_id),
                timestamp,
                payload_ref,
            );
            vec![
                DomainEvent::Presence(activity),
                DomainEvent::MessageArrived(message),
            ]
        }
        EngineEvent::ConversationSync {
            conversation_id,
            participant_ids,
            messages,
        } => {
            let conversation_id = ConversationId::new(conversation_id);
            let messages: Vec<Message> = messages
                .into_iter()
                .map(|raw| {
                    let timestamp = sanitize_timestamp(&raw.message_id, raw.timestamp);
                    Message::new(
                        raw.message_id,
                        conversation_id.clone(),
                        raw.sender_id,
                        timestamp,
                        raw.payload_ref,
                    )
                })
                .collect();

            // Latest activity per distinct sender
            let mut latest: Vec<(ContactId, i64)> = Vec::new();
            let senders: BTreeSet<&ContactId> = messages.iter().map(|m| &m.sender_id).collect();
            for sender in senders {
                let at = messages
                    .iter()
                    .filter(|m| &m.sender_id == sender)
                    .map(|m| m.timestamp.unwrap_or(now))
                    .max()
                    .unwrap_or(now);
                latest.push((sender.clone(), at));
            }

            let mut out: Vec<DomainEvent> = latest
                .into_iter()
                .map(|(contact_id, at)| {
                    DomainEvent::Presence(PresenceSignal::Activity { contact_id, at })
                })
                .collect();
            out.push(DomainEvent::ConversationSync {
                conversation_id,
                participants: participant_ids.into_iter().map(ContactId::new).collect(),
                messages,
            });
            out
        }
        EngineEvent::ContactEvent {
            contact_id,
            kind,
            ban,
        } => {
            let contact_id = ContactId::new(contact_id);
            match kind {
                ContactEventKind::Added => vec![DomainEvent::ContactAdded { contact_id }],
                ContactEventKind::Removed => vec![DomainEvent::ContactRemoved { contact_id, ban }],
                ContactEventKind::Banned => vec![DomainEvent::ContactRemoved {
                    contact_id,
                    ban: true,
                }],
            }
        }
        EngineEvent::ContactDetailsUpdated {
            contact_id,
            display_name,
            avatar_uri,
            uri,
        } => vec![DomainEvent::ContactDetailsUpdated {
            contact_id: contact_id.into(),
            details: ContactDetails {
                display_name: non_empty(display_name),
                avatar_uri: non_empty(avatar_uri),
                uri: non_empty(uri),
            },
        }],
        EngineEvent::TrustRequestReceived {
            contact_id,
            display_name,
        } => vec![DomainEvent::TrustRequest {
            contact_id: contact_id.into(),
            display_name: non_empty(display_name),
        }],
        // Invitations may be delivered from storage long after they were
        // sent, so they are not activity.
        EngineEvent::ConversationRequestReceived {
            conversation_id,
            from,
            participant_ids,
        } => vec![DomainEvent::ConversationRequest {
            conversation_id: conversation_id.into(),
            from: from.into(),
            participants: participant_ids.into_iter().map(ContactId::new).collect(),
        }],
        EngineEvent::ComposingChanged { contact_id, .. } => {
            // Both "started" and "stopped" typing are inbound traffic
            vec![DomainEvent::Presence(PresenceSignal::Activity {
                contact_id: contact_id.into(),
                at: now,
            })]
        }
    }
}
