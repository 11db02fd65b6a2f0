//! Conversation types

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{ContactId, ConversationId};

/// Order-independent participant set used as the conversation dedup key.
///
/// Sorted and deduplicated on construction, so two keys built from the same
/// participants in any order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantKey(Vec<ContactId>);

impl ParticipantKey {
    /// Build a key from any participant list
    pub fn new<I>(participants: I) -> Self
    where
        I: IntoIterator<Item = ContactId>,
    {
        let set: BTreeSet<ContactId> = participants.into_iter().collect();
        Self(set.into_iter().collect())
    }

    /// Participants in canonical order
    pub fn participants(&self) -> &[ContactId] {
        &self.0
    }

    /// Whether a contact is part of this set
    pub fn contains(&self, contact: &ContactId) -> bool {
        self.0.binary_search(contact).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A canonical conversation in the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Canonical identity
    pub id: ConversationId,
    /// Participant set
    pub participants: ParticipantKey,
    /// Unix millis of the latest known activity
    pub last_activity_at: i64,
    /// Superseded identities that now redirect here
    pub aliases: BTreeSet<ConversationId>,
}

impl Conversation {
    pub fn new(id: ConversationId, participants: ParticipantKey, last_activity_at: i64) -> Self {
        Self {
            id,
            participants,
            last_activity_at,
            aliases: BTreeSet::new(),
        }
    }

    /// Bump activity, never moving it backwards
    pub fn touch(&mut self, at: i64) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
    }

    /// Whether this conversation should win a merge against `other`.
    ///
    /// The most recent activity wins; equal activity falls back to the
    /// lexicographically smaller identity.
    pub fn outranks(&self, other: &Conversation) -> bool {
        match self.last_activity_at.cmp(&other.last_activity_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.id < other.id,
        }
    }

    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            id: self.id.clone(),
            participants: self.participants.clone(),
            last_activity_at: self.last_activity_at,
            aliases: self.aliases.iter().cloned().collect(),
        }
    }
}

/// JSON record written to the persistence gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participants: ParticipantKey,
    #[serde(default)]
    pub last_activity_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<ConversationId>,
}

impl ConversationRecord {
    pub fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            // Re-normalize in case the stored list was edited by hand
            participants: ParticipantKey::new(self.participants.0),
            last_activity_at: self.last_activity_at,
            aliases: self.aliases.into_iter().collect(),
        }
    }
}

/// An invitation to join a conversation that has been neither accepted nor
/// declined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRequest {
    pub conversation_id: ConversationId,
    /// Who sent the invitation
    pub from: ContactId,
    /// Participant set after joining, sender and local account included
    pub participants: ParticipantKey,
    /// Unix millis when the invitation arrived
    pub received_at: i64,
}
