//! Contact types
//!
//! A [`Contact`] is the merged, in-memory view of a remote identity. Presence
//! fields on it are derived by the presence tracker and are never treated as
//! authoritative when read back from storage.

use serde::{Deserialize, Serialize};

use super::ContactId;

/// Which kind of signal last set a contact's presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceSource {
    /// Same-network liveness announcement
    Broadcast,
    /// Inferred from inbound communication
    Activity,
    /// No signal received this session
    #[default]
    None,
}

/// Presence state machine: `Unknown -> Online <-> Offline`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PresenceState {
    /// No signal received yet this session
    #[default]
    Unknown,
    /// Seen recently
    Online,
    /// Explicitly offline or expired by the sweep
    Offline,
}

impl PresenceState {
    /// Whether this state counts as online
    pub fn is_online(&self) -> bool {
        matches!(self, PresenceState::Online)
    }
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceState::Unknown => write!(f, "unknown"),
            PresenceState::Online => write!(f, "online"),
            PresenceState::Offline => write!(f, "offline"),
        }
    }
}

/// A known contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Stable opaque identity
    pub id: ContactId,
    /// Engine URI for the contact (defaults to the identity)
    pub uri: String,
    /// Display name
    pub display_name: String,
    /// Optional avatar reference
    pub avatar_uri: Option<String>,
    /// Derived online flag
    pub is_online: bool,
    /// Derived presence state
    pub presence: PresenceState,
    /// Unix millis of the last liveness signal
    pub last_seen_at: Option<i64>,
    /// Source of the last liveness signal
    pub presence_source: PresenceSource,
    /// Set only by an explicit block
    pub is_banned: bool,
}

impl Contact {
    /// Create a contact with no presence information
    pub fn new(id: impl Into<ContactId>) -> Self {
        let id = id.into();
        Self {
            uri: id.as_str().to_string(),
            display_name: id.as_str().to_string(),
            id,
            avatar_uri: None,
            is_online: false,
            presence: PresenceState::Unknown,
            last_seen_at: None,
            presence_source: PresenceSource::None,
            is_banned: false,
        }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the avatar reference
    pub fn with_avatar(mut self, avatar_uri: impl Into<String>) -> Self {
        self.avatar_uri = Some(avatar_uri.into());
        self
    }

    /// Set the engine URI
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Reset presence to the initial state of a session
    pub fn clear_presence(&mut self) {
        self.is_online = false;
        self.presence = PresenceState::Unknown;
        self.last_seen_at = None;
        self.presence_source = PresenceSource::None;
    }

    /// Persisted shape of this contact
    pub fn to_record(&self) -> ContactRecord {
        ContactRecord {
            id: self.id.clone(),
            uri: self.uri.clone(),
            display_name: self.display_name.clone(),
            avatar_uri: self.avatar_uri.clone(),
            is_online: self.is_online,
            is_banned: self.is_banned,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// JSON record written to the persistence gateway
///
/// `isBanned` is omitted when false so that an explicit ban is the only thing
/// that ever puts the key on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: ContactId,
    pub uri: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_uri: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_banned: bool,
}

impl ContactRecord {
    /// Rebuild a contact from storage.
    ///
    /// The stored online flag is ignored: presence restarts as `Unknown`.
    pub fn into_contact(self) -> Contact {
        Contact {
            id: self.id,
            uri: self.uri,
            display_name: self.display_name,
            avatar_uri: self.avatar_uri,
            is_online: false,
            presence: PresenceState::Unknown,
            last_seen_at: None,
            presence_source: PresenceSource::None,
            is_banned: self.is_banned,
        }
    }
}

/// An incoming contact request that has been neither accepted nor discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRequest {
    /// Who is asking
    pub from: ContactId,
    /// Name they announced, if any
    pub display_name: Option<String>,
    /// Unix millis when the request arrived
    pub received_at: i64,
}
