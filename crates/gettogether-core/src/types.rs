//! Core types for Get-Together
//!
//! Identities handed to us by the replication engine are opaque strings. They
//! are wrapped in newtypes so a contact id can never be passed where a
//! conversation id is expected.

use serde::{Deserialize, Serialize};

pub mod contact;
pub mod conversation;
pub mod message;

pub use contact::{Contact, ContactRecord, PresenceSource, PresenceState, TrustRequest};
pub use conversation::{Conversation, ConversationRecord, ConversationRequest, ParticipantKey};
pub use message::Message;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identity string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identity string
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Unwrap into the identity string
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Local account whose state is being reconciled
    AccountId
);

string_id!(
    /// Stable identity of a remote contact
    ContactId
);

string_id!(
    /// Identity of a conversation as created by the replication engine
    ConversationId
);

string_id!(
    /// Identity of a message, unique within its conversation
    MessageId
);
