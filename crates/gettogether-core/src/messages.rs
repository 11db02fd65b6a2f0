//! Message ordering reconciler.
//!
//! Messages are held by identity, never by arrival position. After every
//! mutation the presented order is recomputed with
//! [`Message::presentation_cmp`] (timestamp ascending, malformed timestamps
//! last, identity breaking ties). Because that order is total over distinct
//! identities, any interleaving of the same messages yields the same view.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::{ContactId, Conversation, ConversationId, Message, MessageId};

/// Point-in-time view of one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    /// Canonical identity
    pub conversation_id: ConversationId,
    pub participants: Vec<ContactId>,
    /// `None` until the conversation is known to the catalog
    pub last_activity_at: Option<i64>,
    /// Presentation order
    pub messages: Vec<Message>,
    /// Messages whose timestamp was missing or malformed
    pub degraded: Vec<MessageId>,
    /// Messages after the read marker not sent by the local account
    pub unread: usize,
    pub last_displayed: Option<MessageId>,
}

impl ConversationSnapshot {
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            participants: Vec::new(),
            last_activity_at: None,
            messages: Vec::new(),
            degraded: Vec::new(),
            unread: 0,
            last_displayed: None,
        }
    }

    pub fn message_ids(&self) -> Vec<&MessageId> {
        self.messages.iter().map(|m| &m.id).collect()
    }
}

/// Deduplicated, ordered message set of one conversation
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    by_id: HashMap<MessageId, usize>,
    ordered: Vec<Message>,
    last_displayed: Option<MessageId>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn reindex(&mut self) {
        self.ordered.sort_by(Message::presentation_cmp);
        self.by_id = self
            .ordered
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
    }

    /// Insert a message. Duplicates are absorbed and return false.
    ///
    /// A duplicate carrying a usable timestamp repairs a degraded copy.
    pub fn insert(&mut self, message: Message) -> bool {
        match self.by_id.get(&message.id) {
            Some(&index) => {
                let existing = &mut self.ordered[index];
                if existing.is_degraded() && !message.is_degraded() {
                    debug!(message = %message.id, "Repaired degraded timestamp from duplicate");
                    existing.timestamp = message.timestamp;
                    self.reindex();
                    true
                } else {
                    false
                }
            }
            None => {
                self.ordered.push(message);
                self.reindex();
                true
            }
        }
    }

    /// Insert a batch, re-sorting once. Returns how many changed the log.
    pub fn extend<I: IntoIterator<Item = Message>>(&mut self, messages: I) -> usize {
        let mut changed = 0;
        for message in messages {
            match self.by_id.get(&message.id) {
                Some(&index) => {
                    let existing = &mut self.ordered[index];
                    if existing.is_degraded() && !message.is_degraded() {
                        existing.timestamp = message.timestamp;
                        changed += 1;
                    }
                }
                None => {
                    self.by_id.insert(message.id.clone(), self.ordered.len());
                    self.ordered.push(message);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.reindex();
        }
        changed
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Messages in presentation order
    pub fn ordered(&self) -> &[Message] {
        &self.ordered
    }

    pub fn last_displayed(&self) -> Option<&MessageId> {
        self.last_displayed.as_ref()
    }

    /// Move the read marker. Unknown messages are rejected; the marker never
    /// moves backwards in presentation order.
    pub fn mark_displayed(&mut self, id: &MessageId) -> bool {
        let Some(&target) = self.by_id.get(id) else {
            return false;
        };
        let current = self
            .last_displayed
            .as_ref()
            .and_then(|m| self.by_id.get(m).copied());
        if current.map_or(false, |c| c >= target) {
            return false;
        }
        self.last_displayed = Some(id.clone());
        true
    }

    /// Messages after the read marker not authored by `local`
    pub fn unread(&self, local: &ContactId) -> usize {
        let start = self
            .last_displayed
            .as_ref()
            .and_then(|m| self.by_id.get(m))
            .map_or(0, |i| i + 1);
        self.ordered[start..]
            .iter()
            .filter(|m| &m.sender_id != local)
            .count()
    }

    /// Drain every message, rewriting it to belong to `conversation_id`
    fn take_all(&mut self, conversation_id: &ConversationId) -> Vec<Message> {
        self.by_id.clear();
        self.ordered
            .drain(..)
            .map(|mut m| {
                m.conversation_id = conversation_id.clone();
                m
            })
            .collect()
    }
}

/// All message logs of one account, keyed by conversation identity.
///
/// Messages for conversations the catalog does not know yet are buffered under
/// their raw identity and hoisted once the conversation appears or merges.
#[derive(Debug)]
pub struct MessageReconciler {
    logs: HashMap<ConversationId, MessageLog>,
    local_id: ContactId,
}

impl MessageReconciler {
    pub fn new(local_id: ContactId) -> Self {
        Self {
            logs: HashMap::new(),
            local_id,
        }
    }

    pub fn log(&self, conversation_id: &ConversationId) -> Option<&MessageLog> {
        self.logs.get(conversation_id)
    }

    /// Insert one message under `conversation_id` (the canonical identity)
    pub fn insert(&mut self, conversation_id: &ConversationId, mut message: Message) -> bool {
        message.conversation_id = conversation_id.clone();
        let inserted = self
            .logs
            .entry(conversation_id.clone())
            .or_default()
            .insert(message);
        if !inserted {
            debug!(conversation = %conversation_id, "Duplicate message absorbed");
        }
        inserted
    }

    pub fn insert_many(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) -> usize {
        if messages.is_empty() {
            return 0;
        }
        let messages = messages.into_iter().map(|mut m| {
            m.conversation_id = conversation_id.clone();
            m
        });
        self.logs
            .entry(conversation_id.clone())
            .or_default()
            .extend(messages)
    }

    /// Hoist every message of `from` into `into`, dropping duplicates.
    ///
    /// The read marker of `into` wins; `from`'s marker is kept only if `into`
    /// has none.
    pub fn merge(&mut self, from: &ConversationId, into: &ConversationId) -> usize {
        if from == into {
            return 0;
        }
        let Some(mut source) = self.logs.remove(from) else {
            return 0;
        };
        let marker = source.last_displayed.take();
        let messages = source.take_all(into);
        let target = self.logs.entry(into.clone()).or_default();
        let moved = target.extend(messages);
        if target.last_displayed.is_none() {
            if let Some(marker) = marker {
                target.mark_displayed(&marker);
            }
        }
        debug!(from = %from, into = %into, moved, "Merged message logs");
        moved
    }

    /// Drop a conversation's messages
    pub fn remove(&mut self, conversation_id: &ConversationId) -> Option<MessageLog> {
        self.logs.remove(conversation_id)
    }

    pub fn mark_displayed(&mut self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        match self.logs.get_mut(conversation_id) {
            Some(log) => log.mark_displayed(message_id),
            None => {
                warn!(conversation = %conversation_id, "Read marker for conversation without messages");
                false
            }
        }
    }

    /// Build the observer view. `conversation` is `None` for buffered,
    /// not-yet-catalogued identities.
    pub fn snapshot(
        &self,
        conversation_id: &ConversationId,
        conversation: Option<&Conversation>,
    ) -> ConversationSnapshot {
        let mut snapshot = ConversationSnapshot::empty(conversation_id.clone());
        if let Some(conversation) = conversation {
            snapshot.participants = conversation.participants.participants().to_vec();
            snapshot.last_activity_at = Some(conversation.last_activity_at);
        }
        if let Some(log) = self.logs.get(conversation_id) {
            snapshot.messages = log.ordered().to_vec();
            snapshot.degraded = log
                .ordered()
                .iter()
                .filter(|m| m.is_degraded())
                .map(|m| m.id.clone())
                .collect();
            snapshot.unread = log.unread(&self.local_id);
            snapshot.last_displayed = log.last_displayed().cloned();
        }
        snapshot
    }
}
