//! Pending conversation invitations of one account.
//!
//! Requests are keyed by conversation identity, so a re-delivered invitation
//! is absorbed instead of queued twice. They are session state: the engine
//! re-delivers outstanding invitations after an account is activated.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::observe::publish_if_changed;
use crate::types::{ContactId, ConversationId, ConversationRequest};

pub struct RequestQueue {
    pending: BTreeMap<ConversationId, ConversationRequest>,
    snapshots: Arc<watch::Sender<Vec<ConversationRequest>>>,
}

impl RequestQueue {
    pub fn new(snapshots: Arc<watch::Sender<Vec<ConversationRequest>>>) -> Self {
        Self {
            pending: BTreeMap::new(),
            snapshots,
        }
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationRequest> {
        self.pending.get(conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.pending.contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending requests sorted by conversation identity
    pub fn snapshot(&self) -> Vec<ConversationRequest> {
        self.pending.values().cloned().collect()
    }

    fn publish(&self) {
        publish_if_changed(&self.snapshots, self.snapshot());
    }

    /// Queue an invitation. Returns false if one is already pending for the
    /// same conversation; the first one is kept.
    pub fn add(&mut self, request: ConversationRequest) -> bool {
        if self.pending.contains_key(&request.conversation_id) {
            debug!(conversation = %request.conversation_id, "Duplicate invitation absorbed");
            return false;
        }
        info!(
            conversation = %request.conversation_id,
            from = %request.from,
            participants = request.participants.len(),
            "Conversation invitation received"
        );
        self.pending
            .insert(request.conversation_id.clone(), request);
        self.publish();
        true
    }

    /// Remove a pending request (accepted, declined or joined by sync)
    pub fn take(&mut self, conversation_id: &ConversationId) -> Option<ConversationRequest> {
        let request = self.pending.remove(conversation_id)?;
        self.publish();
        Some(request)
    }

    /// Drop every invitation sent by `from`
    pub fn drop_from(&mut self, from: &ContactId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, request| &request.from != from);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(contact = %from, dropped, "Invitations from contact dropped");
            self.publish();
        }
        dropped
    }
}
