//! Per-account state container.
//!
//! `AccountState` owns the presence tracker, contact store, conversation
//! catalog, pending invitations and message logs of exactly one account. It is only ever touched by
//! that account's dispatcher task, which feeds it events, commands and sweep
//! ticks one at a time. Nothing here is shared or locked.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ReconcilerConfig;
use crate::contacts::ContactStore;
use crate::conversations::{ConversationReconciler, SyncOutcome};
use crate::error::{SyncError, SyncResult};
use crate::ingress::DomainEvent;
use crate::messages::MessageReconciler;
use crate::observe::SnapshotHub;
use crate::persist::{LoadedState, PersistHandle};
use crate::presence::{PresenceTracker, PresenceUpdate};
use crate::reconciler::Command;
use crate::requests::RequestQueue;
use crate::types::{
    AccountId, ContactId, ConversationId, ConversationRequest, Message, ParticipantKey,
    TrustRequest,
};

pub struct AccountState {
    account: AccountId,
    /// The local account as it appears in participant lists
    local_id: ContactId,
    presence: PresenceTracker,
    contacts: ContactStore,
    conversations: ConversationReconciler,
    requests: RequestQueue,
    messages: MessageReconciler,
    hub: Arc<SnapshotHub>,
}

impl AccountState {
    /// Build the state for `account` from persisted data and publish it.
    pub fn new(
        account: AccountId,
        config: &ReconcilerConfig,
        hub: Arc<SnapshotHub>,
        persist: PersistHandle,
        loaded: LoadedState,
    ) -> Self {
        let local_id = ContactId::new(account.as_str());
        let mut state = Self {
            presence: PresenceTracker::new(config.presence_timeout_ms),
            contacts: ContactStore::new(hub.contact_sender(), persist.clone()),
            conversations: ConversationReconciler::new(persist),
            requests: RequestQueue::new(hub.request_sender()),
            messages: MessageReconciler::new(local_id.clone()),
            account,
            local_id,
            hub,
        };
        state.contacts.load(loaded.contacts);
        for merge in state.conversations.load(loaded.conversations) {
            if let SyncOutcome::Merged {
                canonical,
                superseded,
            } = merge
            {
                info!(
                    account = %state.account,
                    canonical = %canonical,
                    superseded = %superseded,
                    "Merged persisted duplicate conversation"
                );
            }
        }
        state.publish_all();
        state
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn contacts(&self) -> &ContactStore {
        &self.contacts
    }

    pub fn conversations(&self) -> &ConversationReconciler {
        &self.conversations
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    /// Publish every observable view (after load)
    pub fn publish_all(&self) {
        let ids: Vec<ConversationId> = self
            .conversations
            .list()
            .into_iter()
            .map(|c| c.id.clone())
            .collect();
        for id in ids {
            self.publish_conversation(&id);
        }
    }

    fn publish_conversation(&self, id: &ConversationId) {
        match self.conversations.get(id) {
            Some(conversation) => {
                let snapshot = self.messages.snapshot(&conversation.id, Some(conversation));
                self.hub.publish_conversation(snapshot, conversation.aliases.iter());
            }
            None => {
                let snapshot = self.messages.snapshot(id, None);
                self.hub.publish_conversation(snapshot, []);
            }
        }
    }

    fn apply_presence_update(&mut self, update: Option<PresenceUpdate>) {
        if let Some(update) = update {
            self.contacts.apply_presence(&update);
        }
    }

    /// A contact just came into existence: give it whatever presence the
    /// tracker already knows.
    fn seed_presence(&mut self, contact_id: &ContactId) {
        let entry = self.presence.get(contact_id);
        self.contacts.seed_presence(contact_id, entry);
    }

    pub fn handle_event(&mut self, event: DomainEvent, now: i64) {
        match event {
            DomainEvent::Presence(signal) => {
                if signal.contact_id() == &self.local_id {
                    return;
                }
                let update = self.presence.apply(&signal, now);
                self.apply_presence_update(update);
            }
            DomainEvent::MessageArrived(message) => self.on_message(message),
            DomainEvent::ConversationSync {
                conversation_id,
                participants,
                messages,
            } => self.on_sync(conversation_id, participants, messages, now),
            DomainEvent::ContactAdded { contact_id } => {
                self.contacts.add(contact_id.clone());
                self.seed_presence(&contact_id);
            }
            DomainEvent::ContactRemoved { contact_id, ban } => {
                self.remove_contact(&contact_id, ban);
            }
            DomainEvent::ContactDetailsUpdated {
                contact_id,
                details,
            } => {
                self.contacts.update_details(&contact_id, details);
            }
            DomainEvent::TrustRequest {
                contact_id,
                display_name,
            } => {
                self.contacts.add_trust_request(TrustRequest {
                    from: contact_id,
                    display_name,
                    received_at: now,
                });
            }
            DomainEvent::ConversationRequest {
                conversation_id,
                from,
                participants,
            } => self.on_request(conversation_id, from, participants, now),
        }
    }

    fn on_request(
        &mut self,
        conversation_id: ConversationId,
        from: ContactId,
        participants: Vec<ContactId>,
        now: i64,
    ) {
        if self.conversations.is_removed(&conversation_id)
            || self.conversations.resolve(&conversation_id).is_some()
        {
            debug!(conversation = %conversation_id, "Invitation to known conversation absorbed");
            return;
        }
        if self.contacts.get(&from).map_or(false, |c| c.is_banned) {
            debug!(conversation = %conversation_id, from = %from, "Invitation from banned contact dropped");
            return;
        }
        let key = ParticipantKey::new(
            participants
                .into_iter()
                .chain([from.clone(), self.local_id.clone()]),
        );
        self.requests.add(ConversationRequest {
            conversation_id,
            from,
            participants: key,
            received_at: now,
        });
    }

    fn on_message(&mut self, message: Message) {
        let raw_id = message.conversation_id.clone();
        if self.conversations.is_removed(&raw_id) {
            debug!(conversation = %raw_id, message = %message.id, "Message for removed conversation dropped");
            return;
        }
        let target = self.conversations.resolve(&raw_id).unwrap_or(raw_id);
        if let Some(at) = message.timestamp {
            self.conversations.touch(&target, at);
        }
        if self.messages.insert(&target, message) {
            self.publish_conversation(&target);
        }
    }

    fn on_sync(
        &mut self,
        conversation_id: ConversationId,
        participants: Vec<ContactId>,
        messages: Vec<Message>,
        now: i64,
    ) {
        if self.conversations.is_removed(&conversation_id) {
            debug!(conversation = %conversation_id, "Sync for removed conversation dropped");
            return;
        }
        if self.requests.take(&conversation_id).is_some() {
            debug!(conversation = %conversation_id, "Pending invitation joined by sync");
        }

        for participant in &participants {
            if participant == &self.local_id {
                continue;
            }
            if self.contacts.observe_sighting(participant) {
                self.seed_presence(participant);
            }
        }

        let activity = messages.iter().filter_map(|m| m.timestamp).max();
        let key = ParticipantKey::new(participants);
        let outcome = self
            .conversations
            .apply_sync(&conversation_id, key, activity, now);

        match &outcome {
            SyncOutcome::Created(canonical) | SyncOutcome::Updated(canonical) => {
                // Messages buffered under the raw identity before it was known
                self.messages.merge(&conversation_id, canonical);
                self.messages.insert_many(canonical, messages);
                self.publish_conversation(canonical);
            }
            SyncOutcome::Merged {
                canonical,
                superseded,
            } => {
                self.messages.merge(superseded, canonical);
                self.messages.merge(&conversation_id, canonical);
                self.messages.insert_many(canonical, messages);
                self.publish_conversation(canonical);
            }
            SyncOutcome::Ignored => {}
        }
    }

    fn remove_contact(&mut self, contact_id: &ContactId, ban: bool) {
        self.contacts.remove(contact_id, ban);
        self.presence.forget(contact_id);
        if ban {
            self.requests.drop_from(contact_id);
        }
    }

    pub fn apply_command(&mut self, command: Command, now: i64) -> SyncResult<()> {
        match command {
            Command::RemoveContact { contact_id, ban } => {
                self.remove_contact(&contact_id, ban);
                Ok(())
            }
            Command::AddContact { contact_id } => {
                self.contacts.add(contact_id.clone());
                self.seed_presence(&contact_id);
                Ok(())
            }
            Command::UpdateContact { contact } => {
                let contact_id = contact.id.clone();
                self.contacts.upsert(contact);
                self.seed_presence(&contact_id);
                Ok(())
            }
            Command::AcceptTrustRequest { contact_id } => {
                self.contacts
                    .accept_trust_request(&contact_id)
                    .ok_or_else(|| SyncError::ContactNotFound(contact_id.to_string()))?;
                self.seed_presence(&contact_id);
                Ok(())
            }
            Command::DiscardTrustRequest { contact_id } => {
                if self.contacts.discard_trust_request(&contact_id) {
                    Ok(())
                } else {
                    Err(SyncError::ContactNotFound(contact_id.to_string()))
                }
            }
            Command::AcceptConversationRequest { conversation_id } => {
                let request = self
                    .requests
                    .take(&conversation_id)
                    .ok_or_else(|| SyncError::ConversationNotFound(conversation_id.to_string()))?;
                info!(conversation = %request.conversation_id, from = %request.from, "Invitation accepted");
                self.on_sync(
                    request.conversation_id,
                    request.participants.participants().to_vec(),
                    Vec::new(),
                    now,
                );
                Ok(())
            }
            Command::DeclineConversationRequest { conversation_id } => {
                let request = self
                    .requests
                    .take(&conversation_id)
                    .ok_or_else(|| SyncError::ConversationNotFound(conversation_id.to_string()))?;
                info!(conversation = %request.conversation_id, from = %request.from, "Invitation declined");
                Ok(())
            }
            Command::RemoveConversation { conversation_id } => {
                let removed = self
                    .conversations
                    .remove(&conversation_id)
                    .ok_or_else(|| SyncError::ConversationNotFound(conversation_id.to_string()))?;
                self.messages.remove(&removed.id);
                for alias in &removed.aliases {
                    self.messages.remove(alias);
                }
                self.hub.retract_conversation(&removed.id, removed.aliases.iter());
                Ok(())
            }
            Command::MarkDisplayed {
                conversation_id,
                message_id,
            } => {
                let canonical = self
                    .conversations
                    .resolve(&conversation_id)
                    .ok_or_else(|| SyncError::ConversationNotFound(conversation_id.to_string()))?;
                if self.messages.mark_displayed(&canonical, &message_id) {
                    self.publish_conversation(&canonical);
                }
                Ok(())
            }
            Command::SweepNow => {
                self.sweep(now);
                Ok(())
            }
        }
    }

    /// Expire stale presence
    pub fn sweep(&mut self, now: i64) {
        let expired = self.presence.sweep(now);
        if !expired.is_empty() {
            info!(account = %self.account, expired = expired.len(), "Presence sweep");
        }
        for update in expired {
            self.contacts.apply_presence(&update);
        }
    }
}
