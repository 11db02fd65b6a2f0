//! Snapshot fan-out to observers.
//!
//! State owners publish complete snapshots into `watch` channels; observers get
//! lazy streams that start with the current value and then yield every change.
//! A `watch` channel only re-notifies when the published value actually
//! differs, so duplicate or no-op mutations never reach the UI.
//!
//! ```text
//!   AccountState ──publish──▶ SnapshotHub ──watch──▶ observe_contacts()
//!                                  │
//!                                  ├──watch─────────▶ observe_conversation_requests()
//!                                  │
//!                                  └──watch per id──▶ observe_conversation(id)
//! ```
//!
//! Channels outlive account switches: on a switch the hub publishes empty
//! snapshots and the new account's state follows, so an observer stream never
//! has to be re-created.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::contacts::ContactSnapshot;
use crate::messages::ConversationSnapshot;
use crate::types::{ConversationId, ConversationRequest};

/// Turn a watch receiver into a stream: current value first, then changes.
///
/// The stream ends only when the sending side is dropped.
pub fn watch_stream<T>(rx: watch::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + Sync + 'static,
{
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first {
            rx.changed().await.ok()?;
        }
        let value = rx.borrow_and_update().clone();
        Some((value, (rx, false)))
    })
    .boxed()
}

pub(crate) fn publish_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) -> bool {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}

/// Owner of every observer channel of a [`crate::Reconciler`]
pub struct SnapshotHub {
    contacts: Arc<watch::Sender<ContactSnapshot>>,
    requests: Arc<watch::Sender<Vec<ConversationRequest>>>,
    conversations: Mutex<HashMap<ConversationId, Arc<watch::Sender<ConversationSnapshot>>>>,
    /// Superseded identity -> canonical identity
    routes: Mutex<HashMap<ConversationId, ConversationId>>,
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotHub {
    pub fn new() -> Self {
        let (contacts, _) = watch::channel(ContactSnapshot::default());
        let (requests, _) = watch::channel(Vec::new());
        Self {
            contacts: Arc::new(contacts),
            requests: Arc::new(requests),
            conversations: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Sender handed to the contact store
    pub fn contact_sender(&self) -> Arc<watch::Sender<ContactSnapshot>> {
        self.contacts.clone()
    }

    pub fn subscribe_contacts(&self) -> BoxStream<'static, ContactSnapshot> {
        watch_stream(self.contacts.subscribe())
    }

    pub fn current_contacts(&self) -> ContactSnapshot {
        self.contacts.borrow().clone()
    }

    /// Sender handed to the invitation queue
    pub fn request_sender(&self) -> Arc<watch::Sender<Vec<ConversationRequest>>> {
        self.requests.clone()
    }

    pub fn subscribe_requests(&self) -> BoxStream<'static, Vec<ConversationRequest>> {
        watch_stream(self.requests.subscribe())
    }

    pub fn current_requests(&self) -> Vec<ConversationRequest> {
        self.requests.borrow().clone()
    }

    fn conversation_sender(&self, id: &ConversationId) -> Arc<watch::Sender<ConversationSnapshot>> {
        self.conversations
            .lock()
            .entry(id.clone())
            .or_insert_with(|| {
                let (tx, _) = watch::channel(ConversationSnapshot::empty(id.clone()));
                Arc::new(tx)
            })
            .clone()
    }

    /// Canonical identity for `id`, following merges
    pub fn route(&self, id: &ConversationId) -> ConversationId {
        self.routes.lock().get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Stream of snapshots for a conversation.
    ///
    /// A superseded identity observes its canonical conversation.
    pub fn subscribe_conversation(&self, id: &ConversationId) -> BoxStream<'static, ConversationSnapshot> {
        let canonical = self.route(id);
        watch_stream(self.conversation_sender(&canonical).subscribe())
    }

    /// Latest snapshot; reading never allocates a channel
    pub fn current_conversation(&self, id: &ConversationId) -> ConversationSnapshot {
        let canonical = self.route(id);
        let tx = self.conversations.lock().get(&canonical).cloned();
        match tx {
            Some(tx) => tx.borrow().clone(),
            None => ConversationSnapshot::empty(canonical),
        }
    }

    /// Number of live conversation channels
    pub fn channel_count(&self) -> usize {
        self.conversations.lock().len()
    }

    /// Publish a conversation snapshot under its identity and every alias.
    ///
    /// Observers that subscribed to an alias before the merge keep receiving
    /// the canonical conversation through their existing channel.
    pub fn publish_conversation<'a, I>(&self, snapshot: ConversationSnapshot, aliases: I)
    where
        I: IntoIterator<Item = &'a ConversationId>,
    {
        let canonical = snapshot.conversation_id.clone();
        let aliases: Vec<ConversationId> = aliases.into_iter().cloned().collect();
        {
            let mut routes = self.routes.lock();
            routes.remove(&canonical);
            for alias in &aliases {
                routes.insert(alias.clone(), canonical.clone());
            }
        }

        let alias_senders: Vec<_> = {
            let conversations = self.conversations.lock();
            aliases
                .iter()
                .filter_map(|alias| conversations.get(alias).cloned())
                .collect()
        };
        for tx in alias_senders {
            publish_if_changed(&tx, snapshot.clone());
        }
        publish_if_changed(&self.conversation_sender(&canonical), snapshot);
    }

    /// Publish empty snapshots for a conversation that no longer exists
    pub fn retract_conversation<'a, I>(&self, id: &ConversationId, aliases: I)
    where
        I: IntoIterator<Item = &'a ConversationId>,
    {
        let mut ids = vec![id.clone()];
        ids.extend(aliases.into_iter().cloned());
        {
            let mut routes = self.routes.lock();
            for each in &ids {
                routes.remove(each);
            }
        }
        let conversations = self.conversations.lock();
        for each in &ids {
            if let Some(tx) = conversations.get(each) {
                publish_if_changed(tx, ConversationSnapshot::empty(each.clone()));
            }
        }
    }

    /// Blank every channel for an account switch and drop unobserved ones
    pub fn reset(&self) {
        publish_if_changed(&self.contacts, ContactSnapshot::default());
        publish_if_changed(&self.requests, Vec::new());
        self.routes.lock().clear();

        let mut conversations = self.conversations.lock();
        conversations.retain(|_, tx| tx.receiver_count() > 0);
        for (id, tx) in conversations.iter() {
            publish_if_changed(tx, ConversationSnapshot::empty(id.clone()));
        }
        debug!(observed = conversations.len(), "Snapshot hub reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Contact, Message};

    fn snapshot_with(id: &str, message_ids: &[&str]) -> ConversationSnapshot {
        let mut snapshot = ConversationSnapshot::empty(id.into());
        snapshot.messages = message_ids
            .iter()
            .enumerate()
            .map(|(i, m)| Message::new(*m, id, "alice", Some(i as i64), "p"))
            .collect();
        snapshot
    }

    #[tokio::test]
    async fn test_stream_yields_current_then_changes() {
        let hub = SnapshotHub::new();
        let mut stream = hub.subscribe_contacts();

        let first = stream.next().await.unwrap();
        assert!(first.contacts.is_empty());

        hub.contact_sender().send_replace(ContactSnapshot {
            contacts: vec![Contact::new("alice")],
            trust_requests: Vec::new(),
        });
        let second = stream.next().await.unwrap();
        assert_eq!(second.contacts.len(), 1);
    }

    #[tokio::test]
    async fn test_each_subscription_restarts_from_current() {
        let hub = SnapshotHub::new();
        hub.publish_conversation(snapshot_with("c1", &["m1"]), []);

        let mut a = hub.subscribe_conversation(&"c1".into());
        let mut b = hub.subscribe_conversation(&"c1".into());
        assert_eq!(a.next().await.unwrap().messages.len(), 1);
        assert_eq!(b.next().await.unwrap().messages.len(), 1);
    }

    #[test]
    fn test_identical_publish_does_not_notify() {
        let hub = SnapshotHub::new();
        let tx = hub.conversation_sender(&"c1".into());
        let mut rx = tx.subscribe();

        hub.publish_conversation(snapshot_with("c1", &["m1"]), []);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        hub.publish_conversation(snapshot_with("c1", &["m1"]), []);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_alias_routes_to_canonical() {
        let hub = SnapshotHub::new();
        let alias_tx = hub.conversation_sender(&"old".into());
        let mut alias_rx = alias_tx.subscribe();

        let aliases = [ConversationId::from("old")];
        hub.publish_conversation(snapshot_with("new", &["m1", "m2"]), aliases.iter());

        assert_eq!(hub.route(&"old".into()).as_str(), "new");
        assert_eq!(alias_rx.borrow_and_update().messages.len(), 2);
        assert_eq!(hub.current_conversation(&"old".into()).conversation_id.as_str(), "new");
    }

    #[test]
    fn test_retract_publishes_empty() {
        let hub = SnapshotHub::new();
        hub.publish_conversation(snapshot_with("c1", &["m1"]), []);
        let mut rx = hub.conversation_sender(&"c1".into()).subscribe();

        hub.retract_conversation(&"c1".into(), []);
        assert!(rx.borrow_and_update().messages.is_empty());
    }

    #[test]
    fn test_reset_blanks_observed_channels() {
        let hub = SnapshotHub::new();
        let _stream = hub.subscribe_conversation(&"watched".into());
        hub.publish_conversation(snapshot_with("watched", &["m1"]), []);
        hub.publish_conversation(snapshot_with("unwatched", &["m1"]), []);

        hub.reset();

        assert!(hub.current_conversation(&"watched".into()).messages.is_empty());
        assert_eq!(hub.channel_count(), 1);
    }

    #[test]
    fn test_reset_clears_requests() {
        let hub = SnapshotHub::new();
        hub.request_sender().send_replace(vec![ConversationRequest {
            conversation_id: "c1".into(),
            from: "alice".into(),
            participants: crate::types::ParticipantKey::new([crate::types::ContactId::from("alice")]),
            received_at: 0,
        }]);
        assert_eq!(hub.current_requests().len(), 1);

        hub.reset();
        assert!(hub.current_requests().is_empty());
    }

    #[test]
    fn test_reading_unknown_conversation_allocates_nothing() {
        let hub = SnapshotHub::new();
        for i in 0..10 {
            let id = ConversationId::new(format!("unknown-{i}"));
            let snapshot = hub.current_conversation(&id);
            assert_eq!(snapshot.conversation_id, id);
            assert!(snapshot.messages.is_empty());
        }
        assert_eq!(hub.channel_count(), 0);
    }
}
