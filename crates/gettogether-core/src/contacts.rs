//! Contact store: the authoritative in-memory contact map of one account.
//!
//! Every mutation publishes a new [`ContactSnapshot`] to observers and stages
//! a debounced write of the full contact list.
//!
//! Removal and banning are separate, explicitly parameterized paths:
//! - `remove(id, false)` deletes the record and tombstones the identity for
//!   the rest of the session, so a later sync cannot silently resurrect it.
//!   It never sets `is_banned`.
//! - `remove(id, true)` keeps (or creates) the record with `is_banned = true`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::gateway::BlobKey;
use crate::ingress::ContactDetails;
use crate::observe::watch_stream;
use crate::persist::PersistHandle;
use crate::presence::{PresenceEntry, PresenceUpdate};
use crate::types::{Contact, ContactId, ContactRecord, PresenceState, TrustRequest};

/// Point-in-time view of the contact list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactSnapshot {
    /// Contacts sorted by identity
    pub contacts: Vec<Contact>,
    /// Pending incoming trust requests, sorted by identity
    pub trust_requests: Vec<TrustRequest>,
}

impl ContactSnapshot {
    pub fn get(&self, contact_id: &ContactId) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.id == contact_id)
    }

    pub fn online(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(|c| c.is_online)
    }
}

pub struct ContactStore {
    contacts: HashMap<ContactId, Contact>,
    /// Identities explicitly removed this session
    removed: HashSet<ContactId>,
    trust_requests: BTreeMap<ContactId, TrustRequest>,
    snapshots: Arc<watch::Sender<ContactSnapshot>>,
    persist: PersistHandle,
}

impl ContactStore {
    pub fn new(snapshots: Arc<watch::Sender<ContactSnapshot>>, persist: PersistHandle) -> Self {
        Self {
            contacts: HashMap::new(),
            removed: HashSet::new(),
            trust_requests: BTreeMap::new(),
            snapshots,
            persist,
        }
    }

    /// Replace the whole map with persisted contacts (account activation).
    ///
    /// Publishes but does not stage a write: the data came from storage.
    pub fn load(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts.into_iter().map(|c| (c.id.clone(), c)).collect();
        self.removed.clear();
        self.trust_requests.clear();
        info!(count = self.contacts.len(), "Loaded contacts");
        self.publish();
    }

    pub fn get(&self, contact_id: &ContactId) -> Option<Contact> {
        self.contacts.get(contact_id).cloned()
    }

    pub fn contains(&self, contact_id: &ContactId) -> bool {
        self.contacts.contains_key(contact_id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Whether the identity was explicitly removed this session
    pub fn is_tombstoned(&self, contact_id: &ContactId) -> bool {
        self.removed.contains(contact_id)
    }

    /// Lazy, infinite stream of snapshots starting with the current one
    pub fn observe_changes(&self) -> BoxStream<'static, ContactSnapshot> {
        watch_stream(self.snapshots.subscribe())
    }

    pub fn snapshot(&self) -> ContactSnapshot {
        let mut contacts: Vec<Contact> = self.contacts.values().cloned().collect();
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        ContactSnapshot {
            contacts,
            trust_requests: self.trust_requests.values().cloned().collect(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn commit(&self) {
        self.publish();
        let mut records: Vec<ContactRecord> =
            self.contacts.values().map(Contact::to_record).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        self.persist.stage_json(BlobKey::Contacts, &records);
    }

    /// Explicitly add or update a contact.
    ///
    /// Profile fields come from `contact`; presence and ban state are kept from
    /// the existing record (new contacts start unbanned). Clears any tombstone.
    pub fn upsert(&mut self, contact: Contact) {
        self.removed.remove(&contact.id);
        self.trust_requests.remove(&contact.id);
        match self.contacts.get_mut(&contact.id) {
            Some(existing) => {
                existing.display_name = contact.display_name;
                existing.avatar_uri = contact.avatar_uri;
                existing.uri = contact.uri;
            }
            None => {
                let mut fresh = contact;
                fresh.is_banned = false;
                fresh.clear_presence();
                debug!(contact = %fresh.id, "Contact added");
                self.contacts.insert(fresh.id.clone(), fresh);
            }
        }
        self.commit();
    }

    /// Explicit (re-)add by identity. Re-adding a banned contact unbans it.
    pub fn add(&mut self, contact_id: ContactId) {
        let unban = self
            .contacts
            .get(&contact_id)
            .map(|c| c.is_banned)
            .unwrap_or(false);
        if unban {
            if let Some(contact) = self.contacts.get_mut(&contact_id) {
                contact.is_banned = false;
            }
            info!(contact = %contact_id, "Banned contact re-added, ban lifted");
        }
        let contact = self
            .contacts
            .get(&contact_id)
            .cloned()
            .unwrap_or_else(|| Contact::new(contact_id));
        self.upsert(contact);
    }

    /// A contact seen in replicated state (e.g. as a conversation participant).
    ///
    /// Creates the record on first sighting; ignored for tombstoned identities.
    /// Returns true if a contact was created.
    pub fn observe_sighting(&mut self, contact_id: &ContactId) -> bool {
        if self.contacts.contains_key(contact_id) {
            return false;
        }
        if self.removed.contains(contact_id) {
            debug!(contact = %contact_id, "Ignoring sync sighting of removed contact");
            return false;
        }
        self.contacts
            .insert(contact_id.clone(), Contact::new(contact_id.clone()));
        debug!(contact = %contact_id, "Contact created from sync");
        self.commit();
        true
    }

    /// Remove or ban a contact.
    ///
    /// `ban` is the only way `is_banned` becomes true. Returns false when
    /// nothing changed.
    pub fn remove(&mut self, contact_id: &ContactId, ban: bool) -> bool {
        self.trust_requests.remove(contact_id);
        if ban {
            let contact = self
                .contacts
                .entry(contact_id.clone())
                .or_insert_with(|| Contact::new(contact_id.clone()));
            contact.is_banned = true;
            contact.clear_presence();
            info!(contact = %contact_id, "Contact banned");
            self.commit();
            return true;
        }

        self.removed.insert(contact_id.clone());
        match self.contacts.remove(contact_id) {
            Some(_) => {
                info!(contact = %contact_id, "Contact removed");
                self.commit();
                true
            }
            None => {
                self.publish();
                false
            }
        }
    }

    /// Merge non-empty detail fields into an existing contact
    pub fn update_details(&mut self, contact_id: &ContactId, details: ContactDetails) -> bool {
        let Some(contact) = self.contacts.get_mut(contact_id) else {
            debug!(contact = %contact_id, "Details for unknown contact ignored");
            return false;
        };
        let before = contact.clone();
        if let Some(name) = details.display_name {
            contact.display_name = name;
        }
        if let Some(avatar) = details.avatar_uri {
            contact.avatar_uri = Some(avatar);
        }
        if let Some(uri) = details.uri {
            contact.uri = uri;
        }
        let changed = *contact != before;
        if changed {
            self.commit();
        }
        changed
    }

    /// Fold a presence change into the contact, if it is a known, unbanned one
    pub fn apply_presence(&mut self, update: &PresenceUpdate) -> bool {
        let Some(contact) = self.contacts.get_mut(&update.contact_id) else {
            return false;
        };
        if contact.is_banned {
            return false;
        }
        let before = contact.clone();
        contact.presence = update.state;
        contact.is_online = update.state == PresenceState::Online;
        contact.presence_source = update.source;
        contact.last_seen_at = update.last_seen_at;
        let changed = *contact != before;
        if changed {
            self.commit();
        }
        changed
    }

    /// Seed a freshly created contact with already-tracked presence
    pub fn seed_presence(&mut self, contact_id: &ContactId, entry: Option<PresenceEntry>) {
        if let Some(entry) = entry {
            self.apply_presence(&PresenceUpdate {
                contact_id: contact_id.clone(),
                state: entry.state,
                source: entry.source,
                last_seen_at: entry.last_seen_at,
            });
        }
    }

    /// Record an incoming trust request. Ignored for banned or existing contacts.
    pub fn add_trust_request(&mut self, request: TrustRequest) -> bool {
        if let Some(existing) = self.contacts.get(&request.from) {
            debug!(contact = %request.from, banned = existing.is_banned, "Trust request from known contact ignored");
            return false;
        }
        if self.trust_requests.contains_key(&request.from) {
            return false;
        }
        info!(contact = %request.from, "Trust request received");
        self.trust_requests.insert(request.from.clone(), request);
        self.publish();
        true
    }

    /// Accept a pending trust request, turning it into a contact
    pub fn accept_trust_request(&mut self, contact_id: &ContactId) -> Option<Contact> {
        let request = self.trust_requests.remove(contact_id)?;
        let mut contact = Contact::new(contact_id.clone());
        if let Some(name) = request.display_name {
            contact.display_name = name;
        }
        self.upsert(contact);
        self.get(contact_id)
    }

    /// Drop a pending trust request. This is not a ban.
    pub fn discard_trust_request(&mut self, contact_id: &ContactId) -> bool {
        let dropped = self.trust_requests.remove(contact_id).is_some();
        if dropped {
            self.publish();
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PresenceSource;

    fn store() -> (ContactStore, watch::Receiver<ContactSnapshot>, PersistHandle) {
        let (tx, rx) = watch::channel(ContactSnapshot::default());
        let persist = PersistHandle::new();
        (ContactStore::new(Arc::new(tx), persist.clone()), rx, persist)
    }

    fn online(id: &str, at: i64) -> PresenceUpdate {
        PresenceUpdate {
            contact_id: id.into(),
            state: PresenceState::Online,
            source: PresenceSource::Activity,
            last_seen_at: Some(at),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let (mut store, rx, persist) = store();
        store.upsert(Contact::new("alice").with_display_name("Alice"));

        assert_eq!(store.get(&"alice".into()).unwrap().display_name, "Alice");
        assert_eq!(rx.borrow().contacts.len(), 1);
        assert!(persist.pending(BlobKey::Contacts).is_some());
    }

    #[test]
    fn test_upsert_cannot_ban() {
        let (mut store, _rx, _persist) = store();
        let mut contact = Contact::new("alice");
        contact.is_banned = true;
        store.upsert(contact);
        assert!(!store.get(&"alice".into()).unwrap().is_banned);
    }

    #[test]
    fn test_upsert_keeps_presence() {
        let (mut store, _rx, _persist) = store();
        store.upsert(Contact::new("alice"));
        store.apply_presence(&online("alice", 10));

        store.upsert(Contact::new("alice").with_display_name("Alice 2"));
        let contact = store.get(&"alice".into()).unwrap();
        assert!(contact.is_online);
        assert_eq!(contact.display_name, "Alice 2");
    }

    #[test]
    fn test_remove_without_ban_never_bans() {
        let (mut store, _rx, _persist) = store();
        store.upsert(Contact::new("alice"));
        assert!(store.remove(&"alice".into(), false));

        assert!(store.get(&"alice".into()).is_none());
        assert!(store.is_tombstoned(&"alice".into()));
    }

    #[test]
    fn test_remove_without_ban_after_ban_clears_record() {
        let (mut store, _rx, _persist) = store();
        store.upsert(Contact::new("alice"));
        store.remove(&"alice".into(), true);
        assert!(store.get(&"alice".into()).unwrap().is_banned);

        store.remove(&"alice".into(), false);
        assert!(store.get(&"alice".into()).map_or(true, |c| !c.is_banned));
    }

    #[test]
    fn test_ban_keeps_record() {
        let (mut store, _rx, persist) = store();
        store.upsert(Contact::new("mallory"));
        store.apply_presence(&online("mallory", 1));
        store.remove(&"mallory".into(), true);

        let contact = store.get(&"mallory".into()).unwrap();
        assert!(contact.is_banned);
        assert!(!contact.is_online);

        let blob = persist.pending(BlobKey::Contacts).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(json[0]["isBanned"], true);
    }

    #[test]
    fn test_sighting_does_not_resurrect_removed_contact() {
        let (mut store, _rx, _persist) = store();
        assert!(store.observe_sighting(&"alice".into()));
        store.remove(&"alice".into(), false);

        assert!(!store.observe_sighting(&"alice".into()));
        assert!(store.get(&"alice".into()).is_none());

        // Explicit add is allowed
        store.add("alice".into());
        assert!(store.get(&"alice".into()).is_some());
    }

    #[test]
    fn test_add_unbans() {
        let (mut store, _rx, _persist) = store();
        store.remove(&"mallory".into(), true);
        store.add("mallory".into());
        assert!(!store.get(&"mallory".into()).unwrap().is_banned);
    }

    #[test]
    fn test_banned_contact_ignores_presence() {
        let (mut store, _rx, _persist) = store();
        store.remove(&"mallory".into(), true);
        assert!(!store.apply_presence(&online("mallory", 5)));
    }

    #[test]
    fn test_presence_unknown_contact_ignored() {
        let (mut store, _rx, _persist) = store();
        assert!(!store.apply_presence(&online("nobody", 5)));
    }

    #[test]
    fn test_update_details_only_existing() {
        let (mut store, _rx, _persist) = store();
        let details = ContactDetails {
            display_name: Some("Alice".into()),
            ..Default::default()
        };
        assert!(!store.update_details(&"alice".into(), details.clone()));
        assert!(store.get(&"alice".into()).is_none());

        store.upsert(Contact::new("alice"));
        assert!(store.update_details(&"alice".into(), details.clone()));
        assert!(!store.update_details(&"alice".into(), details));
    }

    #[test]
    fn test_trust_request_accept_and_discard() {
        let (mut store, rx, _persist) = store();
        let request = |id: &str| TrustRequest {
            from: id.into(),
            display_name: Some(format!("{id}!")),
            received_at: 0,
        };

        assert!(store.add_trust_request(request("alice")));
        assert!(store.add_trust_request(request("bob")));
        assert_eq!(rx.borrow().trust_requests.len(), 2);

        let alice = store.accept_trust_request(&"alice".into()).unwrap();
        assert_eq!(alice.display_name, "alice!");

        assert!(store.discard_trust_request(&"bob".into()));
        assert!(store.get(&"bob".into()).is_none());
        assert!(!store.is_tombstoned(&"bob".into()));
        assert!(rx.borrow().trust_requests.is_empty());
    }

    #[test]
    fn test_trust_request_from_banned_ignored() {
        let (mut store, _rx, _persist) = store();
        store.remove(&"mallory".into(), true);
        assert!(!store.add_trust_request(TrustRequest {
            from: "mallory".into(),
            display_name: None,
            received_at: 0,
        }));
    }

    #[test]
    fn test_unchanged_state_does_not_notify() {
        let (mut store, mut rx, _persist) = store();
        store.upsert(Contact::new("alice"));
        rx.borrow_and_update();

        store.apply_presence(&online("alice", 10));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        store.apply_presence(&online("alice", 10));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_load_replaces_contents() {
        let (mut store, rx, persist) = store();
        store.upsert(Contact::new("old"));
        let staged = persist.pending(BlobKey::Contacts);

        store.load(vec![Contact::new("new")]);
        assert!(store.get(&"old".into()).is_none());
        assert!(store.contains(&"new".into()));
        assert_eq!(rx.borrow().contacts[0].id.as_str(), "new");
        assert_eq!(persist.pending(BlobKey::Contacts), staged);
    }
}
