//! Conversation reconciler: the canonical conversation catalog.
//!
//! The replication engine may create several conversations for the same
//! participants (concurrent multi-device invites). The catalog keys every
//! conversation by its order-independent [`ParticipantKey`] and keeps at most
//! one canonical conversation per key.
//!
//! ```text
//!   sync(id, key) ─┬─ id removed this session ──────────▶ Ignored
//!                  ├─ id (or alias) known, same key ────▶ Updated
//!                  ├─ id known, key changed ────────────▶ re-key, merge on collision
//!                  ├─ id unknown, key taken ────────────▶ Merged (loser becomes alias)
//!                  └─ id unknown, key free ─────────────▶ Created
//! ```
//!
//! The merge winner is the conversation with the most recent activity; equal
//! activity goes to the lexicographically smaller identity. The loser's
//! identity and aliases are kept as aliases of the winner so late events naming
//! them are redirected instead of spawning a new conversation.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::gateway::BlobKey;
use crate::persist::PersistHandle;
use crate::types::{Conversation, ConversationId, ConversationRecord, ParticipantKey};

/// Result of applying one sync event to the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Created(ConversationId),
    Updated(ConversationId),
    /// `superseded` now redirects to `canonical`; its messages must be hoisted
    Merged {
        canonical: ConversationId,
        superseded: ConversationId,
    },
    Ignored,
}

impl SyncOutcome {
    /// Canonical identity the event's messages belong to
    pub fn canonical(&self) -> Option<&ConversationId> {
        match self {
            SyncOutcome::Created(id) | SyncOutcome::Updated(id) => Some(id),
            SyncOutcome::Merged { canonical, .. } => Some(canonical),
            SyncOutcome::Ignored => None,
        }
    }
}

pub struct ConversationReconciler {
    conversations: HashMap<ConversationId, Conversation>,
    by_key: HashMap<ParticipantKey, ConversationId>,
    /// Superseded identity -> canonical identity
    aliases: HashMap<ConversationId, ConversationId>,
    /// Identities explicitly removed this session
    removed: HashSet<ConversationId>,
    persist: PersistHandle,
}

impl ConversationReconciler {
    pub fn new(persist: PersistHandle) -> Self {
        Self {
            conversations: HashMap::new(),
            by_key: HashMap::new(),
            aliases: HashMap::new(),
            removed: HashSet::new(),
            persist,
        }
    }

    /// Rebuild the catalog from persisted conversations.
    ///
    /// Persisted duplicates of one participant set are merged on the way in
    /// and the merged catalog is staged for writing. Returns those merges.
    pub fn load(&mut self, conversations: Vec<Conversation>) -> Vec<SyncOutcome> {
        self.conversations.clear();
        self.by_key.clear();
        self.aliases.clear();
        self.removed.clear();

        let mut merges = Vec::new();
        for conversation in conversations {
            if self.conversations.contains_key(&conversation.id) {
                warn!(conversation = %conversation.id, "Duplicate persisted conversation skipped");
                continue;
            }
            match self.by_key.get(&conversation.participants).cloned() {
                Some(existing) => merges.push(self.merge(existing, conversation)),
                None => self.install(conversation),
            }
        }
        info!(count = self.conversations.len(), "Loaded conversations");
        if !merges.is_empty() {
            self.commit();
        }
        merges
    }

    fn install(&mut self, conversation: Conversation) {
        for alias in &conversation.aliases {
            self.aliases.insert(alias.clone(), conversation.id.clone());
        }
        self.by_key
            .insert(conversation.participants.clone(), conversation.id.clone());
        self.conversations.insert(conversation.id.clone(), conversation);
    }

    fn commit(&self) {
        self.persist.stage_json(BlobKey::Conversations, &self.to_records());
    }

    /// Records for persistence, sorted by identity
    pub fn to_records(&self) -> Vec<ConversationRecord> {
        let mut records: Vec<ConversationRecord> =
            self.conversations.values().map(Conversation::to_record).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Canonical identity for `id`, if it or an alias of it is catalogued
    pub fn resolve(&self, id: &ConversationId) -> Option<ConversationId> {
        if self.conversations.contains_key(id) {
            return Some(id.clone());
        }
        self.aliases.get(id).cloned()
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.resolve(id).and_then(|c| self.conversations.get(&c))
    }

    pub fn find_by_participants(&self, key: &ParticipantKey) -> Option<&Conversation> {
        self.by_key.get(key).and_then(|id| self.conversations.get(id))
    }

    pub fn is_removed(&self, id: &ConversationId) -> bool {
        self.removed.contains(id)
    }

    /// Canonical conversations sorted by identity
    pub fn list(&self) -> Vec<&Conversation> {
        let mut all: Vec<&Conversation> = self.conversations.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Apply a conversation-sync event.
    ///
    /// `activity` is the newest message time carried by the event, if any; a
    /// brand-new conversation without messages starts at `now`. A duplicate
    /// without messages never outranks the conversation it merges into.
    pub fn apply_sync(
        &mut self,
        id: &ConversationId,
        key: ParticipantKey,
        activity: Option<i64>,
        now: i64,
    ) -> SyncOutcome {
        if self.removed.contains(id) {
            debug!(conversation = %id, "Sync for removed conversation ignored");
            return SyncOutcome::Ignored;
        }

        let outcome = match self.resolve(id) {
            Some(canonical) => self.update_known(id, canonical, key, activity),
            None => match self.by_key.get(&key).cloned() {
                Some(existing) => {
                    let incoming = Conversation::new(id.clone(), key, activity.unwrap_or(i64::MIN));
                    self.merge(existing, incoming)
                }
                None => {
                    let incoming = Conversation::new(id.clone(), key, activity.unwrap_or(now));
                    info!(conversation = %id, participants = incoming.participants.len(), "Conversation created");
                    self.install(incoming);
                    SyncOutcome::Created(id.clone())
                }
            },
        };
        self.commit();
        outcome
    }

    fn update_known(
        &mut self,
        id: &ConversationId,
        canonical: ConversationId,
        key: ParticipantKey,
        activity: Option<i64>,
    ) -> SyncOutcome {
        let Some(conversation) = self.conversations.get_mut(&canonical) else {
            return SyncOutcome::Ignored;
        };
        if let Some(at) = activity {
            conversation.touch(at);
        }
        // Only the canonical identity may change membership; aliases carry
        // whatever the superseded record last knew.
        if conversation.participants == key || id != &canonical {
            return SyncOutcome::Updated(canonical);
        }

        let old_key = std::mem::replace(&mut conversation.participants, key.clone());
        info!(conversation = %canonical, "Conversation membership changed");
        if self.by_key.get(&old_key) == Some(&canonical) {
            self.by_key.remove(&old_key);
        }

        match self.by_key.get(&key).cloned() {
            Some(other) => match self.conversations.remove(&canonical) {
                Some(rekeyed) => self.merge(other, rekeyed),
                None => SyncOutcome::Ignored,
            },
            None => {
                self.by_key.insert(key, canonical.clone());
                SyncOutcome::Updated(canonical)
            }
        }
    }

    /// Merge `incoming` with the catalogued conversation `existing`.
    ///
    /// `incoming` must not be in `conversations`.
    fn merge(&mut self, existing: ConversationId, incoming: Conversation) -> SyncOutcome {
        let Some(current) = self.conversations.remove(&existing) else {
            self.install(incoming.clone());
            return SyncOutcome::Created(incoming.id);
        };

        let (mut winner, loser) = if incoming.outranks(&current) {
            (incoming, current)
        } else {
            (current, incoming)
        };

        winner.touch(loser.last_activity_at);
        winner.aliases.extend(loser.aliases.iter().cloned());
        winner.aliases.insert(loser.id.clone());
        winner.aliases.remove(&winner.id);

        for alias in &winner.aliases {
            self.aliases.insert(alias.clone(), winner.id.clone());
        }
        self.aliases.remove(&winner.id);

        info!(
            canonical = %winner.id,
            superseded = %loser.id,
            "Merged duplicate conversations"
        );
        let outcome = SyncOutcome::Merged {
            canonical: winner.id.clone(),
            superseded: loser.id,
        };
        self.install(winner);
        outcome
    }

    /// Bump a conversation's activity on live message arrival
    pub fn touch(&mut self, id: &ConversationId, at: i64) -> bool {
        let Some(canonical) = self.resolve(id) else {
            return false;
        };
        let Some(conversation) = self.conversations.get_mut(&canonical) else {
            return false;
        };
        let before = conversation.last_activity_at;
        conversation.touch(at);
        let changed = conversation.last_activity_at != before;
        if changed {
            self.commit();
        }
        changed
    }

    /// Explicitly delete a conversation and tombstone it and its aliases.
    ///
    /// Returns the removed record so its messages and observers can be dropped.
    pub fn remove(&mut self, id: &ConversationId) -> Option<Conversation> {
        let canonical = self.resolve(id)?;
        let conversation = self.conversations.remove(&canonical)?;

        if self.by_key.get(&conversation.participants) == Some(&canonical) {
            self.by_key.remove(&conversation.participants);
        }
        for alias in &conversation.aliases {
            self.aliases.remove(alias);
            self.removed.insert(alias.clone());
        }
        self.removed.insert(canonical.clone());

        info!(conversation = %canonical, aliases = conversation.aliases.len(), "Conversation removed");
        self.commit();
        Some(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContactId;

    fn key(names: &[&str]) -> ParticipantKey {
        ParticipantKey::new(names.iter().map(|n| ContactId::from(*n)))
    }

    fn catalog() -> (ConversationReconciler, PersistHandle) {
        let persist = PersistHandle::new();
        (ConversationReconciler::new(persist.clone()), persist)
    }

    #[test]
    fn test_create_then_update() {
        let (mut catalog, persist) = catalog();
        let id = ConversationId::from("c1");

        assert_eq!(
            catalog.apply_sync(&id, key(&["alice", "me"]), Some(100), 500),
            SyncOutcome::Created(id.clone())
        );
        assert_eq!(
            catalog.apply_sync(&id, key(&["me", "alice"]), Some(200), 600),
            SyncOutcome::Updated(id.clone())
        );
        assert_eq!(catalog.get(&id).unwrap().last_activity_at, 200);
        assert!(persist.pending(BlobKey::Conversations).is_some());
    }

    #[test]
    fn test_empty_new_conversation_starts_now() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"c1".into(), key(&["a"]), None, 777);
        assert_eq!(catalog.get(&"c1".into()).unwrap().last_activity_at, 777);
    }

    #[test]
    fn test_empty_duplicate_becomes_alias() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"zz-established".into(), key(&["a", "me"]), Some(10), 0);

        let outcome = catalog.apply_sync(&"aa-joined".into(), key(&["me", "a"]), None, 1_000_000);
        assert_eq!(
            outcome,
            SyncOutcome::Merged {
                canonical: "zz-established".into(),
                superseded: "aa-joined".into(),
            }
        );
        let established = catalog.get(&"zz-established".into()).unwrap();
        assert_eq!(established.last_activity_at, 10);
        assert!(established.aliases.contains(&ConversationId::from("aa-joined")));
    }

    #[test]
    fn test_duplicate_participant_set_merges_to_most_recent() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"old".into(), key(&["alice", "me"]), Some(100), 0);
        let outcome = catalog.apply_sync(&"new".into(), key(&["me", "alice"]), Some(200), 0);

        assert_eq!(
            outcome,
            SyncOutcome::Merged {
                canonical: "new".into(),
                superseded: "old".into()
            }
        );
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.resolve(&"old".into()).unwrap().as_str(), "new");
    }

    #[test]
    fn test_older_duplicate_becomes_alias() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"c-live".into(), key(&["alice", "me"]), Some(500), 0);
        let outcome = catalog.apply_sync(&"c-stale".into(), key(&["alice", "me"]), Some(100), 0);

        assert_eq!(
            outcome,
            SyncOutcome::Merged {
                canonical: "c-live".into(),
                superseded: "c-stale".into()
            }
        );
    }

    #[test]
    fn test_equal_activity_prefers_smaller_identity() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"zeta".into(), key(&["a", "b"]), Some(100), 0);
        let outcome = catalog.apply_sync(&"alpha".into(), key(&["a", "b"]), Some(100), 0);
        assert_eq!(outcome.canonical().unwrap().as_str(), "alpha");

        let (mut catalog, _) = super::tests::catalog();
        catalog.apply_sync(&"alpha".into(), key(&["a", "b"]), Some(100), 0);
        let outcome = catalog.apply_sync(&"zeta".into(), key(&["a", "b"]), Some(100), 0);
        assert_eq!(outcome.canonical().unwrap().as_str(), "alpha");
    }

    #[test]
    fn test_late_sync_on_alias_is_redirected() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"old".into(), key(&["a", "me"]), Some(100), 0);
        catalog.apply_sync(&"new".into(), key(&["a", "me"]), Some(200), 0);

        let outcome = catalog.apply_sync(&"old".into(), key(&["a", "me"]), Some(300), 0);
        assert_eq!(outcome, SyncOutcome::Updated("new".into()));
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(&"new".into()).unwrap().last_activity_at, 300);
    }

    #[test]
    fn test_aliases_chain_through_repeated_merges() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"c1".into(), key(&["a", "me"]), Some(1), 0);
        catalog.apply_sync(&"c2".into(), key(&["a", "me"]), Some(2), 0);
        catalog.apply_sync(&"c3".into(), key(&["a", "me"]), Some(3), 0);

        let canonical = catalog.get(&"c3".into()).unwrap();
        assert!(canonical.aliases.contains(&"c1".into()));
        assert!(canonical.aliases.contains(&"c2".into()));
        assert_eq!(catalog.resolve(&"c1".into()).unwrap().as_str(), "c3");
    }

    #[test]
    fn test_membership_change_rekeys() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"c1".into(), key(&["a", "me"]), Some(1), 0);
        catalog.apply_sync(&"c1".into(), key(&["a", "b", "me"]), Some(2), 0);

        assert!(catalog.find_by_participants(&key(&["a", "me"])).is_none());
        assert_eq!(
            catalog.find_by_participants(&key(&["a", "b", "me"])).unwrap().id.as_str(),
            "c1"
        );
    }

    #[test]
    fn test_membership_change_into_existing_key_merges() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"group".into(), key(&["a", "b", "me"]), Some(10), 0);
        catalog.apply_sync(&"c1".into(), key(&["a", "me"]), Some(5), 0);

        let outcome = catalog.apply_sync(&"c1".into(), key(&["a", "b", "me"]), Some(20), 0);
        assert_eq!(
            outcome,
            SyncOutcome::Merged {
                canonical: "c1".into(),
                superseded: "group".into()
            }
        );
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_remove_tombstones_identity_and_aliases() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"old".into(), key(&["a", "me"]), Some(1), 0);
        catalog.apply_sync(&"new".into(), key(&["a", "me"]), Some(2), 0);

        let removed = catalog.remove(&"old".into()).unwrap();
        assert_eq!(removed.id.as_str(), "new");
        assert!(catalog.is_empty());

        assert_eq!(
            catalog.apply_sync(&"old".into(), key(&["a", "me"]), Some(3), 0),
            SyncOutcome::Ignored
        );
        assert_eq!(
            catalog.apply_sync(&"new".into(), key(&["a", "me"]), Some(3), 0),
            SyncOutcome::Ignored
        );

        // A genuinely new conversation with the same people is allowed
        assert_eq!(
            catalog.apply_sync(&"fresh".into(), key(&["a", "me"]), Some(4), 0),
            SyncOutcome::Created("fresh".into())
        );
    }

    #[test]
    fn test_load_merges_persisted_duplicates() {
        let (mut catalog, _) = catalog();
        let merges = catalog.load(vec![
            Conversation::new("x".into(), key(&["a", "me"]), 1),
            Conversation::new("y".into(), key(&["me", "a"]), 2),
        ]);
        assert_eq!(merges.len(), 1);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.resolve(&"x".into()).unwrap().as_str(), "y");
    }

    #[test]
    fn test_load_restores_aliases() {
        let (mut catalog, _) = catalog();
        let mut conversation = Conversation::new("main".into(), key(&["a"]), 1);
        conversation.aliases.insert("gone".into());
        catalog.load(vec![conversation]);

        assert_eq!(catalog.resolve(&"gone".into()).unwrap().as_str(), "main");
    }

    #[test]
    fn test_records_round_trip_through_json() {
        let (mut catalog, _) = catalog();
        catalog.apply_sync(&"a".into(), key(&["x", "me"]), Some(1), 0);
        catalog.apply_sync(&"b".into(), key(&["x", "me"]), Some(2), 0);

        let json = serde_json::to_string(&catalog.to_records()).unwrap();
        let records: Vec<ConversationRecord> = serde_json::from_str(&json).unwrap();
        let (mut restored, _) = super::tests::catalog();
        restored.load(records.into_iter().map(ConversationRecord::into_conversation).collect());

        assert_eq!(restored.resolve(&"a".into()).unwrap().as_str(), "b");
    }
}
