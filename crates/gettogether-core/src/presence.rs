//! Presence tracker
//!
//! Infers online/offline from two kinds of partial signal and expires stale
//! state on a periodic sweep.
//!
//! ## State machine
//!
//! ```text
//!              signal                 sweep (stale)
//!   Unknown ──────────▶ Online ◀──────────────────▶ Offline
//!                          ▲        signal            │
//!                          └──────────────────────────┘
//! ```
//!
//! - A broadcast sets the state directly. Online broadcasts refresh
//!   `last_seen_at` to now; offline broadcasts leave it alone.
//! - Activity only ever proves liveness. Absence of activity is never turned
//!   into "offline" here; only [`PresenceTracker::sweep`] does that.
//! - The sweep expires any online entry whose `last_seen_at` is older than the
//!   timeout, whatever its source. A broadcast contact that keeps announcing
//!   itself keeps refreshing `last_seen_at` and is therefore never expired.
//! - Entries that are offline and silent past the timeout are pruned by the
//!   sweep. The contact store keeps the last known presence of real contacts,
//!   so this only bounds memory for senders that never became contacts.

use std::collections::HashMap;

use tracing::debug;

use crate::ingress::PresenceSignal;
use crate::types::{ContactId, PresenceSource, PresenceState};

/// Per-contact timeout bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
    pub state: PresenceState,
    pub source: PresenceSource,
    pub last_seen_at: Option<i64>,
}

/// A presence change to be folded into the contact store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub contact_id: ContactId,
    pub state: PresenceState,
    pub source: PresenceSource,
    pub last_seen_at: Option<i64>,
}

impl PresenceUpdate {
    fn from_entry(contact_id: &ContactId, entry: &PresenceEntry) -> Self {
        Self {
            contact_id: contact_id.clone(),
            state: entry.state,
            source: entry.source,
            last_seen_at: entry.last_seen_at,
        }
    }
}

/// Tracks presence for every contact that has produced a signal this session.
#[derive(Debug)]
pub struct PresenceTracker {
    entries: HashMap<ContactId, PresenceEntry>,
    timeout_ms: i64,
}

impl PresenceTracker {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            timeout_ms: i64::try_from(timeout_ms).unwrap_or(i64::MAX),
        }
    }

    fn is_stale(&self, last_seen_at: Option<i64>, now: i64) -> bool {
        match last_seen_at {
            Some(seen) => now.saturating_sub(seen) > self.timeout_ms,
            None => true,
        }
    }

    /// Apply one signal observed at `now`.
    ///
    /// Returns the new presence if anything observable changed.
    pub fn apply(&mut self, signal: &PresenceSignal, now: i64) -> Option<PresenceUpdate> {
        let contact_id = signal.contact_id().clone();
        let before = self.entries.get(&contact_id).copied();
        let mut entry = before.unwrap_or(PresenceEntry {
            state: PresenceState::Unknown,
            source: PresenceSource::None,
            last_seen_at: None,
        });

        match signal {
            PresenceSignal::Broadcast { online: true, .. } => {
                entry.state = PresenceState::Online;
                entry.source = PresenceSource::Broadcast;
                entry.last_seen_at = Some(now);
            }
            PresenceSignal::Broadcast { online: false, .. } => {
                entry.state = PresenceState::Offline;
                entry.source = PresenceSource::Broadcast;
            }
            PresenceSignal::Activity { at, .. } => {
                let fresher = entry.last_seen_at.map_or(true, |seen| *at >= seen);
                if fresher {
                    entry.last_seen_at = Some(*at);
                    entry.source = PresenceSource::Activity;
                }
                // Replayed history proves nothing about current liveness
                if !self.is_stale(Some(*at), now) {
                    entry.state = PresenceState::Online;
                } else if entry.state == PresenceState::Unknown {
                    entry.state = PresenceState::Offline;
                }
            }
        }

        self.entries.insert(contact_id.clone(), entry);
        if before == Some(entry) {
            return None;
        }
        debug!(contact = %contact_id, state = %entry.state, source = ?entry.source, "Presence changed");
        Some(PresenceUpdate::from_entry(&contact_id, &entry))
    }

    /// Expire every online entry that has been silent longer than the timeout,
    /// then prune entries that were already offline and stale.
    pub fn sweep(&mut self, now: i64) -> Vec<PresenceUpdate> {
        let timeout_ms = self.timeout_ms;
        let stale = |entry: &PresenceEntry| {
            entry
                .last_seen_at
                .map_or(true, |seen| now.saturating_sub(seen) > timeout_ms)
        };

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.state == PresenceState::Online || !stale(&*entry));
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(pruned, "Pruned silent presence entries");
        }

        let mut expired = Vec::new();
        for (contact_id, entry) in self.entries.iter_mut() {
            if entry.state == PresenceState::Online && stale(&*entry) {
                entry.state = PresenceState::Offline;
                debug!(contact = %contact_id, source = ?entry.source, "Presence expired");
                expired.push(PresenceUpdate::from_entry(contact_id, entry));
            }
        }
        expired.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
        expired
    }

    pub fn get(&self, contact_id: &ContactId) -> Option<PresenceEntry> {
        self.entries.get(contact_id).copied()
    }

    /// Current state, `Unknown` for contacts with no signal this session
    pub fn state(&self, contact_id: &ContactId) -> PresenceState {
        self.entries
            .get(contact_id)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// Drop state for a removed contact
    pub fn forget(&mut self, contact_id: &ContactId) {
        self.entries.remove(contact_id);
    }

    /// Drop all state (account change)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
