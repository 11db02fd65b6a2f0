//! Debounced persistence of reconciled state.
//!
//! Mutations stage a fully serialized blob per [`BlobKey`]; a background
//! flusher waits for the debounce window and writes only the latest blob of
//! each kind. Rapid presence churn therefore costs one write per window, not
//! one per signal.
//!
//! ```text
//!   mutation ──stage(key, blob)──▶ pending[key] = blob ──notify──┐
//!                                                                ▼
//!                         flusher: sleep(debounce) → drain → gateway.save
//!                                      │ failure: put blob back unless a newer
//!                                      ▼ one was staged meanwhile
//! ```
//!
//! Write failures are logged and retried on the next staged mutation; they are
//! never surfaced to observers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::gateway::{BlobKey, PersistenceGateway};
use crate::types::{AccountId, Contact, ContactRecord, Conversation, ConversationRecord};

/// Handle used by state owners to stage writes
#[derive(Clone, Default)]
pub struct PersistHandle {
    pending: Arc<Mutex<HashMap<BlobKey, Vec<u8>>>>,
    notify: Arc<Notify>,
}

impl PersistHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the latest serialized state for `key`, replacing older staged bytes
    pub fn stage(&self, key: BlobKey, blob: Vec<u8>) {
        self.pending.lock().insert(key, blob);
        self.notify.notify_one();
    }

    /// Serialize `value` as JSON and stage it
    pub fn stage_json<T: serde::Serialize>(&self, key: BlobKey, value: &T) {
        match serde_json::to_vec(value) {
            Ok(blob) => self.stage(key, blob),
            Err(e) => warn!(blob = %key, error = %e, "Failed to serialize state for persistence"),
        }
    }

    /// Bytes waiting to be written for `key`
    pub fn pending(&self, key: BlobKey) -> Option<Vec<u8>> {
        self.pending.lock().get(&key).cloned()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    fn drain(&self) -> Vec<(BlobKey, Vec<u8>)> {
        let mut drained: Vec<_> = self.pending.lock().drain().collect();
        drained.sort_by_key(|(key, _)| *key);
        drained
    }

    /// Put back a blob whose write failed, unless something newer was staged
    fn restore(&self, key: BlobKey, blob: Vec<u8>) {
        self.pending.lock().entry(key).or_insert(blob);
    }
}

/// Write everything currently staged. Returns the number of failed writes.
pub async fn flush_pending(
    handle: &PersistHandle,
    gateway: &Arc<dyn PersistenceGateway>,
    account: &AccountId,
) -> usize {
    let mut failures = 0;
    for (key, blob) in handle.drain() {
        let gw = gateway.clone();
        let acct = account.clone();
        let bytes = blob.clone();
        let result = tokio::task::spawn_blocking(move || gw.save(&acct, key, &bytes))
            .await
            .unwrap_or_else(|e| Err(SyncError::Storage(format!("write task failed: {e}"))));

        match result {
            Ok(()) => debug!(account = %account, blob = %key, bytes = blob.len(), "Persisted"),
            Err(e) => {
                failures += 1;
                warn!(account = %account, blob = %key, error = %e, "Persistence write failed, will retry on next change");
                handle.restore(key, blob);
            }
        }
    }
    failures
}

/// Spawn the debounced flusher for one account.
///
/// On cancellation it performs one final flush and exits; it never re-arms.
pub fn spawn_flusher(
    handle: PersistHandle,
    gateway: Arc<dyn PersistenceGateway>,
    account: AccountId,
    debounce: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(account = %account, "Persistence flusher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = handle.notify.notified() => {}
            }

            // Collect further mutations for the debounce window
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }

            flush_pending(&handle, &gateway, &account).await;
        }

        let failures = flush_pending(&handle, &gateway, &account).await;
        if failures > 0 {
            warn!(account = %account, failures, "Final flush incomplete, unsaved changes dropped");
        }
        info!(account = %account, "Persistence flusher stopped");
    })
}

/// State read back from the gateway when an account is activated
#[derive(Debug, Default)]
pub struct LoadedState {
    pub contacts: Vec<Contact>,
    pub conversations: Vec<Conversation>,
}

fn decode_blob<T: DeserializeOwned>(
    gateway: &dyn PersistenceGateway,
    account: &AccountId,
    key: BlobKey,
) -> Vec<T> {
    match gateway.load(account, key) {
        Ok(Some(bytes)) => match serde_json::from_slice::<Vec<T>>(&bytes) {
            Ok(records) => records,
            Err(e) => {
                warn!(account = %account, blob = %key, error = %e, "Corrupt persisted blob, starting empty");
                Vec::new()
            }
        },
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(account = %account, blob = %key, error = %e, "Failed to load persisted blob, starting empty");
            Vec::new()
        }
    }
}

/// Load an account's persisted state.
///
/// Missing, unreadable or corrupt blobs all mean "no prior state"; this never
/// fails.
pub fn load_state(gateway: &dyn PersistenceGateway, account: &AccountId) -> LoadedState {
    let contacts = decode_blob::<ContactRecord>(gateway, account, BlobKey::Contacts)
        .into_iter()
        .map(ContactRecord::into_contact)
        .collect();
    let conversations = decode_blob::<ConversationRecord>(gateway, account, BlobKey::Conversations)
        .into_iter()
        .map(ConversationRecord::into_conversation)
        .collect();
    LoadedState {
        contacts,
        conversations,
    }
}

/// Async wrapper around [`load_state`]
pub async fn load_state_async(
    gateway: Arc<dyn PersistenceGateway>,
    account: AccountId,
) -> SyncResult<LoadedState> {
    tokio::task::spawn_blocking(move || load_state(gateway.as_ref(), &account))
        .await
        .map_err(|e| SyncError::Storage(format!("load task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;

    fn account() -> AccountId {
        AccountId::from("acct")
    }

    #[test]
    fn test_stage_keeps_only_latest_blob() {
        let handle = PersistHandle::new();
        handle.stage(BlobKey::Contacts, b"1".to_vec());
        handle.stage(BlobKey::Contacts, b"2".to_vec());
        assert_eq!(handle.pending(BlobKey::Contacts), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_flush_writes_and_clears() {
        let memory = Arc::new(MemoryGateway::new());
        let gateway: Arc<dyn PersistenceGateway> = memory.clone();
        let handle = PersistHandle::new();
        handle.stage(BlobKey::Contacts, b"[]".to_vec());

        assert_eq!(flush_pending(&handle, &gateway, &account()).await, 0);
        assert!(!handle.has_pending());
        assert_eq!(memory.save_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_blob_for_retry() {
        let memory = Arc::new(MemoryGateway::new());
        let gateway: Arc<dyn PersistenceGateway> = memory.clone();
        let handle = PersistHandle::new();
        handle.stage(BlobKey::Contacts, b"[]".to_vec());

        memory.set_fail_writes(true);
        assert_eq!(flush_pending(&handle, &gateway, &account()).await, 1);
        assert_eq!(handle.pending(BlobKey::Contacts), Some(b"[]".to_vec()));

        memory.set_fail_writes(false);
        assert_eq!(flush_pending(&handle, &gateway, &account()).await, 0);
        assert!(gateway.load(&account(), BlobKey::Contacts).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_batches_within_debounce_window() {
        let memory = Arc::new(MemoryGateway::new());
        let handle = PersistHandle::new();
        let cancel = CancellationToken::new();
        let task = spawn_flusher(
            handle.clone(),
            memory.clone(),
            account(),
            Duration::from_millis(100),
            cancel.clone(),
        );

        for i in 0..50u8 {
            handle.stage(BlobKey::Contacts, vec![i]);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(memory.save_count(), 1);
        let saved = memory.load(&account(), BlobKey::Contacts).unwrap();
        assert_eq!(saved, Some(vec![49]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_performs_final_flush() {
        let memory = Arc::new(MemoryGateway::new());
        let handle = PersistHandle::new();
        let cancel = CancellationToken::new();
        let task = spawn_flusher(
            handle.clone(),
            memory.clone(),
            account(),
            Duration::from_secs(3600),
            cancel.clone(),
        );

        handle.stage(BlobKey::Conversations, b"[]".to_vec());
        cancel.cancel();
        task.await.unwrap();

        assert!(memory.load(&account(), BlobKey::Conversations).unwrap().is_some());
    }

    #[test]
    fn test_load_state_treats_corrupt_blob_as_empty() {
        let memory = MemoryGateway::new();
        memory.put_raw(&account(), BlobKey::Contacts, "{not json");
        memory.put_raw(
            &account(),
            BlobKey::Conversations,
            r#"[{"id":"c1","participants":["bob","alice"],"lastActivityAt":5}]"#,
        );

        let loaded = load_state(&memory, &account());
        assert!(loaded.contacts.is_empty());
        assert_eq!(loaded.conversations.len(), 1);
        assert_eq!(loaded.conversations[0].participants.participants()[0].as_str(), "alice");
    }

    #[test]
    fn test_load_state_missing_is_empty() {
        let memory = MemoryGateway::new();
        let loaded = load_state(&memory, &account());
        assert!(loaded.contacts.is_empty());
        assert!(loaded.conversations.is_empty());
    }
}
