//! Persistence gateway: durable per-account blob storage.
//!
//! Reconciled state is written as one JSON blob per account per entity class
//! ([`BlobKey`]). The gateway is deliberately dumb: it stores bytes and never
//! interprets them, so it cannot become a second source of truth.
//!
//! Two implementations are provided:
//! - [`RedbGateway`]: ACID storage in a single redb table
//! - [`MemoryGateway`]: in-process map for tests, with write-failure injection

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{SyncError, SyncResult};
use crate::types::AccountId;

/// Table of all account blobs (key: "{account}/{blob}", value: JSON bytes)
const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("account_blobs");

/// Entity class stored under an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobKey {
    Contacts,
    Conversations,
}

impl BlobKey {
    pub const ALL: [BlobKey; 2] = [BlobKey::Contacts, BlobKey::Conversations];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKey::Contacts => "contacts",
            BlobKey::Conversations => "conversations",
        }
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable key-value storage, scoped per account.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Store `blob`, replacing any previous value
    fn save(&self, account: &AccountId, key: BlobKey, blob: &[u8]) -> SyncResult<()>;

    /// Load a blob, `None` if nothing was saved
    fn load(&self, account: &AccountId, key: BlobKey) -> SyncResult<Option<Vec<u8>>>;

    /// Remove one blob; no-op if absent
    fn clear(&self, account: &AccountId, key: BlobKey) -> SyncResult<()>;

    /// Remove every blob of an account
    fn clear_all(&self, account: &AccountId) -> SyncResult<()>;
}

/// Escape the separator so "a/b" and "a" can never share a prefix.
fn account_prefix(account: &AccountId) -> String {
    format!(
        "{}/",
        account.as_str().replace('%', "%25").replace('/', "%2F")
    )
}

fn storage_key(account: &AccountId, key: BlobKey) -> String {
    format!("{}{}", account_prefix(account), key.as_str())
}

/// Gateway backed by a redb database file
#[derive(Clone)]
pub struct RedbGateway {
    db: Arc<RwLock<Database>>,
}

impl RedbGateway {
    /// Open (or create) the database at `path`.
    ///
    /// Creates the parent directory and the blob table if needed.
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BLOBS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl PersistenceGateway for RedbGateway {
    fn save(&self, account: &AccountId, key: BlobKey, blob: &[u8]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            let key = storage_key(account, key);
            table.insert(key.as_str(), blob)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load(&self, account: &AccountId, key: BlobKey) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        let key = storage_key(account, key);

        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    fn clear(&self, account: &AccountId, key: BlobKey) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            let key = storage_key(account, key);
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn clear_all(&self, account: &AccountId) -> SyncResult<()> {
        let prefix = account_prefix(account);
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;

            let mut doomed = Vec::new();
            for entry in table.range(prefix.as_str()..)? {
                let (key, _) = entry?;
                let key = key.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                doomed.push(key.to_string());
            }

            for key in &doomed {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory gateway for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryGateway {
    blobs: RwLock<HashMap<(AccountId, BlobKey), Vec<u8>>>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail until turned off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Store raw bytes, bypassing failure injection (for seeding corrupt data)
    pub fn put_raw(&self, account: &AccountId, key: BlobKey, blob: impl Into<Vec<u8>>) {
        self.blobs
            .write()
            .insert((account.clone(), key), blob.into());
    }
}

impl PersistenceGateway for MemoryGateway {
    fn save(&self, account: &AccountId, key: BlobKey, blob: &[u8]) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("injected write failure".into()));
        }
        self.blobs
            .write()
            .insert((account.clone(), key), blob.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, account: &AccountId, key: BlobKey) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(&(account.clone(), key)).cloned())
    }

    fn clear(&self, account: &AccountId, key: BlobKey) -> SyncResult<()> {
        self.blobs.write().remove(&(account.clone(), key));
        Ok(())
    }

    fn clear_all(&self, account: &AccountId) -> SyncResult<()> {
        self.blobs.write().retain(|(owner, _), _| owner != account);
        Ok(())
    }
}
