//! Error types for Get-Together core

use thiserror::Error;

/// Main error type for reconciliation operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error reported by a persistence gateway
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization of persisted blobs
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No account has been activated yet
    #[error("No active account")]
    NoActiveAccount,

    /// The handle belongs to an account context that has been switched away
    #[error("Stale account epoch {held} (current {current})")]
    StaleEpoch {
        /// Epoch the handle was issued for
        held: u64,
        /// Epoch currently live
        current: u64,
    },

    /// The account dispatcher stopped before the request completed
    #[error("Dispatcher closed")]
    DispatcherClosed,

    /// The account event queue is at capacity
    #[error("Event queue full")]
    QueueFull,

    /// Contact is not known to the contact store
    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    /// Conversation is not known to the catalog
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
