//! Get-Together Core Library
//!
//! Client-side state reconciliation between a replicated peer-to-peer
//! messaging engine and an application's UI.
//!
//! ## Overview
//!
//! The replication engine delivers presence changes, message arrivals,
//! conversation syncs and contact notifications asynchronously, unordered and
//! sometimes duplicated. This crate turns that stream into a locally
//! consistent, persisted view of who is online, which conversations exist with
//! whom, and the ordered message history of each.
//!
//! ## Core Principles
//!
//! - **Single writer**: each account's state is owned by one dispatcher task
//! - **Order by timestamp**: presentation never trusts arrival order
//! - **Remove is not ban**: the two are separate, explicit operations
//! - **Storage is a cache**: persisted blobs are reloaded, never consulted live
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use gettogether_core::{EngineEvent, Reconciler, ReconcilerConfig, RedbGateway, SystemClock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Arc::new(RedbGateway::new("~/.gettogether/state.redb")?);
//!     let reconciler = Reconciler::new(gateway, ReconcilerConfig::default(), Arc::new(SystemClock))?;
//!     reconciler.switch_account("alice@example".into()).await?;
//!
//!     let ingress = reconciler.ingress()?;
//!     ingress.send(EngineEvent::PresenceChanged { contact_id: "bob".into(), online: true }).await?;
//!
//!     let mut contacts = reconciler.observe_contacts();
//!     while let Some(snapshot) = contacts.next().await {
//!         for contact in snapshot.contacts {
//!             println!("{} {}", if contact.is_online { "●" } else { "○" }, contact.display_name);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod clock;
pub mod config;
pub mod contacts;
pub mod conversations;
pub mod error;
pub mod gateway;
pub mod ingress;
pub mod logging;
pub mod messages;
pub mod observe;
pub mod persist;
pub mod presence;
pub mod reconciler;
pub mod requests;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReconcilerConfig;
pub use contacts::{ContactSnapshot, ContactStore};
pub use conversations::{ConversationReconciler, SyncOutcome};
pub use error::{SyncError, SyncResult};
pub use gateway::{BlobKey, MemoryGateway, PersistenceGateway, RedbGateway};
pub use ingress::{normalize, ContactEventKind, DomainEvent, EngineEvent, PresenceSignal, RawMessage};
pub use logging::LoggingBuilder;
pub use messages::{ConversationSnapshot, MessageLog, MessageReconciler};
pub use presence::{PresenceTracker, PresenceUpdate};
pub use reconciler::{Command, IngressHandle, Reconciler};
pub use requests::RequestQueue;
pub use types::*;
