//! Reconciler runtime: one dispatcher task per active account.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            Reconciler                             │
//! │                                                                   │
//! │  IngressHandle ──┐                                                │
//! │  (epoch-bound)   │   mpsc<Envelope>    ┌──────────────────────┐   │
//! │                  ├───────────────────▶ │  dispatcher task     │   │
//! │  commands ───────┘  (events+commands)  │  owns AccountState   │   │
//! │                                        │  + sweep interval    │   │
//! │                                        └──────────┬───────────┘   │
//! │                                                   │               │
//! │             ┌─────────────────────────────────────┼────────┐      │
//! │             ▼                                     ▼        │      │
//! │       SnapshotHub (watch)                 PersistHandle    │      │
//! │             │                                     │        │      │
//! │     observe_contacts()                     flusher task ───┘      │
//! │     observe_conversation(id)               (debounced writes)     │
//! │     observe_conversation_requests()                               │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Account switching
//!
//! Every envelope carries the account epoch it was issued for. A switch bumps
//! the shared epoch first, so the old dispatcher rejects anything still queued,
//! then cancels and awaits the dispatcher and finally the flusher (which
//! performs its last flush). Only then is the new account's state loaded and a
//! fresh dispatcher started. No event from the old account can reach the new
//! account's state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::AccountState;
use crate::clock::Clock;
use crate::config::ReconcilerConfig;
use crate::contacts::ContactSnapshot;
use crate::error::{SyncError, SyncResult};
use crate::gateway::PersistenceGateway;
use crate::ingress::{normalize, EngineEvent};
use crate::messages::ConversationSnapshot;
use crate::observe::SnapshotHub;
use crate::persist::{load_state_async, spawn_flusher, PersistHandle};
use crate::types::{AccountId, Contact, ContactId, ConversationId, ConversationRequest, MessageId};

/// Explicit operations requested by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `ban` must be stated by the caller; there is no default
    RemoveContact { contact_id: ContactId, ban: bool },
    AddContact { contact_id: ContactId },
    UpdateContact { contact: Contact },
    AcceptTrustRequest { contact_id: ContactId },
    DiscardTrustRequest { contact_id: ContactId },
    AcceptConversationRequest { conversation_id: ConversationId },
    /// Drops the invitation only; the sender is left untouched
    DeclineConversationRequest { conversation_id: ConversationId },
    RemoveConversation { conversation_id: ConversationId },
    MarkDisplayed {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    SweepNow,
}

/// Unit of work on the dispatcher queue
#[derive(Debug)]
pub enum Envelope {
    Event {
        epoch: u64,
        event: EngineEvent,
    },
    Command {
        epoch: u64,
        command: Command,
        reply: oneshot::Sender<SyncResult<()>>,
    },
}

impl Envelope {
    pub fn epoch(&self) -> u64 {
        match self {
            Envelope::Event { epoch, .. } | Envelope::Command { epoch, .. } => *epoch,
        }
    }
}

/// Sending side of one account's event queue.
///
/// Bound to the epoch it was issued for; once the account is switched away
/// every send fails with [`SyncError::StaleEpoch`].
#[derive(Clone)]
pub struct IngressHandle {
    tx: mpsc::Sender<Envelope>,
    epoch: u64,
    current: Arc<AtomicU64>,
}

impl IngressHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    fn check_epoch(&self) -> SyncResult<()> {
        let current = self.current.load(Ordering::SeqCst);
        if current != self.epoch {
            return Err(SyncError::StaleEpoch {
                held: self.epoch,
                current,
            });
        }
        Ok(())
    }

    /// Queue an engine event, waiting for capacity
    pub async fn send(&self, event: EngineEvent) -> SyncResult<()> {
        self.check_epoch()?;
        self.tx
            .send(Envelope::Event {
                epoch: self.epoch,
                event,
            })
            .await
            .map_err(|_| SyncError::DispatcherClosed)
    }

    /// Queue an engine event without waiting (for synchronous engine callbacks)
    pub fn try_send(&self, event: EngineEvent) -> SyncResult<()> {
        self.check_epoch()?;
        self.tx
            .try_send(Envelope::Event {
                epoch: self.epoch,
                event,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SyncError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SyncError::DispatcherClosed,
            })
    }
}

struct ActiveAccount {
    account: AccountId,
    epoch: u64,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    flush_cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    flusher: JoinHandle<()>,
}

impl ActiveAccount {
    /// Stop the dispatcher, then let the flusher write what is left.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            error!(account = %self.account, error = %e, "Dispatcher task failed");
        }
        self.flush_cancel.cancel();
        if let Err(e) = self.flusher.await {
            error!(account = %self.account, error = %e, "Flusher task failed");
        }
        info!(account = %self.account, epoch = self.epoch, "Account deactivated");
    }
}

/// Entry point of the reconciliation layer.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use gettogether_core::{EngineEvent, MemoryGateway, Reconciler, ReconcilerConfig, SystemClock};
///
/// # async fn example() -> gettogether_core::SyncResult<()> {
/// let reconciler = Reconciler::new(
///     Arc::new(MemoryGateway::new()),
///     ReconcilerConfig::default(),
///     Arc::new(SystemClock),
/// )?;
/// reconciler.switch_account("alice@example".into()).await?;
///
/// let ingress = reconciler.ingress()?;
/// ingress
///     .send(EngineEvent::PresenceChanged {
///         contact_id: "bob".into(),
///         online: true,
///     })
///     .await?;
///
/// reconciler.remove_contact("bob".into(), false).await?;
/// reconciler.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Reconciler {
    gateway: Arc<dyn PersistenceGateway>,
    config: ReconcilerConfig,
    clock: Arc<dyn Clock>,
    hub: Arc<SnapshotHub>,
    epoch: Arc<AtomicU64>,
    active: Mutex<Option<ActiveAccount>>,
    switch_lock: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        config: ReconcilerConfig,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            gateway,
            config,
            clock,
            hub: Arc::new(SnapshotHub::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
            switch_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Live account epoch; 0 before the first activation
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn active_account(&self) -> Option<AccountId> {
        self.active.lock().as_ref().map(|a| a.account.clone())
    }

    /// Deactivate the current account (if any) and activate `account`.
    ///
    /// Returns the new epoch. The old account's state is fully stopped and
    /// flushed before the new one is loaded.
    pub async fn switch_account(&self, account: AccountId) -> SyncResult<u64> {
        let _guard = self.switch_lock.lock().await;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            info!(from = %previous.account, to = %account, epoch, "Switching account");
            previous.stop().await;
        }

        self.hub.reset();
        let loaded = load_state_async(self.gateway.clone(), account.clone()).await?;
        info!(
            account = %account,
            epoch,
            contacts = loaded.contacts.len(),
            conversations = loaded.conversations.len(),
            "Account state loaded"
        );

        let persist = PersistHandle::new();
        let state = AccountState::new(
            account.clone(),
            &self.config,
            self.hub.clone(),
            persist.clone(),
            loaded,
        );

        let flush_cancel = CancellationToken::new();
        let flusher = spawn_flusher(
            persist,
            self.gateway.clone(),
            account.clone(),
            self.config.persist_debounce(),
            flush_cancel.clone(),
        );

        let (tx, rx) = mpsc::channel(self.config.event_queue_capacity);
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(
            state,
            rx,
            epoch,
            self.epoch.clone(),
            self.clock.clone(),
            self.config.sweep_interval(),
            cancel.clone(),
        ));

        *self.active.lock() = Some(ActiveAccount {
            account,
            epoch,
            tx,
            cancel,
            flush_cancel,
            dispatcher,
            flusher,
        });
        Ok(epoch)
    }

    /// Stop the active account, flushing pending writes. Idempotent.
    pub async fn shutdown(&self) {
        let _guard = self.switch_lock.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            previous.stop().await;
        }
        info!("Reconciler shut down");
    }

    /// Handle for feeding engine events to the active account
    pub fn ingress(&self) -> SyncResult<IngressHandle> {
        let active = self.active.lock();
        let active = active.as_ref().ok_or(SyncError::NoActiveAccount)?;
        Ok(IngressHandle {
            tx: active.tx.clone(),
            epoch: active.epoch,
            current: self.epoch.clone(),
        })
    }

    async fn command(&self, command: Command) -> SyncResult<()> {
        let (tx, epoch) = {
            let active = self.active.lock();
            let active = active.as_ref().ok_or(SyncError::NoActiveAccount)?;
            (active.tx.clone(), active.epoch)
        };
        let (reply, response) = oneshot::channel();
        tx.send(Envelope::Command {
            epoch,
            command,
            reply,
        })
        .await
        .map_err(|_| SyncError::DispatcherClosed)?;
        response.await.map_err(|_| SyncError::DispatcherClosed)?
    }

    /// Remove a contact; `ban = true` blocks it instead of deleting it.
    pub async fn remove_contact(&self, contact_id: ContactId, ban: bool) -> SyncResult<()> {
        self.command(Command::RemoveContact { contact_id, ban }).await
    }

    /// Explicitly add a contact (lifts a ban and a session removal)
    pub async fn add_contact(&self, contact_id: ContactId) -> SyncResult<()> {
        self.command(Command::AddContact { contact_id }).await
    }

    /// Add or update a contact's profile fields
    pub async fn update_contact(&self, contact: Contact) -> SyncResult<()> {
        self.command(Command::UpdateContact { contact }).await
    }

    pub async fn accept_trust_request(&self, contact_id: ContactId) -> SyncResult<()> {
        self.command(Command::AcceptTrustRequest { contact_id }).await
    }

    pub async fn discard_trust_request(&self, contact_id: ContactId) -> SyncResult<()> {
        self.command(Command::DiscardTrustRequest { contact_id }).await
    }

    /// Join an invited conversation. A participant set that already has a
    /// conversation merges into it.
    pub async fn accept_conversation_request(&self, conversation_id: ConversationId) -> SyncResult<()> {
        self.command(Command::AcceptConversationRequest { conversation_id })
            .await
    }

    pub async fn decline_conversation_request(&self, conversation_id: ConversationId) -> SyncResult<()> {
        self.command(Command::DeclineConversationRequest { conversation_id })
            .await
    }

    pub async fn remove_conversation(&self, conversation_id: ConversationId) -> SyncResult<()> {
        self.command(Command::RemoveConversation { conversation_id })
            .await
    }

    /// Move the read marker of a conversation
    pub async fn mark_displayed(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> SyncResult<()> {
        self.command(Command::MarkDisplayed {
            conversation_id,
            message_id,
        })
        .await
    }

    /// Run a presence sweep now instead of waiting for the next tick
    pub async fn sweep_now(&self) -> SyncResult<()> {
        self.command(Command::SweepNow).await
    }

    /// Contact-list snapshots: the current one, then every change
    pub fn observe_contacts(&self) -> BoxStream<'static, ContactSnapshot> {
        self.hub.subscribe_contacts()
    }

    /// Ordered-message snapshots of a conversation (aliases follow merges)
    pub fn observe_conversation(&self, id: ConversationId) -> BoxStream<'static, ConversationSnapshot> {
        self.hub.subscribe_conversation(&id)
    }

    /// Pending conversation invitations: the current list, then every change
    pub fn observe_conversation_requests(&self) -> BoxStream<'static, Vec<ConversationRequest>> {
        self.hub.subscribe_requests()
    }

    pub fn conversation_requests(&self) -> Vec<ConversationRequest> {
        self.hub.current_requests()
    }

    pub fn contacts(&self) -> ContactSnapshot {
        self.hub.current_contacts()
    }

    pub fn conversation(&self, id: &ConversationId) -> ConversationSnapshot {
        self.hub.current_conversation(id)
    }
}

impl Drop for Reconciler {
    /// Without an explicit [`Reconciler::shutdown`], still stop both tasks;
    /// the flusher performs its final flush on its own.
    fn drop(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
            active.flush_cancel.cancel();
            debug!(account = %active.account, epoch = active.epoch, "Reconciler dropped without shutdown");
        }
    }
}

/// Reject work issued for another epoch
fn stale(envelope_epoch: u64, own_epoch: u64, current: &AtomicU64) -> Option<SyncError> {
    let live = current.load(Ordering::SeqCst);
    if envelope_epoch != own_epoch || live != own_epoch {
        return Some(SyncError::StaleEpoch {
            held: envelope_epoch,
            current: live,
        });
    }
    None
}

async fn run_dispatcher(
    mut state: AccountState,
    mut rx: mpsc::Receiver<Envelope>,
    epoch: u64,
    current: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    let account = state.account().clone();
    debug!(account = %account, epoch, "Dispatcher started");

    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                if let Some(err) = stale(envelope.epoch(), epoch, &current) {
                    warn!(account = %account, held = envelope.epoch(), "Rejected stale envelope");
                    if let Envelope::Command { reply, .. } = envelope {
                        let _ = reply.send(Err(err));
                    }
                    continue;
                }

                let now = clock.now_millis();
                match envelope {
                    Envelope::Event { event, .. } => {
                        for domain_event in normalize(event, now) {
                            state.handle_event(domain_event, now);
                        }
                    }
                    Envelope::Command { command, reply, .. } => {
                        let result = state.apply_command(command, now);
                        if let Err(e) = &result {
                            debug!(account = %account, error = %e, "Command failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }

            _ = sweep.tick() => {
                if current.load(Ordering::SeqCst) != epoch {
                    break;
                }
                state.sweep(clock.now_millis());
            }
        }
    }

    debug!(account = %account, epoch, "Dispatcher stopped");
}
