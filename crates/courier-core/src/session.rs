//! Session: one signed-in account
//!
//! ## Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Session                               │
//! │                                                                  │
//! │  send_text ──► ledger (optimistic) ──► seal per recipient        │
//! │                                          │                       │
//! │                                          ▼                       │
//! │                                 RestApi::send ──► ledger ack     │
//! │                                                                  │
//! │  drive(rx) ──► per-conversation worker ──► EventRouter::dispatch │
//! │           └──► on_connection_status ──► resync                   │
//! │                                                                  │
//! │  conversations() ◄── ConversationProjector(ledger, roster, ...)  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No lock is held across an `.await`: every suspension point (REST and
//! directory calls) sees owned data only.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collab::{
    ConnectionStatus, Directory, OutgoingEdit, OutgoingMessage, RestApi, SealedCopy,
    TransportSignal,
};
use crate::config::CourierConfig;
use crate::crypto::CipherEngine;
use crate::delivery::{
    DeliveryStateMachine, Deletion, FailureReason, MarkerOutcome, Message, OutgoingDraft, Payload,
    ReceiptHook,
};
use crate::error::{CourierError, CourierResult};
use crate::keys::{KeyStore, RotationOutcome, KEY_SIZE};
use crate::logging::fingerprint;
use crate::projector::{Conversation, ConversationProjector};
use crate::roster::{ConversationKind, Roster};
use crate::router::{CoreEvent, EventRouter, RealtimeEvent};
use crate::types::{now_millis, ClientLocalId, ConversationId, MessageId, MessageKind, UserId};

type Lane = Option<ConversationId>;

/// One account's messaging core.
pub struct Session {
    self_id: UserId,
    config: CourierConfig,
    keys: Arc<KeyStore>,
    cipher: CipherEngine,
    ledger: Arc<DeliveryStateMachine>,
    roster: Arc<RwLock<Roster>>,
    router: Arc<EventRouter>,
    projector: ConversationProjector,
    rest: Arc<dyn RestApi>,
    directory: Arc<dyn Directory>,
    connection: Mutex<ConnectionStatus>,
}

impl Session {
    /// Assemble a session around an opened key store.
    ///
    /// # Arguments
    ///
    /// * `self_id` - The signed-in account
    /// * `keys` - Device key store (already opened on its backend)
    /// * `rest` - REST collaborator
    /// * `directory` - Public key directory; wrap it in a `CachedDirectory`
    ///   to avoid a lookup per message
    /// * `config` - Validated before use
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid.
    pub fn new(
        self_id: UserId,
        keys: Arc<KeyStore>,
        rest: Arc<dyn RestApi>,
        directory: Arc<dyn Directory>,
        config: CourierConfig,
    ) -> CourierResult<Self> {
        config.validate()?;

        let cipher = CipherEngine::new(Arc::clone(&keys));
        let ledger = Arc::new(DeliveryStateMachine::with_parked_limit(
            self_id.clone(),
            config.parked_limit,
        ));
        let roster = Arc::new(RwLock::new(Roster::new()));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&ledger),
            cipher.clone(),
            Arc::clone(&directory),
            Arc::clone(&roster),
            &config,
        ));
        let projector = ConversationProjector::new(self_id.clone(), config.preview_chars);

        info!(user = %self_id, "Session created");

        Ok(Self {
            self_id,
            config,
            keys,
            cipher,
            ledger,
            roster,
            router,
            projector,
            rest,
            directory,
            // The first `connected` performs the initial sync
            connection: Mutex::new(ConnectionStatus::Disconnected),
        })
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn ledger(&self) -> &Arc<DeliveryStateMachine> {
        &self.ledger
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn roster(&self) -> &Arc<RwLock<Roster>> {
        &self.roster
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.router.subscribe()
    }

    /// Install the callback the transport uses to send receipts.
    pub fn set_receipt_hook(&self, hook: ReceiptHook) {
        self.ledger.set_receipt_hook(hook);
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection.lock()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Keys
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the device key pair, generating one on first use.
    ///
    /// Returns the current public key, which the caller publishes to the
    /// directory.
    pub fn provision_keys(&self) -> CourierResult<[u8; KEY_SIZE]> {
        if let Some(current) = self.keys.current() {
            debug!(key = %current.fingerprint(), "Using existing key pair");
            return Ok(*current.public_key());
        }
        self.rotate_keys()
    }

    /// Generate a fresh key pair and make it current. The previous pair stays
    /// available for decrypting older messages.
    pub fn rotate_keys(&self) -> CourierResult<[u8; KEY_SIZE]> {
        let pair = KeyStore::generate_key_pair()?;
        let public_key = *pair.public_key();
        match self.keys.rotate(pair)? {
            RotationOutcome::Installed { archived } => {
                info!(key = %fingerprint(&public_key), archived, "Installed new key pair");
            }
            RotationOutcome::Unchanged => {
                debug!(key = %fingerprint(&public_key), "Key pair already current");
            }
        }
        Ok(public_key)
    }

    /// Wipe every key of this device.
    pub fn logout(&self) -> CourierResult<()> {
        self.keys.clear()?;
        info!(user = %self.self_id, "Logged out, keys cleared");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Send a text message.
    ///
    /// The message shows up in the ledger as `sending` before any network
    /// call. On success it is re-keyed to the server id and the id is
    /// returned. On failure it is marked failed with the matching reason and
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// * `UnknownConversation` - conversation removed, or a group with no
    ///   other members
    /// * `StaleRecipientKey` - a recipient's key was still rejected after
    ///   one refresh
    /// * `NoLocalKey` - no device key pair
    /// * `Rest` / `Directory` - collaborator failures
    pub async fn send_text(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> CourierResult<MessageId> {
        let removed = self.roster.read().is_removed(conversation_id);
        if removed {
            return Err(CourierError::UnknownConversation(conversation_id.to_string()));
        }

        let client_id = self
            .ledger
            .ingest_outgoing(OutgoingDraft::text(conversation_id.clone(), text));
        self.router
            .notify(CoreEvent::ConversationChanged(conversation_id.clone()));

        let result = self.deliver(client_id, conversation_id, text).await;
        let outcome = match result {
            Ok(server_id) => {
                self.ledger.apply_server_ack(client_id, server_id.clone())?;
                info!(%client_id, %server_id, conversation = %conversation_id, "Message sent");
                Ok(server_id)
            }
            Err(e) => {
                let reason = failure_reason(&e);
                if let Err(mark_err) = self.ledger.mark_failed(&client_id.message_id(), reason) {
                    debug!(%client_id, error = %mark_err, "Could not mark send failed");
                }
                warn!(%client_id, conversation = %conversation_id, error = %e, "Send failed");
                Err(e)
            }
        };

        self.router
            .notify(CoreEvent::ConversationChanged(conversation_id.clone()));
        outcome
    }

    async fn deliver(
        &self,
        client_id: ClientLocalId,
        conversation_id: &ConversationId,
        text: &str,
    ) -> CourierResult<MessageId> {
        let (recipients, group_id) = self.recipients(conversation_id)?;
        let mut sealed = self.seal_for(&recipients, text).await?;

        let outgoing = |copies: Vec<SealedCopy>| OutgoingMessage {
            client_id,
            conversation_id: conversation_id.clone(),
            group_id: group_id.clone(),
            kind: MessageKind::Text,
            copies,
        };

        let stale = match self.rest.send(outgoing(sealed.copies())).await {
            Err(CourierError::StaleRecipientKey(user)) => UserId::new(user),
            other => return other,
        };

        self.refresh_copy(&mut sealed, &stale, text).await?;
        debug!(%client_id, recipient = %stale, "Resending with refreshed recipient key");
        self.rest.send(outgoing(sealed.copies())).await
    }

    /// Everyone who gets a copy: the peer of a direct conversation, or every
    /// other member of a group.
    fn recipients(
        &self,
        conversation_id: &ConversationId,
    ) -> CourierResult<(Vec<UserId>, Option<ConversationId>)> {
        let roster = self.roster.read();
        match roster.kind_of(conversation_id) {
            ConversationKind::Direct => {
                Ok((vec![UserId::new(conversation_id.as_str())], None))
            }
            ConversationKind::Group => {
                let recipients: Vec<UserId> = roster
                    .group(conversation_id)
                    .map(|group| {
                        group
                            .members
                            .iter()
                            .filter(|member| **member != self.self_id)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if recipients.is_empty() {
                    return Err(CourierError::UnknownConversation(format!(
                        "{} has no other members",
                        conversation_id
                    )));
                }
                Ok((recipients, Some(conversation_id.clone())))
            }
        }
    }

    async fn seal_for(&self, recipients: &[UserId], text: &str) -> CourierResult<SealedBatch> {
        let mut batch = SealedBatch::default();
        for recipient in recipients {
            let key = self.directory.public_key(recipient).await?;
            let envelope = self.cipher.encrypt(text.as_bytes(), &key)?;
            batch.entries.push(SealedEntry {
                key,
                copy: SealedCopy {
                    recipient_id: recipient.clone(),
                    envelope,
                },
            });
        }
        Ok(batch)
    }

    /// Re-seal the copy of a recipient whose key the server rejected.
    ///
    /// Fails with `StaleRecipientKey` if the directory still hands out the
    /// rejected key.
    async fn refresh_copy(
        &self,
        batch: &mut SealedBatch,
        recipient: &UserId,
        text: &str,
    ) -> CourierResult<()> {
        self.directory.invalidate(recipient).await;
        let fresh = self.directory.public_key(recipient).await?;

        let Some(entry) = batch
            .entries
            .iter_mut()
            .find(|entry| entry.copy.recipient_id == *recipient)
        else {
            warn!(%recipient, "Server rejected a key for a user we did not seal to");
            return Err(CourierError::StaleRecipientKey(recipient.to_string()));
        };

        if entry.key == fresh {
            return Err(CourierError::StaleRecipientKey(recipient.to_string()));
        }

        entry.copy.envelope = self.cipher.encrypt(text.as_bytes(), &fresh)?;
        entry.key = fresh;
        Ok(())
    }

    /// Cancel a send that has not been acknowledged yet.
    pub fn cancel(&self, client_id: ClientLocalId) -> CourierResult<()> {
        self.ledger.cancel(client_id)?;
        if let Some(conversation_id) = self.ledger.conversation_of(&client_id.message_id()) {
            self.router
                .notify(CoreEvent::ConversationChanged(conversation_id));
        }
        Ok(())
    }

    /// Mark a message failed, e.g. from a send timeout policy.
    pub fn mark_failed(&self, id: &MessageId, reason: FailureReason) -> CourierResult<bool> {
        let changed = self.ledger.mark_failed(id, reason)?;
        if changed {
            if let Some(conversation_id) = self.ledger.conversation_of(id) {
                self.router
                    .notify(CoreEvent::ConversationChanged(conversation_id));
            }
        }
        Ok(changed)
    }

    /// Mark every incoming message of a conversation read. Read receipts go
    /// out through the receipt hook.
    pub fn mark_conversation_read(&self, conversation_id: &ConversationId) -> usize {
        let marked = self.ledger.mark_conversation_read(conversation_id);
        if marked > 0 {
            self.router
                .notify(CoreEvent::ConversationChanged(conversation_id.clone()));
        }
        marked
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Edit / delete
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the text of one of our acknowledged messages.
    ///
    /// # Errors
    ///
    /// * `MessageNotFound` - unknown id
    /// * `InvalidTransition` - not ours, not acknowledged yet, or deleted
    pub async fn edit(&self, message_id: &MessageId, text: &str) -> CourierResult<()> {
        let message = self.own_acknowledged(message_id)?;
        if message.deleted.is_some() {
            return Err(CourierError::InvalidTransition(format!(
                "{} is deleted",
                message_id
            )));
        }

        let (recipients, _) = self.recipients(&message.conversation_id)?;
        let sealed = self.seal_for(&recipients, text).await?;
        self.rest
            .edit(OutgoingEdit {
                message_id: message_id.clone(),
                copies: sealed.copies(),
            })
            .await?;

        let outcome = self
            .ledger
            .apply_edit(message_id, Payload::Text(text.to_string()), now_millis());
        if outcome == MarkerOutcome::Applied {
            self.router
                .notify(CoreEvent::ConversationChanged(message.conversation_id));
        }
        Ok(())
    }

    /// Delete a message. Deleting for everyone is limited to our own
    /// acknowledged messages.
    pub async fn delete(&self, message_id: &MessageId, for_everyone: bool) -> CourierResult<()> {
        let message = if for_everyone {
            self.own_acknowledged(message_id)?
        } else {
            let message = self
                .ledger
                .get(message_id)
                .ok_or_else(|| CourierError::MessageNotFound(message_id.to_string()))?;
            if message.id.is_local() {
                return Err(CourierError::InvalidTransition(format!(
                    "{} is not acknowledged; cancel it instead",
                    message_id
                )));
            }
            message
        };

        self.rest.delete(message_id, for_everyone).await?;

        let deletion = if for_everyone {
            Deletion::ForEveryone
        } else {
            Deletion::ForSelf
        };
        if self.ledger.apply_deletion(message_id, deletion) == MarkerOutcome::Applied {
            self.router
                .notify(CoreEvent::ConversationChanged(message.conversation_id));
        }
        Ok(())
    }

    fn own_acknowledged(&self, message_id: &MessageId) -> CourierResult<Message> {
        let message = self
            .ledger
            .get(message_id)
            .ok_or_else(|| CourierError::MessageNotFound(message_id.to_string()))?;
        if message.sender_id != self.self_id {
            return Err(CourierError::InvalidTransition(format!(
                "{} was sent by {}",
                message_id, message.sender_id
            )));
        }
        if message.id.is_local() {
            return Err(CourierError::InvalidTransition(format!(
                "{} is not acknowledged yet",
                message_id
            )));
        }
        Ok(message)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // History & resync
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch one page of history and merge it.
    ///
    /// # Arguments
    ///
    /// * `conversation_id` - Conversation to page through
    /// * `before` - Only messages older than this id; `None` for the newest
    ///   page
    /// * `limit` - Page size
    ///
    /// Returns the number of messages that were new to the ledger.
    pub async fn load_older(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> CourierResult<usize> {
        let page = self.rest.fetch(conversation_id, before, limit).await?;

        let mut messages = Vec::with_capacity(page.len());
        for wire in &page {
            match self.router.decode_wire(wire).await {
                Ok(message) => messages.push(message),
                Err(e) => warn!(id = %wire.id, error = %e, "Skipping malformed history entry"),
            }
        }

        let inserted = self.ledger.merge_page(messages);
        debug!(conversation = %conversation_id, fetched = page.len(), inserted, "Merged history page");
        if inserted > 0 {
            self.router
                .notify(CoreEvent::ConversationChanged(conversation_id.clone()));
        }
        Ok(inserted)
    }

    /// Load the page just before the oldest message we hold.
    pub async fn load_more(&self, conversation_id: &ConversationId) -> CourierResult<usize> {
        let before = self.ledger.oldest_server_id(conversation_id);
        self.load_older(conversation_id, before.as_ref(), self.config.page_size)
            .await
    }

    /// Rebuild state after a reconnect: refresh the conversation list and
    /// merge the newest page of every conversation.
    ///
    /// Groups that no longer appear in the server's list were deleted (or
    /// left) while we were away and are removed.
    ///
    /// Returns the number of messages that were new to the ledger.
    pub async fn resync(&self) -> CourierResult<usize> {
        let summaries = self.rest.conversations().await?;

        let listed: HashSet<ConversationId> = summaries.iter().map(|s| s.id.clone()).collect();
        let vanished: Vec<ConversationId> = {
            let mut roster = self.roster.write();
            for summary in &summaries {
                roster.apply_summary(summary);
            }
            roster
                .conversation_ids()
                .into_iter()
                .filter(|id| {
                    roster.kind_of(id) == ConversationKind::Group
                        && !roster.is_removed(id)
                        && !listed.contains(id)
                })
                .collect()
        };
        for conversation_id in &vanished {
            self.router.remove_conversation(conversation_id);
        }

        let conversation_ids: Vec<ConversationId> = {
            let roster = self.roster.read();
            roster
                .conversation_ids()
                .into_iter()
                .filter(|id| !roster.is_removed(id))
                .collect()
        };

        let mut inserted = 0;
        for conversation_id in &conversation_ids {
            match self
                .load_older(conversation_id, None, self.config.page_size)
                .await
            {
                Ok(count) => inserted += count,
                Err(e) => warn!(conversation = %conversation_id, error = %e, "Resync fetch failed"),
            }
        }

        info!(
            conversations = conversation_ids.len(),
            removed = vanished.len(),
            inserted,
            "Resync complete"
        );
        self.router.notify(CoreEvent::ResyncRequired);
        Ok(inserted)
    }

    /// Record a transport connection change.
    ///
    /// Returns `true` if it triggered a resync.
    pub async fn on_connection_status(&self, status: ConnectionStatus) -> CourierResult<bool> {
        let previous = std::mem::replace(&mut *self.connection.lock(), status);
        debug!(?previous, ?status, "Connection status");

        let reconnected = status == ConnectionStatus::Connected
            && matches!(
                previous,
                ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting
            );
        if !reconnected {
            return Ok(false);
        }

        self.resync().await?;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport
    // ═══════════════════════════════════════════════════════════════════════

    /// Consume transport signals until the channel closes.
    ///
    /// Events are handed to one worker task per conversation: a conversation
    /// sees its events in arrival order while other conversations proceed in
    /// parallel. A worker exits once its queue drains. Connection changes are
    /// handled inline. Returns once every worker has drained.
    pub async fn drive(self: Arc<Self>, mut signals: mpsc::Receiver<TransportSignal>) {
        let (mut workers, mut finished) = LaneWorkers::new(Arc::clone(&self.router));

        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(TransportSignal::Connection(status)) => {
                        if let Err(e) = self.on_connection_status(status).await {
                            error!(error = %e, "Resync after reconnect failed");
                        }
                    }
                    Some(TransportSignal::Event(event)) => match self.router.lane_for(&event) {
                        Ok(lane) => workers.submit(lane, event),
                        Err(e) => {
                            warn!(event = event.name(), error = %e, "Dropping unroutable event");
                        }
                    },
                    None => break,
                },
                Some(lane) = finished.recv() => workers.finished(lane),
            }
        }

        workers.shutdown().await;
        debug!("Transport channel closed");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Views
    // ═══════════════════════════════════════════════════════════════════════

    /// The ordered conversation list.
    pub fn conversations(&self) -> Vec<Conversation> {
        let messages = self.ledger.snapshot();
        let typing = self.router.typing().snapshot();
        let roster = self.roster.read();
        self.projector.project(&messages, &roster, &typing)
    }

    /// Visible messages of a conversation, oldest first.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.ledger
            .messages_in(conversation_id)
            .into_iter()
            .filter(Message::is_visible)
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lane workers
// ═══════════════════════════════════════════════════════════════════════════

/// Worker tasks of [`Session::drive`], one per lane with queued events.
struct LaneWorkers {
    router: Arc<EventRouter>,
    lanes: HashMap<Lane, LaneWorker>,
    handles: Vec<JoinHandle<()>>,
    /// Workers report each dispatched event here
    done: mpsc::UnboundedSender<Lane>,
}

struct LaneWorker {
    events: mpsc::UnboundedSender<RealtimeEvent>,
    /// Sent but not yet dispatched
    in_flight: usize,
}

impl LaneWorkers {
    fn new(router: Arc<EventRouter>) -> (Self, mpsc::UnboundedReceiver<Lane>) {
        let (done, finished) = mpsc::unbounded_channel();
        let workers = Self {
            router,
            lanes: HashMap::new(),
            handles: Vec::new(),
            done,
        };
        (workers, finished)
    }

    fn submit(&mut self, lane: Lane, event: RealtimeEvent) {
        let worker = match self.lanes.entry(lane) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.handles.retain(|handle| !handle.is_finished());
                self.handles.push(spawn_lane_worker(
                    Arc::clone(&self.router),
                    entry.key().clone(),
                    rx,
                    self.done.clone(),
                ));
                entry.insert(LaneWorker {
                    events: tx,
                    in_flight: 0,
                })
            }
        };
        if worker.events.send(event).is_err() {
            error!("Lane worker stopped unexpectedly");
            return;
        }
        worker.in_flight += 1;
    }

    /// One event of `lane` was dispatched. A lane with nothing left in
    /// flight loses its sender, which ends the worker.
    fn finished(&mut self, lane: Lane) {
        let Some(worker) = self.lanes.get_mut(&lane) else {
            return;
        };
        worker.in_flight = worker.in_flight.saturating_sub(1);
        if worker.in_flight == 0 {
            self.lanes.remove(&lane);
        }
    }

    fn active(&self) -> usize {
        self.lanes.len()
    }

    async fn shutdown(self) {
        let Self { lanes, handles, .. } = self;
        drop(lanes);
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Lane worker panicked");
            }
        }
    }
}

fn spawn_lane_worker(
    router: Arc<EventRouter>,
    lane: Lane,
    mut events: mpsc::UnboundedReceiver<RealtimeEvent>,
    done: mpsc::UnboundedSender<Lane>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let name = event.name();
            match router.dispatch(event).await {
                Ok(outcome) => debug!(event = name, lane = ?lane, ?outcome, "Dispatched"),
                Err(e) => warn!(event = name, lane = ?lane, error = %e, "Event rejected"),
            }
            // drive may already be shutting down
            let _ = done.send(lane.clone());
        }
    })
}

fn failure_reason(error: &CourierError) -> FailureReason {
    match error {
        CourierError::StaleRecipientKey(_) => FailureReason::StaleRecipientKey,
        CourierError::NoLocalKey => FailureReason::NoLocalKey,
        _ => FailureReason::Rejected,
    }
}

struct SealedEntry {
    /// Key the copy was sealed to
    key: [u8; KEY_SIZE],
    copy: SealedCopy,
}

#[derive(Default)]
struct SealedBatch {
    entries: Vec<SealedEntry>,
}

impl SealedBatch {
    fn copies(&self) -> Vec<SealedCopy> {
        self.entries.iter().map(|entry| entry.copy.clone()).collect()
    }
}
