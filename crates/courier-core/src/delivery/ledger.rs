//! The delivery ledger: authoritative per-message status
//!
//! ```text
//!   ingest_outgoing ──► local-<ulid> [sending]
//!                              │ apply_server_ack(server id)
//!                              ▼
//!                       <server id> [sent] ◄── merged with an early echo
//!                              │ apply_status_event
//!                              ▼
//!                       [delivered] ──► [read]
//!
//!   apply_incoming ──► <server id> [delivered] ──► Receipt::Delivered
//!   mark_conversation_read ──► [read] ──► Receipt::Read
//! ```
//!
//! Every entry point is idempotent and monotonic: replays and reordered
//! events after a reconnect never move a status backwards. Status, edit,
//! deletion and reaction events for messages that have not arrived yet are
//! parked and applied on arrival.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::message::{Deletion, Message, OutgoingDraft, Payload, Reaction};
use super::pending::{
    advance_status, delete_message, edit_message, settle_failure, Bounded, Pending,
};
use super::status::{FailureReason, MessageStatus, Receipt};
use crate::config::DEFAULT_PARKED_LIMIT;
use crate::error::{CourierError, CourierResult};
use crate::types::{now_millis, ClientLocalId, ConversationId, MessageId, UserId};

/// Callback through which the transport sends delivery and read receipts.
pub type ReceiptHook = Arc<dyn Fn(Receipt) + Send + Sync>;

/// Result of [`DeliveryStateMachine::apply_server_ack`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Local entry re-keyed to the server id
    Acknowledged,
    /// The server echo had already arrived; both entries were merged
    Merged,
    /// This client id was acknowledged before
    Duplicate,
}

/// Result of [`DeliveryStateMachine::apply_status_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied,
    /// Not a forward step; state unchanged
    Ignored,
    /// Message not known yet; applied when it arrives
    Parked,
}

/// Result of [`DeliveryStateMachine::apply_edit`],
/// [`apply_deletion`](DeliveryStateMachine::apply_deletion) and
/// [`apply_reactions`](DeliveryStateMachine::apply_reactions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOutcome {
    Applied,
    /// Superseded by what the message already carries
    Ignored,
    /// Message not known yet; applied when it arrives
    Parked,
}

/// Result of [`DeliveryStateMachine::apply_incoming`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    Inserted,
    /// Already known by id
    Duplicate,
    /// Echo of a pending local send, matched by client id
    Reconciled,
}

struct Ledger {
    messages: HashMap<MessageId, Message>,
    acks: HashMap<ClientLocalId, MessageId>,
    parked: Bounded<Pending>,
    /// Ids of purged messages and the conversation they belonged to
    purged: Bounded<ConversationId>,
}

impl Ledger {
    fn new(parked_limit: usize) -> Self {
        Self {
            messages: HashMap::new(),
            acks: HashMap::new(),
            parked: Bounded::new(parked_limit),
            purged: Bounded::new(parked_limit),
        }
    }

    /// Parked entry for `id`, created if missing.
    fn park(&mut self, id: &MessageId) -> &mut Pending {
        let (pending, evicted) = self.parked.entry(id);
        if evicted > 0 {
            warn!(evicted, "Parked events evicted; their messages never arrived");
        }
        pending
    }

    fn take_parked(&mut self, message: &mut Message) {
        self.purged.remove(&message.id);
        if let Some(pending) = self.parked.remove(&message.id) {
            pending.apply_to(message);
        }
    }
}

/// Per-message status ledger for one account.
pub struct DeliveryStateMachine {
    self_id: UserId,
    ledger: RwLock<Ledger>,
    receipt_hook: RwLock<Option<ReceiptHook>>,
}

impl DeliveryStateMachine {
    /// Create an empty ledger for the account `self_id`.
    pub fn new(self_id: UserId) -> Self {
        Self::with_parked_limit(self_id, DEFAULT_PARKED_LIMIT)
    }

    /// Create an empty ledger that parks at most `parked_limit` early events.
    pub fn with_parked_limit(self_id: UserId, parked_limit: usize) -> Self {
        Self {
            self_id,
            ledger: RwLock::new(Ledger::new(parked_limit)),
            receipt_hook: RwLock::new(None),
        }
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Install the callback used to send receipts.
    pub fn set_receipt_hook(&self, hook: ReceiptHook) {
        *self.receipt_hook.write() = Some(hook);
    }

    fn emit(&self, receipts: Vec<Receipt>) {
        if receipts.is_empty() {
            return;
        }
        let hook = self.receipt_hook.read().clone();
        if let Some(hook) = hook {
            for receipt in receipts {
                hook(receipt);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Outgoing
    // ═══════════════════════════════════════════════════════════════════

    /// Record an optimistic send. The entry starts `sending` under a local id.
    pub fn ingest_outgoing(&self, draft: OutgoingDraft) -> ClientLocalId {
        let client_id = ClientLocalId::new();
        let message = Message {
            id: client_id.message_id(),
            conversation_id: draft.conversation_id,
            sender_id: self.self_id.clone(),
            payload: Payload::Text(draft.text),
            kind: draft.kind,
            created_at: now_millis(),
            status: MessageStatus::Sending,
            client_id: Some(client_id),
            edited_at: None,
            deleted: None,
            reactions: Vec::new(),
            failure: None,
        };
        debug!(%client_id, conversation = %message.conversation_id, "Ingested outgoing message");
        self.ledger.write().messages.insert(message.id.clone(), message);
        client_id
    }

    /// Reconcile a local entry with its durable server id and promote it to
    /// `sent`.
    ///
    /// # Errors
    ///
    /// `MessageNotFound` if `client_id` was never ingested (or its
    /// conversation was purged).
    pub fn apply_server_ack(
        &self,
        client_id: ClientLocalId,
        server_id: MessageId,
    ) -> CourierResult<AckOutcome> {
        let mut ledger = self.ledger.write();

        if let Some(existing) = ledger.acks.get(&client_id) {
            if existing != &server_id {
                warn!(%client_id, %existing, %server_id, "Conflicting ack for client id ignored");
            }
            return Ok(AckOutcome::Duplicate);
        }

        let local_id = client_id.message_id();
        let mut local = ledger
            .messages
            .remove(&local_id)
            .ok_or_else(|| CourierError::MessageNotFound(local_id.to_string()))?;

        local.id = server_id.clone();
        local.status = local.status.furthest(MessageStatus::Sent);

        let outcome = match ledger.messages.remove(&server_id) {
            Some(echo) => {
                merge_echo(&mut local, echo);
                AckOutcome::Merged
            }
            None => AckOutcome::Acknowledged,
        };

        ledger.take_parked(&mut local);
        debug!(%client_id, %server_id, status = %local.status, ?outcome, "Applied server ack");

        ledger.acks.insert(client_id, server_id.clone());
        ledger.messages.insert(server_id, local);
        Ok(outcome)
    }

    /// Cancel a send that has not been acknowledged.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` once the server has acknowledged the message:
    /// from then on it has to be edited or deleted instead.
    pub fn cancel(&self, client_id: ClientLocalId) -> CourierResult<()> {
        let mut ledger = self.ledger.write();

        if let Some(server_id) = ledger.acks.get(&client_id) {
            return Err(CourierError::InvalidTransition(format!(
                "{} already acknowledged as {}; delete it instead",
                client_id, server_id
            )));
        }

        let local_id = client_id.message_id();
        let message = ledger
            .messages
            .get_mut(&local_id)
            .ok_or_else(|| CourierError::MessageNotFound(local_id.to_string()))?;

        match (message.status, message.failure) {
            (MessageStatus::Sending, _) => {
                message.status = MessageStatus::Failed;
                message.failure = Some(FailureReason::Cancelled);
                debug!(%client_id, "Cancelled outgoing message");
                Ok(())
            }
            (MessageStatus::Failed, Some(FailureReason::Cancelled)) => Ok(()),
            (status, _) => Err(CourierError::InvalidTransition(format!(
                "cannot cancel {} while {}",
                client_id, status
            ))),
        }
    }

    /// Mark a message failed. Entry point for an external timeout policy.
    ///
    /// Returns `false` if the message had already failed.
    pub fn mark_failed(&self, id: &MessageId, reason: FailureReason) -> CourierResult<bool> {
        let mut ledger = self.ledger.write();
        let message = ledger
            .messages
            .get_mut(id)
            .ok_or_else(|| CourierError::MessageNotFound(id.to_string()))?;

        if message.status == MessageStatus::Failed {
            return Ok(false);
        }
        if !message.status.can_transition_to(MessageStatus::Failed) {
            return Err(CourierError::InvalidTransition(format!(
                "{} is already {}",
                id, message.status
            )));
        }

        message.status = MessageStatus::Failed;
        message.failure = Some(reason);
        warn!(%id, %reason, "Message failed");
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Incoming
    // ═══════════════════════════════════════════════════════════════════

    /// Insert a message that arrived over the real-time channel.
    ///
    /// Messages from other users start `delivered` and fire a delivery
    /// receipt; echoes of our own messages (sent from another device) start
    /// `sent`.
    pub fn apply_incoming(&self, mut message: Message) -> IncomingOutcome {
        let incoming = message.is_incoming(&self.self_id);
        let receipt = {
            let mut ledger = self.ledger.write();

            if ledger.messages.contains_key(&message.id) {
                debug!(id = %message.id, "Duplicate message absorbed");
                return IncomingOutcome::Duplicate;
            }

            if !incoming {
                if let Some(client_id) = message.client_id {
                    if let Some(mut local) = ledger.messages.remove(&client_id.message_id()) {
                        local.id = message.id.clone();
                        local.status = local.status.furthest(MessageStatus::Sent);
                        message.status = MessageStatus::Sent;
                        merge_echo(&mut local, message);
                        ledger.take_parked(&mut local);
                        debug!(%client_id, id = %local.id, "Echo reconciled with pending send");
                        ledger.acks.insert(client_id, local.id.clone());
                        ledger.messages.insert(local.id.clone(), local);
                        return IncomingOutcome::Reconciled;
                    }
                }
            }

            message.status = if incoming {
                MessageStatus::Delivered
            } else {
                MessageStatus::Sent
            };
            ledger.take_parked(&mut message);

            let receipt = incoming.then(|| Receipt::Delivered {
                message_id: message.id.clone(),
                conversation_id: message.conversation_id.clone(),
                sender_id: message.sender_id.clone(),
            });

            debug!(id = %message.id, conversation = %message.conversation_id, status = %message.status, "Message ingested");
            ledger.messages.insert(message.id.clone(), message);
            receipt
        };

        self.emit(receipt.into_iter().collect());
        IncomingOutcome::Inserted
    }

    /// Apply a status change reported by the server.
    ///
    /// Applies only strictly forward steps. `source` is the user whose action
    /// produced the status (the reader for `read`).
    pub fn apply_status_event(
        &self,
        message_id: &MessageId,
        new_status: MessageStatus,
        source: &UserId,
    ) -> StatusOutcome {
        self.apply_status_event_in(None, message_id, new_status, source)
    }

    /// [`apply_status_event`](Self::apply_status_event) for an event that
    /// names its conversation, so a parked status can be discarded with it.
    pub fn apply_status_event_in(
        &self,
        conversation_id: Option<&ConversationId>,
        message_id: &MessageId,
        new_status: MessageStatus,
        source: &UserId,
    ) -> StatusOutcome {
        let mut ledger = self.ledger.write();

        let Some(message) = ledger.messages.get_mut(message_id) else {
            let pending = ledger.park(message_id);
            pending.park_status(new_status);
            if pending.conversation_id.is_none() {
                pending.conversation_id = conversation_id.cloned();
            }
            debug!(%message_id, %new_status, %source, "Status parked for unknown message");
            return StatusOutcome::Parked;
        };

        if !advance_status(message, new_status) {
            debug!(%message_id, current = %message.status, %new_status, "Status event ignored");
            return StatusOutcome::Ignored;
        }
        debug!(%message_id, %new_status, %source, "Status applied");
        StatusOutcome::Applied
    }

    /// Promote every incoming message in `conversation_id` to `read` and fire
    /// one read receipt per promoted message.
    ///
    /// Returns the number of promoted messages.
    pub fn mark_conversation_read(&self, conversation_id: &ConversationId) -> usize {
        let receipts: Vec<Receipt> = {
            let mut ledger = self.ledger.write();
            ledger
                .messages
                .values_mut()
                .filter(|m| &m.conversation_id == conversation_id)
                .filter(|m| m.is_incoming(&self.self_id))
                .filter(|m| m.status.can_transition_to(MessageStatus::Read))
                .map(|m| {
                    m.status = MessageStatus::Read;
                    Receipt::Read {
                        message_id: m.id.clone(),
                        conversation_id: m.conversation_id.clone(),
                        sender_id: m.sender_id.clone(),
                    }
                })
                .collect()
        };

        let promoted = receipts.len();
        if promoted > 0 {
            debug!(conversation = %conversation_id, promoted, "Conversation marked read");
        }
        self.emit(receipts);
        promoted
    }

    // ═══════════════════════════════════════════════════════════════════
    // Markers
    // ═══════════════════════════════════════════════════════════════════

    /// Replace the content of a message. Older edits and edits of messages
    /// deleted for everyone are ignored.
    pub fn apply_edit(&self, id: &MessageId, payload: Payload, edited_at: i64) -> MarkerOutcome {
        let mut ledger = self.ledger.write();
        let Some(message) = ledger.messages.get_mut(id) else {
            ledger.park(id).park_edit(payload, edited_at);
            debug!(%id, "Edit parked for unknown message");
            return MarkerOutcome::Parked;
        };
        marker_outcome(edit_message(message, payload, edited_at))
    }

    /// Flag a message deleted. `ForEveryone` supersedes `ForSelf`, never the
    /// other way round.
    pub fn apply_deletion(&self, id: &MessageId, deletion: Deletion) -> MarkerOutcome {
        let mut ledger = self.ledger.write();
        let Some(message) = ledger.messages.get_mut(id) else {
            ledger.park(id).park_deletion(deletion);
            debug!(%id, ?deletion, "Deletion parked for unknown message");
            return MarkerOutcome::Parked;
        };
        marker_outcome(delete_message(message, deletion))
    }

    /// Replace the reaction set of a message.
    pub fn apply_reactions(&self, id: &MessageId, reactions: Vec<Reaction>) -> MarkerOutcome {
        let mut ledger = self.ledger.write();
        let Some(message) = ledger.messages.get_mut(id) else {
            ledger.park(id).reactions = Some(reactions);
            debug!(%id, "Reactions parked for unknown message");
            return MarkerOutcome::Parked;
        };
        if message.reactions == reactions {
            return MarkerOutcome::Ignored;
        }
        message.reactions = reactions;
        MarkerOutcome::Applied
    }

    // ═══════════════════════════════════════════════════════════════════
    // Bulk
    // ═══════════════════════════════════════════════════════════════════

    /// Merge a page fetched over REST (pagination or resync).
    ///
    /// Known messages only move forward; unknown ones are inserted with the
    /// server's status. No receipts fire. Returns the number of new messages.
    pub fn merge_page(&self, page: Vec<Message>) -> usize {
        let mut ledger = self.ledger.write();
        let mut inserted = 0;

        for mut incoming in page {
            match ledger.messages.get_mut(&incoming.id) {
                Some(existing) => {
                    advance_status(existing, incoming.status);
                    if let Some(deletion) = incoming.deleted {
                        delete_message(existing, deletion);
                    }
                    if let Some(edited_at) = incoming.edited_at {
                        edit_message(existing, incoming.payload, edited_at);
                    }
                    existing.reactions = incoming.reactions;
                }
                None => {
                    // A page can carry the echo of a send we have not seen acked
                    let pending = incoming
                        .client_id
                        .filter(|_| !incoming.is_incoming(&self.self_id))
                        .and_then(|client_id| {
                            ledger
                                .messages
                                .remove(&client_id.message_id())
                                .map(|local| (client_id, local))
                        });
                    if let Some((client_id, mut local)) = pending {
                        local.id = incoming.id.clone();
                        merge_echo(&mut local, incoming);
                        ledger.take_parked(&mut local);
                        ledger.acks.insert(client_id, local.id.clone());
                        ledger.messages.insert(local.id.clone(), local);
                        continue;
                    }

                    settle_failure(&mut incoming);
                    ledger.take_parked(&mut incoming);
                    ledger.messages.insert(incoming.id.clone(), incoming);
                    inserted += 1;
                }
            }
        }

        debug!(inserted, "Merged page");
        inserted
    }

    /// Drop every message of a removed conversation, along with events
    /// parked for it.
    ///
    /// Purged ids are remembered (up to the parked limit) so
    /// [`conversation_of`](Self::conversation_of) still resolves them and
    /// late events can be dropped.
    pub fn purge_conversation(&self, conversation_id: &ConversationId) -> usize {
        let mut ledger = self.ledger.write();
        let purged: Vec<MessageId> = ledger
            .messages
            .iter()
            .filter(|(_, m)| &m.conversation_id == conversation_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &purged {
            ledger.messages.remove(id);
            ledger.purged.insert(id.clone(), conversation_id.clone());
        }
        ledger
            .parked
            .retain(|pending| pending.conversation_id.as_ref() != Some(conversation_id));

        let remaining: HashSet<MessageId> = ledger.messages.keys().cloned().collect();
        ledger.acks.retain(|_, id| remaining.contains(id));

        debug!(conversation = %conversation_id, removed = purged.len(), "Purged conversation");
        purged.len()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.ledger.read().messages.get(id).cloned()
    }

    /// Look up an optimistic send by its client id, acknowledged or not.
    pub fn get_by_client_id(&self, client_id: ClientLocalId) -> Option<Message> {
        let ledger = self.ledger.read();
        let id = ledger
            .acks
            .get(&client_id)
            .cloned()
            .unwrap_or_else(|| client_id.message_id());
        ledger.messages.get(&id).cloned()
    }

    /// Conversation of a known message, or of a recently purged one.
    pub fn conversation_of(&self, id: &MessageId) -> Option<ConversationId> {
        let ledger = self.ledger.read();
        ledger
            .messages
            .get(id)
            .map(|m| m.conversation_id.clone())
            .or_else(|| ledger.purged.get(id).cloned())
    }

    /// Number of messages with parked events.
    pub fn parked_len(&self) -> usize {
        self.ledger.read().parked.len()
    }

    /// Messages of one conversation, oldest first.
    pub fn messages_in(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .ledger
            .read()
            .messages
            .values()
            .filter(|m| &m.conversation_id == conversation_id)
            .cloned()
            .collect();
        sort_chronologically(&mut messages);
        messages
    }

    /// Every message in the ledger, oldest first.
    pub fn snapshot(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.ledger.read().messages.values().cloned().collect();
        sort_chronologically(&mut messages);
        messages
    }

    /// Oldest acknowledged message of a conversation, used as the cursor for
    /// fetching older pages.
    pub fn oldest_server_id(&self, conversation_id: &ConversationId) -> Option<MessageId> {
        self.messages_in(conversation_id)
            .into_iter()
            .find(|m| !m.id.is_local())
            .map(|m| m.id)
    }

    pub fn len(&self) -> usize {
        self.ledger.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn marker_outcome(applied: bool) -> MarkerOutcome {
    if applied {
        MarkerOutcome::Applied
    } else {
        MarkerOutcome::Ignored
    }
}

fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Fold the server echo into the local entry. The local payload wins.
fn merge_echo(local: &mut Message, echo: Message) {
    advance_status(local, echo.status);
    local.created_at = echo.created_at;
    if echo.edited_at > local.edited_at {
        local.edited_at = echo.edited_at;
    }
    if local.deleted.is_none() {
        local.deleted = echo.deleted;
    }
    if local.reactions.is_empty() {
        local.reactions = echo.reactions;
    }
}
