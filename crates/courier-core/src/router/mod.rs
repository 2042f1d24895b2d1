//! Real-time event routing
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  dispatch(event)                                                │
//! │  ├── resolve conversation lane (tokio mutex per conversation)   │
//! │  ├── drop events for removed conversations                      │
//! │  └── apply:                                                     │
//! │      ├── message.new      decrypt → ledger.apply_incoming       │
//! │      ├── message.status   ledger.apply_status_event             │
//! │      ├── message.typing   TypingTracker (per-entry TTL)         │
//! │      ├── user.status      PresenceBoard (last arrival wins)     │
//! │      ├── group.*          Roster / purge                        │
//! │      └── message.edited / deleted / reaction   ledger markers   │
//! │                                                                 │
//! │  CoreEvent broadcast ──► UI                                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events for one conversation are applied one at a time, in arrival order.
//! Different conversations proceed in parallel. A lane exists only while an
//! event holds or waits for it. Every handler is idempotent, so replays after
//! a reconnect are harmless; events that refer to a message not seen yet are
//! parked in the ledger until it arrives.

mod events;
mod presence;
mod typing;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub use events::{
    GroupRef, GroupUpdate, MemberJoined, MemberLeft, MessageBody, MessageDeletion, MessageEdit,
    PresenceStatus, PresenceUpdate, ReactionUpdate, RealtimeEvent, StatusChange, TypingSignal,
    WireMessage, KNOWN_EVENTS,
};
pub use presence::{Presence, PresenceBoard};
pub use typing::TypingTracker;

use crate::collab::Directory;
use crate::config::CourierConfig;
use crate::crypto::CipherEngine;
use crate::delivery::{
    DeliveryStateMachine, IncomingOutcome, MarkerOutcome, Message, MessageStatus, Payload,
    StatusOutcome,
};
use crate::error::CourierResult;
use crate::roster::Roster;
use crate::types::{ConversationId, UserId};

/// Notifications for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Something in the conversation's projection may have changed
    ConversationChanged(ConversationId),
    /// The conversation is gone (group deleted or left)
    ConversationRemoved(ConversationId),
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    /// State was rebuilt after a reconnect; re-read everything
    ResyncRequired,
}

impl fmt::Display for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreEvent::ConversationChanged(id) => write!(f, "conversation changed: {}", id),
            CoreEvent::ConversationRemoved(id) => write!(f, "conversation removed: {}", id),
            CoreEvent::TypingChanged {
                conversation_id,
                user_id,
                is_typing,
            } => write!(
                f,
                "{} {} typing in {}",
                user_id,
                if *is_typing { "started" } else { "stopped" },
                conversation_id
            ),
            CoreEvent::PresenceChanged { user_id, status } => {
                write!(f, "{} is {}", user_id, status)
            }
            CoreEvent::ResyncRequired => write!(f, "resync required"),
        }
    }
}

/// What dispatching one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    /// Already applied earlier, or not a forward step
    Duplicate,
    /// Refers to a message that has not arrived yet; applied on arrival
    Parked,
    /// Targets a removed conversation
    Dropped,
    /// Unknown event name, or nothing to act on
    Ignored,
}

/// Classifies and applies real-time events.
pub struct EventRouter {
    self_id: UserId,
    ledger: Arc<DeliveryStateMachine>,
    cipher: CipherEngine,
    directory: Arc<dyn Directory>,
    roster: Arc<RwLock<Roster>>,
    typing: TypingTracker,
    presence: PresenceBoard,
    lanes: LaneMap,
    events: broadcast::Sender<CoreEvent>,
}

type LaneMap = Mutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>;

/// Exclusive hold on one conversation lane. The lane entry is removed when
/// its last holder lets go.
struct LaneGuard<'a> {
    lanes: &'a LaneMap,
    conversation_id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut lanes = self.lanes.lock();
        let idle = lanes
            .get(&self.conversation_id)
            .is_some_and(|lane| Arc::strong_count(lane) == 1);
        if idle {
            lanes.remove(&self.conversation_id);
        }
    }
}

impl EventRouter {
    /// Create a router.
    ///
    /// # Arguments
    ///
    /// * `ledger` - Message ledger, shared with the session
    /// * `cipher` - Opens sealed message bodies
    /// * `directory` - Resolves the expected sender key for sealed bodies
    /// * `roster` - Conversation membership, shared with the session
    /// * `config` - Typing TTL and event channel capacity
    pub fn new(
        ledger: Arc<DeliveryStateMachine>,
        cipher: CipherEngine,
        directory: Arc<dyn Directory>,
        roster: Arc<RwLock<Roster>>,
        config: &CourierConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            self_id: ledger.self_id().clone(),
            typing: TypingTracker::new(config.typing_ttl(), events.clone()),
            presence: PresenceBoard::new(),
            lanes: Mutex::new(HashMap::new()),
            ledger,
            cipher,
            directory,
            roster,
            events,
        }
    }

    /// Subscribe to core notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn presence(&self) -> &PresenceBoard {
        &self.presence
    }

    /// Conversations with an event in flight.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Parse and dispatch a named event.
    ///
    /// Unknown names are ignored. A known name with a malformed payload
    /// fails with `MalformedEvent`.
    pub async fn dispatch_named(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> CourierResult<DispatchOutcome> {
        match RealtimeEvent::from_named(name, data)? {
            Some(event) => self.dispatch(event).await,
            None => {
                debug!(event = name, "Ignoring unknown event");
                Ok(DispatchOutcome::Ignored)
            }
        }
    }

    /// Apply one event inside its conversation's lane.
    pub async fn dispatch(&self, event: RealtimeEvent) -> CourierResult<DispatchOutcome> {
        let lane = self.lane_for(&event)?;
        let _guard = match lane {
            Some(ref conversation_id) => Some(self.enter_lane(conversation_id).await),
            None => None,
        };

        let rejoin = matches!(
            &event,
            RealtimeEvent::GroupMemberJoined(joined) if joined.user_id == self.self_id
        );
        if let Some(ref conversation_id) = lane {
            if !rejoin && self.is_removed(conversation_id) {
                debug!(event = event.name(), conversation = %conversation_id, "Dropping event for removed conversation");
                return Ok(DispatchOutcome::Dropped);
            }
        }

        let outcome = self.apply(event, lane).await?;
        Ok(outcome)
    }

    pub(crate) fn lane_for(&self, event: &RealtimeEvent) -> CourierResult<Option<ConversationId>> {
        let lane = match event {
            RealtimeEvent::MessageNew(wire) => Some(wire.conversation_id(&self.self_id)?),
            RealtimeEvent::MessageStatus(change) => change
                .conversation_id
                .clone()
                .or_else(|| self.ledger.conversation_of(&change.message_id)),
            RealtimeEvent::Typing(signal) => Some(signal.conversation_id()),
            RealtimeEvent::UserStatus(_) => None,
            RealtimeEvent::GroupDeleted(group) => Some(group.group_id.clone()),
            RealtimeEvent::GroupUpdated(update) => Some(update.group_id.clone()),
            RealtimeEvent::GroupMemberLeft(left) => Some(left.group_id.clone()),
            RealtimeEvent::GroupMemberJoined(joined) => Some(joined.group_id.clone()),
            RealtimeEvent::MessageEdited(edit) => self.ledger.conversation_of(&edit.message_id),
            RealtimeEvent::MessageDeleted(deletion) => {
                self.ledger.conversation_of(&deletion.message_id)
            }
            RealtimeEvent::MessageReaction(update) => {
                self.ledger.conversation_of(&update.message_id)
            }
        };
        Ok(lane)
    }

    async fn enter_lane(&self, conversation_id: &ConversationId) -> LaneGuard<'_> {
        let lane = {
            let mut lanes = self.lanes.lock();
            lanes
                .entry(conversation_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        LaneGuard {
            lanes: &self.lanes,
            conversation_id: conversation_id.clone(),
            guard: Some(lane.lock_owned().await),
        }
    }

    fn is_removed(&self, conversation_id: &ConversationId) -> bool {
        self.roster.read().is_removed(conversation_id)
    }

    async fn apply(
        &self,
        event: RealtimeEvent,
        lane: Option<ConversationId>,
    ) -> CourierResult<DispatchOutcome> {
        match event {
            RealtimeEvent::MessageNew(wire) => {
                if self.ledger.get(&wire.id).is_some() {
                    debug!(id = %wire.id, "Duplicate message.new absorbed");
                    return Ok(DispatchOutcome::Duplicate);
                }
                let message = self.decode_wire(&wire).await?;
                let conversation_id = message.conversation_id.clone();
                self.track_membership(&wire, &conversation_id);

                match self.ledger.apply_incoming(message) {
                    IncomingOutcome::Duplicate => Ok(DispatchOutcome::Duplicate),
                    IncomingOutcome::Inserted | IncomingOutcome::Reconciled => {
                        self.notify(CoreEvent::ConversationChanged(conversation_id));
                        Ok(DispatchOutcome::Applied)
                    }
                }
            }

            RealtimeEvent::MessageStatus(change) => {
                let outcome = self.ledger.apply_status_event_in(
                    lane.as_ref(),
                    &change.message_id,
                    change.status,
                    &change.user_id,
                );
                match outcome {
                    StatusOutcome::Applied => {
                        if let Some(conversation_id) = lane {
                            self.notify(CoreEvent::ConversationChanged(conversation_id));
                        }
                        Ok(DispatchOutcome::Applied)
                    }
                    StatusOutcome::Ignored => Ok(DispatchOutcome::Duplicate),
                    StatusOutcome::Parked => Ok(DispatchOutcome::Parked),
                }
            }

            RealtimeEvent::Typing(signal) => {
                if signal.user_id == self.self_id {
                    return Ok(DispatchOutcome::Ignored);
                }
                self.typing
                    .set_typing(signal.conversation_id(), signal.user_id, signal.is_typing);
                Ok(DispatchOutcome::Applied)
            }

            RealtimeEvent::UserStatus(update) => {
                if self.presence.apply(&update) {
                    self.notify(CoreEvent::PresenceChanged {
                        user_id: update.user_id,
                        status: update.status,
                    });
                    Ok(DispatchOutcome::Applied)
                } else {
                    Ok(DispatchOutcome::Duplicate)
                }
            }

            RealtimeEvent::GroupDeleted(group) => {
                self.remove_conversation(&group.group_id);
                Ok(DispatchOutcome::Applied)
            }

            RealtimeEvent::GroupUpdated(update) => {
                let updated =
                    self.roster
                        .write()
                        .update_group(&update.group_id, update.name, update.members);
                if updated {
                    self.notify(CoreEvent::ConversationChanged(update.group_id));
                    Ok(DispatchOutcome::Applied)
                } else {
                    Ok(DispatchOutcome::Dropped)
                }
            }

            RealtimeEvent::GroupMemberLeft(left) => {
                if left.user_id == self.self_id {
                    self.remove_conversation(&left.group_id);
                    return Ok(DispatchOutcome::Applied);
                }
                let removed = self
                    .roster
                    .write()
                    .remove_member(&left.group_id, &left.user_id);
                if removed {
                    self.notify(CoreEvent::ConversationChanged(left.group_id));
                    Ok(DispatchOutcome::Applied)
                } else {
                    Ok(DispatchOutcome::Duplicate)
                }
            }

            RealtimeEvent::GroupMemberJoined(joined) => {
                let changed = {
                    let mut roster = self.roster.write();
                    let rejoined = joined.user_id == self.self_id
                        && roster.restore_group(&joined.group_id);
                    if rejoined {
                        info!(conversation = %joined.group_id, "Rejoined group");
                    }
                    let added = roster.add_member(&joined.group_id, joined.user_id);
                    let updated = (joined.name.is_some() || joined.members.is_some())
                        && roster.update_group(&joined.group_id, joined.name, joined.members);
                    rejoined || added || updated
                };
                if changed {
                    self.notify(CoreEvent::ConversationChanged(joined.group_id));
                    Ok(DispatchOutcome::Applied)
                } else {
                    Ok(DispatchOutcome::Duplicate)
                }
            }

            RealtimeEvent::MessageEdited(edit) => {
                let payload = self.open_body(&edit.sender_id, &edit.body).await;
                let outcome = self
                    .ledger
                    .apply_edit(&edit.message_id, payload, edit.edited_at);
                Ok(self.marker_dispatch(outcome, lane))
            }

            RealtimeEvent::MessageDeleted(deletion) => {
                let outcome = self
                    .ledger
                    .apply_deletion(&deletion.message_id, deletion.deletion());
                Ok(self.marker_dispatch(outcome, lane))
            }

            RealtimeEvent::MessageReaction(update) => {
                let outcome = self
                    .ledger
                    .apply_reactions(&update.message_id, update.reactions);
                Ok(self.marker_dispatch(outcome, lane))
            }
        }
    }

    fn marker_dispatch(
        &self,
        outcome: MarkerOutcome,
        lane: Option<ConversationId>,
    ) -> DispatchOutcome {
        match outcome {
            MarkerOutcome::Applied => {
                if let Some(conversation_id) = lane {
                    self.notify(CoreEvent::ConversationChanged(conversation_id));
                }
                DispatchOutcome::Applied
            }
            MarkerOutcome::Ignored => DispatchOutcome::Duplicate,
            MarkerOutcome::Parked => DispatchOutcome::Parked,
        }
    }

    /// Turn a wire message into a ledger message, opening a sealed body.
    ///
    /// A body that cannot be opened becomes [`Payload::Unreadable`]; it is
    /// never dropped.
    pub async fn decode_wire(&self, wire: &WireMessage) -> CourierResult<Message> {
        let conversation_id = wire.conversation_id(&self.self_id)?;
        let payload = self.open_body(&wire.sender_id, &wire.body).await;

        let default_status = if wire.sender_id == self.self_id {
            MessageStatus::Sent
        } else {
            MessageStatus::Delivered
        };

        let mut message = Message::received(
            wire.id.clone(),
            conversation_id,
            wire.sender_id.clone(),
            payload,
            wire.created_at,
        )
        .with_kind(wire.kind)
        .with_status(wire.status.unwrap_or(default_status));
        message.client_id = wire.client_id;
        message.edited_at = wire.edited_at;
        message.deleted = wire.deleted;
        message.reactions = wire.reactions.clone();
        Ok(message)
    }

    async fn open_body(&self, sender: &UserId, body: &MessageBody) -> Payload {
        let envelope = match body {
            MessageBody::Plain { content } => return Payload::Text(content.clone()),
            MessageBody::Sealed { envelope } => envelope,
        };

        let expected = match self.directory.public_key(sender).await {
            Ok(key) if key == envelope.sender_public_key => key,
            Ok(_) => {
                // The sender may have rotated since we cached their key
                self.directory.invalidate(sender).await;
                match self.directory.public_key(sender).await {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(%sender, error = %e, "Sender key lookup failed");
                        return Payload::Unreadable;
                    }
                }
            }
            Err(e) => {
                warn!(%sender, error = %e, "Sender key lookup failed");
                return Payload::Unreadable;
            }
        };

        match self.cipher.open_text(envelope, &expected) {
            Ok(text) => Payload::Text(text),
            Err(e) => {
                warn!(%sender, error = %e, "Rendering unreadable placeholder");
                Payload::Unreadable
            }
        }
    }

    fn track_membership(&self, wire: &WireMessage, conversation_id: &ConversationId) {
        let mut roster = self.roster.write();
        match wire.group_id {
            Some(ref group) => {
                roster.ensure_group(group);
                roster.add_member(group, wire.sender_id.clone());
            }
            None => roster.ensure_peer(&UserId::new(conversation_id.as_str())),
        }
    }

    /// Remove a conversation outright: roster tombstone, ledger purge,
    /// typing cleared.
    pub(crate) fn remove_conversation(&self, conversation_id: &ConversationId) {
        self.roster.write().remove_group(conversation_id);
        let purged = self.ledger.purge_conversation(conversation_id);
        self.typing.clear_conversation(conversation_id);
        info!(conversation = %conversation_id, purged, "Conversation removed");
        self.notify(CoreEvent::ConversationRemoved(conversation_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::StaticDirectory;
    use crate::delivery::Deletion;
    use crate::keys::KeyStore;
    use crate::storage::MemorySecretStore;
    use serde_json::json;

    fn router() -> EventRouter {
        let ledger = Arc::new(DeliveryStateMachine::new(UserId::new("alice")));
        let keys = Arc::new(KeyStore::open(Arc::new(MemorySecretStore::new()), None).unwrap());
        EventRouter::new(
            ledger,
            CipherEngine::new(keys),
            Arc::new(StaticDirectory::new()),
            Arc::new(RwLock::new(Roster::new())),
            &CourierConfig::default(),
        )
    }

    fn new_message(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "senderId": "bob",
            "recipientId": "alice",
            "content": "hello",
            "createdAt": 1
        })
    }

    #[tokio::test]
    async fn test_duplicate_message_new() {
        let router = router();
        let first = router.dispatch_named("message.new", new_message("m1")).await.unwrap();
        let second = router.dispatch_named("message.new", new_message("m1")).await.unwrap();
        assert_eq!(first, DispatchOutcome::Applied);
        assert_eq!(second, DispatchOutcome::Duplicate);
        assert_eq!(router.ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_ignored() {
        let router = router();
        let outcome = router.dispatch_named("call.ring", json!({})).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_status_before_message_is_parked() {
        let router = router();
        let outcome = router
            .dispatch_named(
                "message.status",
                json!({ "messageId": "m1", "status": "read", "userId": "alice" }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Parked);

        router.dispatch_named("message.new", new_message("m1")).await.unwrap();
        let msg = router.ledger.get(&"m1".into()).unwrap();
        assert_eq!(msg.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_own_typing_ignored() {
        let router = router();
        let outcome = router
            .dispatch_named("message.typing", json!({ "userId": "alice", "isTyping": true }))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_group_deleted_drops_later_events() {
        let router = router();
        let mut rx = router.subscribe();
        router
            .dispatch_named(
                "message.new",
                json!({ "id": "g-m1", "senderId": "bob", "groupId": "g1", "content": "hey", "createdAt": 1 }),
            )
            .await
            .unwrap();

        router
            .dispatch_named("group.deleted", json!({ "groupId": "g1" }))
            .await
            .unwrap();
        assert_eq!(router.ledger.len(), 0);

        let late = router
            .dispatch_named(
                "message.new",
                json!({ "id": "g-m2", "senderId": "bob", "groupId": "g1", "content": "late", "createdAt": 2 }),
            )
            .await
            .unwrap();
        assert_eq!(late, DispatchOutcome::Dropped);

        let mut saw_removed = false;
        while let Ok(event) = rx.try_recv() {
            if event == CoreEvent::ConversationRemoved(ConversationId::new("g1")) {
                saw_removed = true;
            }
        }
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn test_self_leaving_group_removes_it() {
        let router = router();
        router
            .dispatch_named("group.updated", json!({ "groupId": "g1", "name": "Team" }))
            .await
            .unwrap();
        router
            .dispatch_named("group.member_left", json!({ "groupId": "g1", "userId": "alice" }))
            .await
            .unwrap();
        assert!(router.roster.read().is_removed(&ConversationId::new("g1")));
    }

    #[tokio::test]
    async fn test_deletion_before_message_is_parked() {
        let router = router();
        let outcome = router
            .dispatch_named(
                "message.deleted",
                json!({ "messageId": "m1", "deleteForEveryone": true }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Parked);

        router.dispatch_named("message.new", new_message("m1")).await.unwrap();
        let msg = router.ledger.get(&"m1".into()).unwrap();
        assert_eq!(msg.deleted, Some(Deletion::ForEveryone));
    }

    #[tokio::test]
    async fn test_status_after_group_deleted_is_dropped() {
        let router = router();
        router
            .dispatch_named(
                "message.new",
                json!({ "id": "g-m1", "senderId": "bob", "groupId": "g1", "content": "hey", "createdAt": 1 }),
            )
            .await
            .unwrap();
        router
            .dispatch_named("group.deleted", json!({ "groupId": "g1" }))
            .await
            .unwrap();

        let late = router
            .dispatch_named(
                "message.status",
                json!({ "messageId": "g-m1", "status": "read", "userId": "bob" }),
            )
            .await
            .unwrap();
        assert_eq!(late, DispatchOutcome::Dropped);
        assert_eq!(router.ledger.parked_len(), 0);
    }

    #[tokio::test]
    async fn test_self_rejoin_restores_group() {
        let router = router();
        let g1 = ConversationId::new("g1");
        router
            .dispatch_named("group.updated", json!({ "groupId": "g1", "name": "Team" }))
            .await
            .unwrap();
        router
            .dispatch_named("group.member_left", json!({ "groupId": "g1", "userId": "alice" }))
            .await
            .unwrap();

        // another member joining does not restore it
        let other = router
            .dispatch_named("group.member_joined", json!({ "groupId": "g1", "userId": "carol" }))
            .await
            .unwrap();
        assert_eq!(other, DispatchOutcome::Dropped);

        let rejoin = router
            .dispatch_named(
                "group.member_joined",
                json!({ "groupId": "g1", "userId": "alice", "name": "Team", "members": ["alice", "bob"] }),
            )
            .await
            .unwrap();
        assert_eq!(rejoin, DispatchOutcome::Applied);
        assert!(!router.roster.read().is_removed(&g1));

        let next = router
            .dispatch_named(
                "message.new",
                json!({ "id": "g-m2", "senderId": "bob", "groupId": "g1", "content": "welcome back", "createdAt": 2 }),
            )
            .await
            .unwrap();
        assert_eq!(next, DispatchOutcome::Applied);
    }

    #[tokio::test]
    async fn test_idle_lanes_are_released() {
        let router = router();
        for n in 0..5 {
            router
                .dispatch_named(
                    "message.new",
                    json!({ "id": format!("g-m{}", n), "senderId": "bob", "groupId": format!("g{}", n), "content": "hi", "createdAt": n }),
                )
                .await
                .unwrap();
        }
        router
            .dispatch_named("group.deleted", json!({ "groupId": "g0" }))
            .await
            .unwrap();
        assert_eq!(router.active_lanes(), 0);
    }

    #[tokio::test]
    async fn test_sealed_body_from_unknown_sender_is_unreadable() {
        let router = router();
        let envelope = json!({
            "ciphertext": "AAAA",
            "nonce": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            "senderPublicKey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
        });
        router
            .dispatch_named(
                "message.new",
                json!({ "id": "m1", "senderId": "bob", "recipientId": "alice", "envelope": envelope, "createdAt": 1 }),
            )
            .await
            .unwrap();
        let msg = router.ledger.get(&"m1".into()).unwrap();
        assert_eq!(msg.payload, Payload::Unreadable);
    }

    #[test]
    fn test_core_event_display() {
        let event = CoreEvent::PresenceChanged {
            user_id: UserId::new("bob"),
            status: PresenceStatus::Away,
        };
        assert_eq!(event.to_string(), "bob is away");
    }
}
