//! Session flows against scripted collaborators
//!
//! The REST and directory collaborators here are in-memory fakes whose
//! behaviour each test scripts: rejecting a stale key once, holding an ack
//! back until an echo has arrived, or serving pages for a resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    CachedDirectory, CipherEngine, ClientLocalId, ConnectionStatus, ConversationId,
    ConversationKind, ConversationSummary, CoreEvent, CourierConfig, CourierError, CourierResult,
    Directory, FailureReason, KeyStore, MemorySecretStore, MessageId, MessageStatus,
    OutgoingEdit, OutgoingMessage, Payload, RestApi, Session, StaticDirectory, TransportSignal,
    UserId, WireMessage,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Notify};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct ScriptedRest {
    sends: Mutex<Vec<OutgoingMessage>>,
    stale_once: AtomicBool,
    gate: Option<Arc<Notify>>,
    submitted: Option<mpsc::UnboundedSender<ClientLocalId>>,
    summaries: Mutex<Vec<ConversationSummary>>,
    pages: Mutex<HashMap<ConversationId, Vec<WireMessage>>>,
}

impl ScriptedRest {
    fn gated() -> (Self, Arc<Notify>, mpsc::UnboundedReceiver<ClientLocalId>) {
        let gate = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let rest = Self {
            gate: Some(Arc::clone(&gate)),
            submitted: Some(tx),
            ..Self::default()
        };
        (rest, gate, rx)
    }

    fn serve_page(&self, conversation: &str, page: serde_json::Value) {
        let page: Vec<WireMessage> = serde_json::from_value(page).unwrap();
        self.pages.lock().insert(ConversationId::new(conversation), page);
    }
}

#[async_trait]
impl RestApi for ScriptedRest {
    async fn send(&self, message: OutgoingMessage) -> CourierResult<MessageId> {
        if let Some(ref tx) = self.submitted {
            let _ = tx.send(message.client_id);
        }
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
        if self.stale_once.swap(false, Ordering::SeqCst) {
            let recipient = message.copies[0].recipient_id.to_string();
            self.sends.lock().push(message);
            return Err(CourierError::StaleRecipientKey(recipient));
        }
        let mut sends = self.sends.lock();
        sends.push(message);
        Ok(MessageId::new(format!("srv-{}", sends.len())))
    }

    async fn fetch(
        &self,
        conversation_id: &ConversationId,
        _before: Option<&MessageId>,
        limit: usize,
    ) -> CourierResult<Vec<WireMessage>> {
        let pages = self.pages.lock();
        let page = pages.get(conversation_id).cloned().unwrap_or_default();
        Ok(page.into_iter().take(limit).collect())
    }

    async fn conversations(&self) -> CourierResult<Vec<ConversationSummary>> {
        Ok(self.summaries.lock().clone())
    }

    async fn edit(&self, _edit: OutgoingEdit) -> CourierResult<()> {
        Ok(())
    }

    async fn delete(&self, _message_id: &MessageId, _for_everyone: bool) -> CourierResult<()> {
        Ok(())
    }
}

/// Lets a test publish new keys behind a cache.
struct SharedDirectory(Arc<StaticDirectory>);

#[async_trait]
impl Directory for SharedDirectory {
    async fn public_key(&self, user: &UserId) -> CourierResult<[u8; 32]> {
        self.0.public_key(user).await
    }

    async fn invalidate(&self, user: &UserId) {
        self.0.invalidate(user).await
    }
}

fn device() -> (CipherEngine, [u8; 32]) {
    let keys = Arc::new(KeyStore::open(Arc::new(MemorySecretStore::new()), None).unwrap());
    keys.rotate(KeyStore::generate_key_pair().unwrap()).unwrap();
    let public_key = *keys.current().unwrap().public_key();
    (CipherEngine::new(keys), public_key)
}

fn session_with(rest: Arc<ScriptedRest>, directory: Arc<dyn Directory>) -> Arc<Session> {
    let keys = Arc::new(KeyStore::open(Arc::new(MemorySecretStore::new()), None).unwrap());
    let session = Session::new(
        UserId::new("alice"),
        keys,
        rest,
        directory,
        CourierConfig::default(),
    )
    .unwrap();
    session.provision_keys().unwrap();
    Arc::new(session)
}

fn directory_with_bob() -> Arc<StaticDirectory> {
    let directory = StaticDirectory::new();
    directory.publish(UserId::new("bob"), device().1);
    Arc::new(directory)
}

// ============================================================================
// Sending
// ============================================================================

/// A stale recipient key is refreshed once and the message goes out
#[tokio::test]
async fn test_stale_recipient_key_is_refreshed_and_resent() {
    let (bob_old, bob_old_key) = device();
    let (bob_new, bob_new_key) = device();

    let upstream = Arc::new(StaticDirectory::new());
    upstream.publish(UserId::new("bob"), bob_old_key);
    let directory = Arc::new(CachedDirectory::new(SharedDirectory(Arc::clone(&upstream))));
    directory.public_key(&UserId::new("bob")).await.unwrap();

    // Bob rotates; our cache still has the old key
    upstream.publish(UserId::new("bob"), bob_new_key);

    let rest = Arc::new(ScriptedRest::default());
    rest.stale_once.store(true, Ordering::SeqCst);
    let session = session_with(Arc::clone(&rest), directory.clone());
    let alice_key = *session.key_store().current().unwrap().public_key();

    let id = session
        .send_text(&ConversationId::new("bob"), "after rotation")
        .await
        .unwrap();
    assert_eq!(session.ledger().get(&id).unwrap().status, MessageStatus::Sent);

    let sends = rest.sends.lock();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0].client_id, sends[1].client_id);

    let resent = &sends[1].copies[0].envelope;
    assert_eq!(bob_new.decrypt(resent, &alice_key).unwrap(), b"after rotation");
    assert!(matches!(
        bob_old.decrypt(resent, &alice_key),
        Err(CourierError::DecryptionFailed)
    ));
    assert_eq!(directory.cached(&UserId::new("bob")), Some(bob_new_key));
}

/// Group messages are sealed once per other member
#[tokio::test]
async fn test_group_send_fans_out_per_member() {
    let (bob, bob_key) = device();
    let (carol, carol_key) = device();
    let directory = StaticDirectory::new();
    directory.publish(UserId::new("bob"), bob_key);
    directory.publish(UserId::new("carol"), carol_key);

    let rest = Arc::new(ScriptedRest::default());
    let session = session_with(Arc::clone(&rest), Arc::new(directory));
    let alice_key = *session.key_store().current().unwrap().public_key();
    let team = ConversationId::new("team");
    session.roster().write().upsert_group(
        team.clone(),
        "Team",
        ["alice", "bob", "carol"].map(UserId::new),
    );

    session.send_text(&team, "hi all").await.unwrap();

    let sends = rest.sends.lock();
    let message = &sends[0];
    assert_eq!(message.group_id, Some(team));
    assert_eq!(message.copies.len(), 2);
    for copy in &message.copies {
        let engine = if copy.recipient_id == UserId::new("bob") { &bob } else { &carol };
        assert_eq!(engine.open_text(&copy.envelope, &alice_key).unwrap(), "hi all");
    }
}

/// The server echo arriving before the ack merges into one message
#[tokio::test]
async fn test_echo_before_ack_merges() {
    let (rest, gate, mut submitted) = ScriptedRest::gated();
    let rest = Arc::new(rest);
    let session = session_with(Arc::clone(&rest), directory_with_bob());
    let bob = ConversationId::new("bob");

    let sending = {
        let session = Arc::clone(&session);
        let bob = bob.clone();
        tokio::spawn(async move { session.send_text(&bob, "hello bob").await })
    };

    let client_id = submitted.recv().await.unwrap();
    assert_eq!(session.messages(&bob)[0].status, MessageStatus::Sending);

    session
        .router()
        .dispatch_named(
            "message.new",
            json!({
                "id": "srv-1",
                "senderId": "alice",
                "recipientId": "bob",
                "content": "server copy",
                "clientId": client_id.to_string(),
                "createdAt": 10
            }),
        )
        .await
        .unwrap();

    gate.notify_one();
    let server_id = sending.await.unwrap().unwrap();
    assert_eq!(server_id, MessageId::new("srv-1"));

    let messages = session.messages(&bob);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, server_id);
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].payload, Payload::Text("hello bob".to_string()));
}

/// A send cancelled while in flight stays cancelled even if the ack arrives
#[tokio::test]
async fn test_cancel_in_flight_send() {
    let (rest, gate, mut submitted) = ScriptedRest::gated();
    let session = session_with(Arc::new(rest), directory_with_bob());
    let bob = ConversationId::new("bob");

    let sending = {
        let session = Arc::clone(&session);
        let bob = bob.clone();
        tokio::spawn(async move { session.send_text(&bob, "never mind").await })
    };

    let client_id = submitted.recv().await.unwrap();
    session.cancel(client_id).unwrap();
    gate.notify_one();
    sending.await.unwrap().unwrap();

    let message = session.ledger().get_by_client_id(client_id).unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.failure, Some(FailureReason::Cancelled));
    assert_eq!(session.conversations()[0].unread_count, 0);
}

// ============================================================================
// Reconnect & Resync
// ============================================================================

fn bob_page() -> serde_json::Value {
    json!([
        { "id": "m2", "senderId": "bob", "recipientId": "alice", "content": "you there?", "createdAt": 20 },
        { "id": "m1", "senderId": "bob", "recipientId": "alice", "content": "hi", "createdAt": 10 }
    ])
}

/// Reconnecting refetches and merges without duplicating known messages
#[tokio::test]
async fn test_reconnect_resync_merges_without_duplicates() {
    let rest = Arc::new(ScriptedRest::default());
    rest.summaries.lock().push(ConversationSummary {
        id: ConversationId::new("bob"),
        kind: ConversationKind::Direct,
        name: "Bob".to_string(),
        members: Vec::new(),
    });
    rest.serve_page("bob", bob_page());

    let session = session_with(Arc::clone(&rest), directory_with_bob());
    let mut events = session.subscribe();

    session
        .router()
        .dispatch_named(
            "message.new",
            json!({ "id": "m1", "senderId": "bob", "recipientId": "alice", "content": "hi", "createdAt": 10 }),
        )
        .await
        .unwrap();
    session.on_connection_status(ConnectionStatus::Connected).await.unwrap();

    session.on_connection_status(ConnectionStatus::Reconnecting).await.unwrap();
    let resynced = session
        .on_connection_status(ConnectionStatus::Connected)
        .await
        .unwrap();
    assert!(resynced);

    let list = session.conversations();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "Bob");
    assert_eq!(list[0].unread_count, 2);
    assert_eq!(session.ledger().len(), 2);

    let mut resyncs = 0;
    while let Ok(event) = events.try_recv() {
        if event == CoreEvent::ResyncRequired {
            resyncs += 1;
        }
    }
    assert_eq!(resyncs, 2);
}

/// A group missing from the server's list was deleted while offline
#[tokio::test]
async fn test_resync_removes_vanished_groups() {
    let rest = Arc::new(ScriptedRest::default());
    let session = session_with(Arc::clone(&rest), directory_with_bob());
    session
        .router()
        .dispatch_named("group.updated", json!({ "groupId": "old-team", "name": "Old" }))
        .await
        .unwrap();
    assert_eq!(session.conversations().len(), 1);

    session.resync().await.unwrap();
    assert!(session.conversations().is_empty());
    assert!(session.roster().read().is_removed(&ConversationId::new("old-team")));
}

/// A group we left comes back once the server lists it again
#[tokio::test]
async fn test_left_group_returns_after_resync() {
    let rest = Arc::new(ScriptedRest::default());
    let session = session_with(Arc::clone(&rest), directory_with_bob());
    let team = ConversationId::new("team");
    session
        .router()
        .dispatch_named(
            "group.updated",
            json!({ "groupId": "team", "name": "Team", "members": ["alice", "bob"] }),
        )
        .await
        .unwrap();
    session
        .router()
        .dispatch_named("group.member_left", json!({ "groupId": "team", "userId": "alice" }))
        .await
        .unwrap();
    assert!(session.roster().read().is_removed(&team));
    assert!(matches!(
        session.send_text(&team, "anyone?").await,
        Err(CourierError::UnknownConversation(_))
    ));

    rest.summaries.lock().push(ConversationSummary {
        id: team.clone(),
        kind: ConversationKind::Group,
        name: "Team".to_string(),
        members: vec![UserId::new("alice"), UserId::new("bob")],
    });
    session.resync().await.unwrap();

    assert!(!session.roster().read().is_removed(&team));
    assert!(session.conversations().iter().any(|c| c.id == team));
    let sent = session.send_text(&team, "back again").await.unwrap();
    assert_eq!(sent, MessageId::new("srv-1"));
    assert_eq!(rest.sends.lock()[0].group_id, Some(team));
}

/// Older pages merge below what we already hold
#[tokio::test]
async fn test_load_more_pages_history() {
    let rest = Arc::new(ScriptedRest::default());
    rest.serve_page("bob", bob_page());
    let session = session_with(Arc::clone(&rest), directory_with_bob());
    let bob = ConversationId::new("bob");

    assert_eq!(session.load_more(&bob).await.unwrap(), 2);
    assert_eq!(session.load_more(&bob).await.unwrap(), 0);

    let ids: Vec<MessageId> = session.messages(&bob).into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![MessageId::new("m1"), MessageId::new("m2")]);
}

// ============================================================================
// Transport Driving
// ============================================================================

/// Events pushed through the transport channel all land in the ledger
#[tokio::test]
async fn test_drive_dispatches_across_conversations() {
    let rest = Arc::new(ScriptedRest::default());
    let session = session_with(Arc::clone(&rest), directory_with_bob());
    let (tx, rx) = mpsc::channel(16);
    let driver = tokio::spawn(Arc::clone(&session).drive(rx));

    tx.send(TransportSignal::Connection(ConnectionStatus::Connected))
        .await
        .unwrap();
    for (id, sender) in [("b1", "bob"), ("c1", "carol"), ("b2", "bob")] {
        let event = courier_core::RealtimeEvent::from_named(
            "message.new",
            json!({ "id": id, "senderId": sender, "recipientId": "alice", "content": "x", "createdAt": 1 }),
        )
        .unwrap()
        .unwrap();
        tx.send(TransportSignal::Event(event)).await.unwrap();
    }
    let status = courier_core::RealtimeEvent::from_named(
        "message.status",
        json!({ "messageId": "b1", "status": "read", "userId": "alice", "conversationId": "bob" }),
    )
    .unwrap()
    .unwrap();
    tx.send(TransportSignal::Event(status)).await.unwrap();
    drop(tx);

    driver.await.unwrap();

    assert_eq!(session.ledger().len(), 3);
    assert_eq!(session.connection_status(), ConnectionStatus::Connected);
    assert_eq!(
        session.ledger().get(&MessageId::new("b1")).unwrap().status,
        MessageStatus::Read
    );
    assert_eq!(session.conversations().len(), 2);
    assert_eq!(session.router().active_lanes(), 0);
}

/// Logging out wipes keys; sending afterwards fails with NoLocalKey
#[tokio::test]
async fn test_logout_then_send_fails() {
    let rest = Arc::new(ScriptedRest::default());
    let session = session_with(Arc::clone(&rest), directory_with_bob());
    session.logout().unwrap();

    let result = session.send_text(&ConversationId::new("bob"), "hello?").await;
    assert!(matches!(result, Err(CourierError::NoLocalKey)));
    assert!(rest.sends.lock().is_empty());
}
