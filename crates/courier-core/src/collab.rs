//! Interfaces to the collaborators around the core
//!
//! ```text
//!   transport ──TransportSignal──► Session::drive ──► EventRouter
//!        ▲                                 │
//!        └──────── ReceiptHook ◄───────────┘
//!
//!   RestApi    send / fetch pages / list conversations
//!   Directory  user id → current public key
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::EncryptedEnvelope;
use crate::error::{CourierError, CourierResult};
use crate::keys::KEY_SIZE;
use crate::logging::fingerprint;
use crate::roster::ConversationKind;
use crate::router::{RealtimeEvent, WireMessage};
use crate::types::{ClientLocalId, ConversationId, MessageId, MessageKind, UserId};

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Everything the transport pushes into the core.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Event(RealtimeEvent),
    Connection(ConnectionStatus),
}

/// One recipient's sealed copy of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedCopy {
    pub recipient_id: UserId,
    pub envelope: EncryptedEnvelope,
}

/// A message handed to [`RestApi::send`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub client_id: ClientLocalId,
    pub conversation_id: ConversationId,
    /// Set for group messages
    pub group_id: Option<ConversationId>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// One copy per recipient
    pub copies: Vec<SealedCopy>,
}

/// A replacement body handed to [`RestApi::edit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEdit {
    pub message_id: MessageId,
    pub copies: Vec<SealedCopy>,
}

/// Conversation list entry returned by [`RestApi::conversations`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: String,
    #[serde(default)]
    pub members: Vec<UserId>,
}

/// REST collaborator.
#[async_trait]
pub trait RestApi: Send + Sync {
    /// Submit a message. Returns the durable server id.
    ///
    /// Fails with `StaleRecipientKey(user)` if a copy was sealed to a key
    /// the recipient no longer holds.
    async fn send(&self, message: OutgoingMessage) -> CourierResult<MessageId>;

    /// A page of messages older than `before`, newest first.
    async fn fetch(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> CourierResult<Vec<WireMessage>>;

    /// The account's conversation list.
    async fn conversations(&self) -> CourierResult<Vec<ConversationSummary>>;

    /// Replace the body of an acknowledged message.
    async fn edit(&self, edit: OutgoingEdit) -> CourierResult<()>;

    async fn delete(&self, message_id: &MessageId, for_everyone: bool) -> CourierResult<()>;
}

/// Directory collaborator: resolves a user's current public key.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn public_key(&self, user: &UserId) -> CourierResult<[u8; KEY_SIZE]>;

    /// Forget anything cached for `user`; the next lookup asks upstream.
    async fn invalidate(&self, user: &UserId);
}

/// Caches lookups of an inner directory until invalidated.
pub struct CachedDirectory<D> {
    inner: D,
    cache: RwLock<HashMap<UserId, [u8; KEY_SIZE]>>,
}

impl<D: Directory> CachedDirectory<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached(&self, user: &UserId) -> Option<[u8; KEY_SIZE]> {
        self.cache.read().get(user).copied()
    }
}

#[async_trait]
impl<D: Directory> Directory for CachedDirectory<D> {
    async fn public_key(&self, user: &UserId) -> CourierResult<[u8; KEY_SIZE]> {
        if let Some(key) = self.cached(user) {
            return Ok(key);
        }
        let key = self.inner.public_key(user).await?;
        debug!(%user, key = %fingerprint(&key), "Directory lookup");
        self.cache.write().insert(user.clone(), key);
        Ok(key)
    }

    async fn invalidate(&self, user: &UserId) {
        self.cache.write().remove(user);
        self.inner.invalidate(user).await;
    }
}

/// Directory backed by a fixed table, for offline use and tests.
#[derive(Default)]
pub struct StaticDirectory {
    keys: RwLock<HashMap<UserId, [u8; KEY_SIZE]>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) a user's key.
    pub fn publish(&self, user: UserId, key: [u8; KEY_SIZE]) {
        self.keys.write().insert(user, key);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn public_key(&self, user: &UserId) -> CourierResult<[u8; KEY_SIZE]> {
        self.keys
            .read()
            .get(user)
            .copied()
            .ok_or_else(|| CourierError::Directory(format!("No public key for {}", user)))
    }

    async fn invalidate(&self, _user: &UserId) {}
}

/// REST collaborator for a session with no server: nothing to fetch, sends
/// are refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineRest;

#[async_trait]
impl RestApi for OfflineRest {
    async fn send(&self, _message: OutgoingMessage) -> CourierResult<MessageId> {
        Err(CourierError::Rest("offline: no server to send to".to_string()))
    }

    async fn fetch(
        &self,
        _conversation_id: &ConversationId,
        _before: Option<&MessageId>,
        _limit: usize,
    ) -> CourierResult<Vec<WireMessage>> {
        Ok(Vec::new())
    }

    async fn conversations(&self) -> CourierResult<Vec<ConversationSummary>> {
        Ok(Vec::new())
    }

    async fn edit(&self, _edit: OutgoingEdit) -> CourierResult<()> {
        Err(CourierError::Rest("offline: no server to edit on".to_string()))
    }

    async fn delete(&self, _message_id: &MessageId, _for_everyone: bool) -> CourierResult<()> {
        Err(CourierError::Rest("offline: no server to delete on".to_string()))
    }
}
