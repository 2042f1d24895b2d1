//! Real-time event payloads
//!
//! Events arrive as `{ "event": <name>, "data": { ... } }` with camelCase
//! payload fields. Each known name maps to one [`RealtimeEvent`] variant.

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedEnvelope;
use crate::delivery::{Deletion, MessageStatus, Reaction};
use crate::error::{CourierError, CourierResult};
use crate::types::{ClientLocalId, ConversationId, MessageId, MessageKind, UserId};

/// Every event name the router understands.
pub const KNOWN_EVENTS: &[&str] = &[
    "message.new",
    "message.status",
    "message.typing",
    "user.status",
    "group.deleted",
    "group.updated",
    "group.member_left",
    "group.member_joined",
    "message.edited",
    "message.deleted",
    "message.reaction",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RealtimeEvent {
    #[serde(rename = "message.new")]
    MessageNew(WireMessage),
    #[serde(rename = "message.status")]
    MessageStatus(StatusChange),
    #[serde(rename = "message.typing")]
    Typing(TypingSignal),
    #[serde(rename = "user.status")]
    UserStatus(PresenceUpdate),
    #[serde(rename = "group.deleted")]
    GroupDeleted(GroupRef),
    #[serde(rename = "group.updated")]
    GroupUpdated(GroupUpdate),
    #[serde(rename = "group.member_left")]
    GroupMemberLeft(MemberLeft),
    #[serde(rename = "group.member_joined")]
    GroupMemberJoined(MemberJoined),
    #[serde(rename = "message.edited")]
    MessageEdited(MessageEdit),
    #[serde(rename = "message.deleted")]
    MessageDeleted(MessageDeletion),
    #[serde(rename = "message.reaction")]
    MessageReaction(ReactionUpdate),
}

impl RealtimeEvent {
    /// Parse a named event.
    ///
    /// Returns `Ok(None)` for names the router does not know.
    ///
    /// # Errors
    ///
    /// `MalformedEvent` if a known event carries a payload that does not
    /// match its shape.
    pub fn from_named(name: &str, data: serde_json::Value) -> CourierResult<Option<Self>> {
        if !KNOWN_EVENTS.contains(&name) {
            return Ok(None);
        }
        let tagged = serde_json::json!({ "event": name, "data": data });
        serde_json::from_value(tagged)
            .map(Some)
            .map_err(|e| CourierError::MalformedEvent {
                event: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::MessageNew(_) => "message.new",
            RealtimeEvent::MessageStatus(_) => "message.status",
            RealtimeEvent::Typing(_) => "message.typing",
            RealtimeEvent::UserStatus(_) => "user.status",
            RealtimeEvent::GroupDeleted(_) => "group.deleted",
            RealtimeEvent::GroupUpdated(_) => "group.updated",
            RealtimeEvent::GroupMemberLeft(_) => "group.member_left",
            RealtimeEvent::GroupMemberJoined(_) => "group.member_joined",
            RealtimeEvent::MessageEdited(_) => "message.edited",
            RealtimeEvent::MessageDeleted(_) => "message.deleted",
            RealtimeEvent::MessageReaction(_) => "message.reaction",
        }
    }
}

/// Message content on the wire: sealed for this device, or plaintext
/// (system messages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Sealed { envelope: EncryptedEnvelope },
    Plain { content: String },
}

/// A message as delivered by `message.new` and by REST pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<ConversationId>,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Present on echoes of our own sends
    #[serde(default)]
    pub client_id: Option<ClientLocalId>,
    /// Only meaningful on REST pages
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub edited_at: Option<i64>,
    #[serde(default)]
    pub deleted: Option<Deletion>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl WireMessage {
    /// The conversation this message belongs to, seen from `self_id`.
    ///
    /// Group id if present, else the participant who is not `self_id`.
    pub fn conversation_id(&self, self_id: &UserId) -> CourierResult<ConversationId> {
        if let Some(ref group) = self.group_id {
            return Ok(group.clone());
        }
        if &self.sender_id != self_id {
            return Ok(ConversationId::direct(&self.sender_id));
        }
        self.recipient_id
            .as_ref()
            .map(ConversationId::direct)
            .ok_or_else(|| CourierError::MalformedEvent {
                event: "message.new".to_string(),
                reason: format!("own message {} has neither groupId nor recipientId", self.id),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub message_id: MessageId,
    pub status: MessageStatus,
    /// User whose action produced the status
    pub user_id: UserId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub user_id: UserId,
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<ConversationId>,
    pub is_typing: bool,
}

impl TypingSignal {
    pub fn conversation_id(&self) -> ConversationId {
        match self.group_id {
            Some(ref group) => group.clone(),
            None => ConversationId::direct(&self.user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Away => write!(f, "away"),
            PresenceStatus::Busy => write!(f, "busy"),
            PresenceStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default)]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub group_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdate {
    pub group_id: ConversationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Option<Vec<UserId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLeft {
    pub group_id: ConversationId,
    pub user_id: UserId,
}

/// A member was added to a group. When the member is the local user the
/// payload carries the group's current name and members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberJoined {
    pub group_id: ConversationId,
    pub user_id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Option<Vec<UserId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdit {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(flatten)]
    pub body: MessageBody,
    pub edited_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletion {
    pub message_id: MessageId,
    #[serde(default)]
    pub delete_for_everyone: bool,
}

impl MessageDeletion {
    pub fn deletion(&self) -> Deletion {
        if self.delete_for_everyone {
            Deletion::ForEveryone
        } else {
            Deletion::ForSelf
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub message_id: MessageId,
    pub reactions: Vec<Reaction>,
}
