//! Message records held by the delivery ledger

use serde::{Deserialize, Serialize};

use super::status::{FailureReason, MessageStatus};
use crate::types::{ClientLocalId, ConversationId, MessageId, MessageKind, UserId};

/// Decrypted content of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "text")]
pub enum Payload {
    Text(String),
    /// Placeholder for a message that no candidate key could open
    Unreadable,
}

impl Payload {
    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Unreadable => None,
        }
    }

    /// Text shown in place of the content (previews, CLI output).
    pub fn display_text(&self) -> &str {
        match self {
            Payload::Text(text) => text,
            Payload::Unreadable => "[unable to decrypt message]",
        }
    }
}

/// How a message was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deletion {
    /// Hidden on this account only
    ForSelf,
    /// Removed for every participant
    ForEveryone,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
}

/// A message as tracked by the [`DeliveryStateMachine`](super::DeliveryStateMachine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server id once acknowledged, `local-<ulid>` before
    pub id: MessageId,
    /// Group id, or the other participant's id for direct messages
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub payload: Payload,
    pub kind: MessageKind,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    pub status: MessageStatus,
    /// Set on optimistic sends from this device
    pub client_id: Option<ClientLocalId>,
    pub edited_at: Option<i64>,
    pub deleted: Option<Deletion>,
    pub reactions: Vec<Reaction>,
    /// Set alongside `MessageStatus::Failed`
    pub failure: Option<FailureReason>,
}

impl Message {
    /// A message received from the server, not yet placed in the ledger.
    pub fn received(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: Payload,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            payload,
            kind: MessageKind::Text,
            created_at,
            status: MessageStatus::Delivered,
            client_id: None,
            edited_at: None,
            deleted: None,
            reactions: Vec::new(),
            failure: None,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether someone other than `self_id` wrote this message.
    pub fn is_incoming(&self, self_id: &UserId) -> bool {
        &self.sender_id != self_id
    }

    /// Deleted messages stay in the ledger but are hidden from projections.
    pub fn is_visible(&self) -> bool {
        self.deleted.is_none()
    }
}

/// Content for an optimistic send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingDraft {
    pub conversation_id: ConversationId,
    pub text: String,
    pub kind: MessageKind,
}

impl OutgoingDraft {
    pub fn text(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            text: text.into(),
            kind: MessageKind::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_message_starts_delivered() {
        let msg = Message::received(
            MessageId::new("m1"),
            ConversationId::new("bob"),
            UserId::new("bob"),
            Payload::Text("hi".into()),
            1,
        );
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert!(msg.is_incoming(&UserId::new("alice")));
        assert!(!msg.is_incoming(&UserId::new("bob")));
        assert!(msg.is_visible());
    }

    #[test]
    fn test_unreadable_placeholder_text() {
        assert_eq!(Payload::Unreadable.text(), None);
        assert!(!Payload::Unreadable.display_text().is_empty());
    }
}
