//! Conversation list projection
//!
//! The conversation list is never stored. [`ConversationProjector::project`]
//! derives it from the ledger's messages, the roster and the live typing
//! indicators, so it can be rebuilt from scratch at any time (for example
//! after a reconnect resync).

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::delivery::{Message, MessageStatus};
use crate::roster::{ConversationKind, Roster};
use crate::types::{ConversationId, UserId};

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: String,
    /// Latest message that is not deleted
    pub last_message: Option<Message>,
    /// `last_message` text, truncated
    pub preview: Option<String>,
    pub unread_count: usize,
    pub typing_users: Vec<UserId>,
    pub is_typing: bool,
    /// Unix timestamp in milliseconds
    pub last_message_at: Option<i64>,
}

impl Conversation {
    pub fn has_messages(&self) -> bool {
        self.last_message.is_some()
    }
}

pub struct ConversationProjector {
    self_id: UserId,
    preview_chars: usize,
}

impl ConversationProjector {
    pub fn new(self_id: UserId, preview_chars: usize) -> Self {
        Self {
            self_id,
            preview_chars,
        }
    }

    /// Derive the ordered conversation list.
    ///
    /// Ordering: conversations with messages first, then most recent message
    /// first, then name. Removed conversations never appear.
    ///
    /// # Arguments
    ///
    /// * `messages` - Every message in the ledger
    /// * `roster` - Membership and display names
    /// * `typing` - Live typing indicators by conversation
    pub fn project(
        &self,
        messages: &[Message],
        roster: &Roster,
        typing: &HashMap<ConversationId, Vec<UserId>>,
    ) -> Vec<Conversation> {
        let mut by_conversation: HashMap<&ConversationId, Vec<&Message>> = HashMap::new();
        for message in messages {
            by_conversation
                .entry(&message.conversation_id)
                .or_default()
                .push(message);
        }

        let ids: BTreeSet<ConversationId> = roster
            .conversation_ids()
            .into_iter()
            .chain(by_conversation.keys().map(|id| (*id).clone()))
            .filter(|id| !roster.is_removed(id))
            .collect();

        let mut conversations: Vec<Conversation> = ids
            .into_iter()
            .map(|id| {
                let messages = by_conversation.get(&id).map(Vec::as_slice).unwrap_or(&[]);
                let typing_users = typing.get(&id).cloned().unwrap_or_default();
                self.project_one(id, messages, roster, typing_users)
            })
            .collect();

        conversations.sort_by(compare_conversations);
        conversations
    }

    fn project_one(
        &self,
        id: ConversationId,
        messages: &[&Message],
        roster: &Roster,
        typing_users: Vec<UserId>,
    ) -> Conversation {
        let last_message = messages
            .iter()
            .filter(|m| m.is_visible())
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|m| (*m).clone());

        let unread_count = messages
            .iter()
            .filter(|m| m.is_visible())
            .filter(|m| m.is_incoming(&self.self_id))
            .filter(|m| m.status.can_transition_to(MessageStatus::Read))
            .count();

        let preview = last_message
            .as_ref()
            .map(|m| truncate_preview(m.payload.display_text(), self.preview_chars));

        Conversation {
            kind: roster.kind_of(&id),
            name: roster.display_name(&id),
            last_message_at: last_message.as_ref().map(|m| m.created_at),
            last_message,
            preview,
            unread_count,
            is_typing: !typing_users.is_empty(),
            typing_users,
            id,
        }
    }
}

fn compare_conversations(a: &Conversation, b: &Conversation) -> Ordering {
    b.has_messages()
        .cmp(&a.has_messages())
        .then_with(|| b.last_message_at.cmp(&a.last_message_at))
        .then_with(|| a.name.cmp(&b.name))
}

/// Cut `text` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{Deletion, Payload};
    use crate::types::MessageId;

    fn me() -> UserId {
        UserId::new("alice")
    }

    fn msg(id: &str, conv: &str, sender: &str, at: i64) -> Message {
        Message::received(
            MessageId::new(id),
            ConversationId::new(conv),
            UserId::new(sender),
            Payload::Text(format!("text {}", id)),
            at,
        )
    }

    fn projector() -> ConversationProjector {
        ConversationProjector::new(me(), 100)
    }

    #[test]
    fn test_sort_order() {
        let mut roster = Roster::new();
        roster.upsert_peer(UserId::new("zed"), "Zed");
        roster.upsert_peer(UserId::new("amy"), "Amy");
        roster.upsert_peer(UserId::new("bob"), "Bob");
        roster.upsert_peer(UserId::new("cat"), "Cat");

        let messages = vec![msg("1", "bob", "bob", 10), msg("2", "cat", "cat", 20)];
        let list = projector().project(&messages, &roster, &HashMap::new());
        let names: Vec<&str> = list.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Cat", "Bob", "Amy", "Zed"]);
    }

    #[test]
    fn test_unread_counts_incoming_below_read() {
        let roster = Roster::new();
        let messages = vec![
            msg("1", "bob", "bob", 1),
            msg("2", "bob", "bob", 2).with_status(MessageStatus::Read),
            msg("3", "bob", "alice", 3).with_status(MessageStatus::Sent),
        ];
        let list = projector().project(&messages, &roster, &HashMap::new());
        assert_eq!(list[0].unread_count, 1);
    }

    #[test]
    fn test_deleted_messages_hidden() {
        let roster = Roster::new();
        let mut deleted = msg("2", "bob", "bob", 2);
        deleted.deleted = Some(Deletion::ForSelf);
        let messages = vec![msg("1", "bob", "bob", 1), deleted];

        let list = projector().project(&messages, &roster, &HashMap::new());
        assert_eq!(list[0].unread_count, 1);
        assert_eq!(list[0].last_message.as_ref().unwrap().id, MessageId::new("1"));
    }

    #[test]
    fn test_removed_group_not_projected() {
        let mut roster = Roster::new();
        roster.upsert_group(ConversationId::new("g1"), "Team", Vec::new());
        roster.remove_group(&ConversationId::new("g1"));
        let messages = vec![msg("1", "g1", "bob", 1)];

        let list = projector().project(&messages, &roster, &HashMap::new());
        assert!(list.is_empty());
    }

    #[test]
    fn test_typing_flag() {
        let roster = Roster::new();
        let messages = vec![msg("1", "bob", "bob", 1)];
        let mut typing = HashMap::new();
        typing.insert(ConversationId::new("bob"), vec![UserId::new("bob")]);

        let list = projector().project(&messages, &roster, &typing);
        assert!(list[0].is_typing);
        assert_eq!(list[0].typing_users, vec![UserId::new("bob")]);
    }

    #[test]
    fn test_preview_truncation_is_char_safe() {
        assert_eq!(truncate_preview("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_preview("short", 10), "short");
        assert_eq!(truncate_preview("🙂🙂🙂", 2), "🙂🙂...");
    }
}
