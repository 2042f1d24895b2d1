//! Bookkeeping for events that outran their message
//!
//! The transport may deliver a status, edit, deletion or reaction before the
//! `message.new` it refers to. Those are kept in a [`Pending`] entry until the
//! message arrives. Both this and the index of purged message ids live in a
//! [`Bounded`] map so neither grows without limit.

use std::collections::{HashMap, VecDeque};

use super::message::{Deletion, Message, Payload, Reaction};
use super::status::{FailureReason, MessageStatus};
use crate::types::{ConversationId, MessageId};

/// Everything known about a message before it arrived.
#[derive(Debug, Clone, Default)]
pub(super) struct Pending {
    /// Conversation named by the event, if it carried one
    pub conversation_id: Option<ConversationId>,
    pub status: Option<MessageStatus>,
    pub edit: Option<(Payload, i64)>,
    pub deletion: Option<Deletion>,
    pub reactions: Option<Vec<Reaction>>,
}

impl Pending {
    pub fn park_status(&mut self, status: MessageStatus) {
        self.status = Some(match self.status {
            Some(parked) => parked.furthest(status),
            None => status,
        });
    }

    pub fn park_edit(&mut self, payload: Payload, edited_at: i64) {
        if self.edit.as_ref().is_some_and(|(_, at)| *at >= edited_at) {
            return;
        }
        self.edit = Some((payload, edited_at));
    }

    pub fn park_deletion(&mut self, deletion: Deletion) {
        self.deletion = merged_deletion(self.deletion, deletion).or(self.deletion);
    }

    /// Fold the parked events into the message that just arrived.
    pub fn apply_to(self, message: &mut Message) {
        if let Some(status) = self.status {
            advance_status(message, status);
        }
        if let Some(deletion) = self.deletion {
            delete_message(message, deletion);
        }
        if let Some((payload, edited_at)) = self.edit {
            edit_message(message, payload, edited_at);
        }
        if let Some(reactions) = self.reactions {
            message.reactions = reactions;
        }
    }
}

/// Move `message` forward to `status` if that is a forward step.
pub(super) fn advance_status(message: &mut Message, status: MessageStatus) -> bool {
    if !message.status.can_transition_to(status) {
        return false;
    }
    message.status = status;
    settle_failure(message);
    true
}

/// A failed message always carries a reason; `Rejected` unless one is known.
pub(super) fn settle_failure(message: &mut Message) {
    if message.status == MessageStatus::Failed && message.failure.is_none() {
        message.failure = Some(FailureReason::Rejected);
    }
}

/// Replace the content unless deleted for everyone or the edit is older.
pub(super) fn edit_message(message: &mut Message, payload: Payload, edited_at: i64) -> bool {
    if message.deleted == Some(Deletion::ForEveryone) {
        return false;
    }
    if message.edited_at.is_some_and(|prev| prev >= edited_at) {
        return false;
    }
    message.payload = payload;
    message.edited_at = Some(edited_at);
    true
}

pub(super) fn delete_message(message: &mut Message, deletion: Deletion) -> bool {
    match merged_deletion(message.deleted, deletion) {
        Some(next) => {
            message.deleted = Some(next);
            true
        }
        None => false,
    }
}

/// `ForEveryone` supersedes `ForSelf`, never the other way round.
fn merged_deletion(current: Option<Deletion>, next: Deletion) -> Option<Deletion> {
    match (current, next) {
        (None, _) | (Some(Deletion::ForSelf), Deletion::ForEveryone) => Some(next),
        _ => None,
    }
}

/// Map keyed by message id that evicts its oldest entries once `capacity`
/// is reached.
pub(super) struct Bounded<V> {
    capacity: usize,
    next_seq: u64,
    entries: HashMap<MessageId, (u64, V)>,
    /// Insertion order; may hold stale pairs for removed or replaced ids
    order: VecDeque<(u64, MessageId)>,
}

impl<V> Bounded<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&V> {
        self.entries.get(id).map(|(_, value)| value)
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<V> {
        let removed = self.entries.remove(id).map(|(_, value)| value);
        self.compact();
        removed
    }

    /// Insert or replace. Returns the number of entries evicted to make room.
    pub fn insert(&mut self, id: MessageId, value: V) -> usize {
        let evicted = if self.entries.contains_key(&id) {
            0
        } else {
            self.make_room()
        };
        self.next_seq += 1;
        self.order.push_back((self.next_seq, id.clone()));
        self.entries.insert(id, (self.next_seq, value));
        evicted
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&V) -> bool) {
        self.entries.retain(|_, (_, value)| keep(value));
        self.compact();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn make_room(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() >= self.capacity {
            let Some((seq, id)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&id).is_some_and(|(current, _)| *current == seq) {
                self.entries.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop stale order pairs once they outnumber live entries.
    fn compact(&mut self) {
        if self.order.len() <= self.capacity.saturating_mul(2) {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(seq, id)| entries.get(id).is_some_and(|(current, _)| current == seq));
    }
}

impl<V: Default> Bounded<V> {
    /// The entry for `id`, created empty if missing. Returns the number of
    /// entries evicted to make room.
    pub fn entry(&mut self, id: &MessageId) -> (&mut V, usize) {
        let evicted = if self.entries.contains_key(id) {
            0
        } else {
            let evicted = self.make_room();
            self.next_seq += 1;
            self.order.push_back((self.next_seq, id.clone()));
            self.entries
                .insert(id.clone(), (self.next_seq, V::default()));
            evicted
        };
        let value = &mut self
            .entries
            .entry(id.clone())
            .or_insert_with(|| (0, V::default()))
            .1;
        (value, evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> MessageId {
        MessageId::new(format!("m{}", n))
    }

    #[test]
    fn test_bounded_evicts_oldest() {
        let mut map = Bounded::new(3);
        for n in 0..3 {
            assert_eq!(map.insert(id(n), n), 0);
        }
        assert_eq!(map.insert(id(3), 3), 1);
        assert_eq!(map.len(), 3);
        assert!(map.get(&id(0)).is_none());
        assert_eq!(map.get(&id(3)), Some(&3));
    }

    #[test]
    fn test_bounded_reinsert_refreshes_position() {
        let mut map = Bounded::new(2);
        map.insert(id(0), 0);
        map.insert(id(1), 1);
        map.remove(&id(0));
        map.insert(id(0), 10);
        map.insert(id(2), 2);

        // m1 is now the oldest live entry
        assert!(map.get(&id(1)).is_none());
        assert_eq!(map.get(&id(0)), Some(&10));
        assert_eq!(map.get(&id(2)), Some(&2));
    }

    #[test]
    fn test_bounded_order_stays_compact() {
        let mut map: Bounded<usize> = Bounded::new(4);
        for n in 0..100 {
            map.insert(id(n), n);
            map.remove(&id(n));
        }
        assert_eq!(map.len(), 0);
        assert!(map.order.len() <= 8);
    }

    #[test]
    fn test_pending_keeps_furthest_status_and_latest_edit() {
        let mut pending = Pending::default();
        pending.park_status(MessageStatus::Read);
        pending.park_status(MessageStatus::Delivered);
        pending.park_edit(Payload::Text("v2".into()), 20);
        pending.park_edit(Payload::Text("v1".into()), 10);
        pending.park_deletion(Deletion::ForEveryone);
        pending.park_deletion(Deletion::ForSelf);

        assert_eq!(pending.status, Some(MessageStatus::Read));
        assert_eq!(pending.edit, Some((Payload::Text("v2".into()), 20)));
        assert_eq!(pending.deletion, Some(Deletion::ForEveryone));
    }
}
