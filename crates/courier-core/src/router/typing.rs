//! Typing indicators with per-entry expiry
//!
//! Each `(conversation, user)` entry carries its own deadline and its own
//! sleeping expiry task. Refreshing an entry bumps its generation, so a stale
//! expiry task wakes up, sees a newer generation and leaves the entry alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use super::CoreEvent;
use crate::types::{ConversationId, UserId};

#[derive(Debug, Clone, Copy)]
struct TypingEntry {
    generation: u64,
    deadline: Instant,
}

type TypingKey = (ConversationId, UserId);

pub struct TypingTracker {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<TypingKey, TypingEntry>>>,
    generation: AtomicU64,
    events: broadcast::Sender<CoreEvent>,
}

impl TypingTracker {
    pub fn new(ttl: Duration, events: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Start or stop a typing indicator.
    ///
    /// Must be called from within a tokio runtime: starting an indicator
    /// schedules its expiry.
    pub fn set_typing(&self, conversation_id: ConversationId, user_id: UserId, is_typing: bool) {
        let key = (conversation_id, user_id);

        if !is_typing {
            let removed = self.entries.lock().remove(&key).is_some();
            if removed {
                self.notify(key, false);
            }
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = Instant::now() + self.ttl;
        let was_typing = self
            .entries
            .lock()
            .insert(key.clone(), TypingEntry { generation, deadline })
            .is_some();

        if !was_typing {
            self.notify(key.clone(), true);
        }

        let entries = Arc::clone(&self.entries);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let expired = {
                let mut entries = entries.lock();
                match entries.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                trace!(conversation = %key.0, user = %key.1, "Typing indicator expired");
                let _ = events.send(CoreEvent::TypingChanged {
                    conversation_id: key.0,
                    user_id: key.1,
                    is_typing: false,
                });
            }
        });
    }

    /// Users currently typing in a conversation, sorted.
    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let now = Instant::now();
        let mut users: Vec<UserId> = self
            .entries
            .lock()
            .iter()
            .filter(|((conv, _), entry)| conv == conversation_id && entry.deadline > now)
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Every live indicator, grouped by conversation.
    pub fn snapshot(&self) -> HashMap<ConversationId, Vec<UserId>> {
        let now = Instant::now();
        let mut by_conversation: HashMap<ConversationId, Vec<UserId>> = HashMap::new();
        for ((conv, user), entry) in self.entries.lock().iter() {
            if entry.deadline > now {
                by_conversation
                    .entry(conv.clone())
                    .or_default()
                    .push(user.clone());
            }
        }
        for users in by_conversation.values_mut() {
            users.sort();
        }
        by_conversation
    }

    /// Drop every indicator of a conversation without notifying.
    pub fn clear_conversation(&self, conversation_id: &ConversationId) {
        self.entries
            .lock()
            .retain(|(conv, _), _| conv != conversation_id);
    }

    fn notify(&self, key: TypingKey, is_typing: bool) {
        let _ = self.events.send(CoreEvent::TypingChanged {
            conversation_id: key.0,
            user_id: key.1,
            is_typing,
        });
    }
}
