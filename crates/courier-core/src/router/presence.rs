//! Presence board
//!
//! Presence is eventually consistent: the most recently *arrived* update for a
//! user wins, whatever timestamp it carries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::events::{PresenceStatus, PresenceUpdate};
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub status: PresenceStatus,
    pub last_seen: Option<i64>,
    /// Arrival order of the update that set this entry
    pub sequence: u64,
}

#[derive(Default)]
pub struct PresenceBoard {
    entries: RwLock<HashMap<UserId, Presence>>,
    arrivals: AtomicU64,
}

impl PresenceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update. Returns `true` if the visible status changed.
    pub fn apply(&self, update: &PresenceUpdate) -> bool {
        let mut entries = self.entries.write();
        let sequence = self.arrivals.fetch_add(1, Ordering::Relaxed) + 1;
        let presence = Presence {
            status: update.status,
            last_seen: update.last_seen,
            sequence,
        };
        let previous = entries.insert(update.user_id.clone(), presence);
        previous.map(|p| p.status) != Some(update.status)
    }

    pub fn get(&self, user: &UserId) -> Option<Presence> {
        self.entries.read().get(user).copied()
    }

    pub fn status_of(&self, user: &UserId) -> PresenceStatus {
        self.get(user)
            .map(|p| p.status)
            .unwrap_or(PresenceStatus::Offline)
    }
}
