//! Conversation membership: direct peers and groups
//!
//! Removed groups leave a tombstone so late events for them are dropped
//! instead of resurrecting the conversation. Only an authoritative source
//! lifts a tombstone: the server's conversation list during resync, or the
//! local user being added back to the group.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::collab::ConversationSummary;
use crate::types::{ConversationId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub members: BTreeSet<UserId>,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    /// Direct peers and their display names
    peers: HashMap<UserId, String>,
    groups: HashMap<ConversationId, GroupInfo>,
    removed: HashSet<ConversationId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a direct peer, or rename it.
    pub fn upsert_peer(&mut self, user: UserId, name: impl Into<String>) {
        self.peers.insert(user, name.into());
    }

    /// Make sure a direct conversation with `user` exists.
    pub fn ensure_peer(&mut self, user: &UserId) {
        if !self.peers.contains_key(user) {
            self.peers.insert(user.clone(), user.to_string());
        }
    }

    /// Add or replace a group. Ignored for removed groups.
    pub fn upsert_group(
        &mut self,
        id: ConversationId,
        name: impl Into<String>,
        members: impl IntoIterator<Item = UserId>,
    ) -> bool {
        if self.removed.contains(&id) {
            return false;
        }
        self.groups.insert(
            id,
            GroupInfo {
                name: name.into(),
                members: members.into_iter().collect(),
            },
        );
        true
    }

    /// Make sure a group exists, named after its id until an update arrives.
    pub fn ensure_group(&mut self, id: &ConversationId) -> bool {
        if self.removed.contains(id) {
            return false;
        }
        self.groups.entry(id.clone()).or_insert_with(|| GroupInfo {
            name: id.to_string(),
            members: BTreeSet::new(),
        });
        true
    }

    /// Apply a partial group update. Unknown groups are created.
    pub fn update_group(
        &mut self,
        id: &ConversationId,
        name: Option<String>,
        members: Option<Vec<UserId>>,
    ) -> bool {
        if !self.ensure_group(id) {
            return false;
        }
        let Some(group) = self.groups.get_mut(id) else {
            return false;
        };
        if let Some(name) = name {
            group.name = name;
        }
        if let Some(members) = members {
            group.members = members.into_iter().collect();
        }
        true
    }

    pub fn add_member(&mut self, id: &ConversationId, user: UserId) -> bool {
        if !self.ensure_group(id) {
            return false;
        }
        self.groups
            .get_mut(id)
            .is_some_and(|group| group.members.insert(user))
    }

    pub fn remove_member(&mut self, id: &ConversationId, user: &UserId) -> bool {
        self.groups
            .get_mut(id)
            .is_some_and(|group| group.members.remove(user))
    }

    /// Remove a group and tombstone it.
    pub fn remove_group(&mut self, id: &ConversationId) {
        self.groups.remove(id);
        self.removed.insert(id.clone());
    }

    /// Bring back a removed group (or create it). Returns `true` if a
    /// tombstone was lifted.
    pub fn restore_group(&mut self, id: &ConversationId) -> bool {
        let restored = self.removed.remove(id);
        self.ensure_group(id);
        restored
    }

    pub fn is_removed(&self, id: &ConversationId) -> bool {
        self.removed.contains(id)
    }

    pub fn group(&self, id: &ConversationId) -> Option<&GroupInfo> {
        self.groups.get(id)
    }

    pub fn kind_of(&self, id: &ConversationId) -> ConversationKind {
        if self.groups.contains_key(id) {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        }
    }

    /// Group name, peer name, or the raw id as a last resort.
    pub fn display_name(&self, id: &ConversationId) -> String {
        if let Some(group) = self.groups.get(id) {
            return group.name.clone();
        }
        self.peers
            .get(&UserId::new(id.as_str()))
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    /// Every conversation known to the roster.
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.peers
            .keys()
            .map(ConversationId::direct)
            .chain(self.groups.keys().cloned())
            .collect()
    }

    /// Apply a conversation summary fetched during resync.
    pub fn apply_summary(&mut self, summary: &ConversationSummary) -> bool {
        match summary.kind {
            ConversationKind::Direct => {
                self.upsert_peer(UserId::new(summary.id.as_str()), summary.name.clone());
                true
            }
            ConversationKind::Group => {
                self.removed.remove(&summary.id);
                self.upsert_group(
                    summary.id.clone(),
                    summary.name.clone(),
                    summary.members.iter().cloned(),
                )
            }
        }
    }
}
