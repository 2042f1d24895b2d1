//! Message delivery status and its transition rules
//!
//! ```text
//!   sending ──► sent ──► delivered ──► read
//!      │          │
//!      └────┬─────┘
//!           ▼
//!        failed   (terminal)
//! ```
//!
//! Forward jumps are allowed (`sending → read` when a read receipt beats the
//! ack). Nothing ever moves backwards.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

/// Delivery status of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the happy path. `Failed` is off the path.
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is a strict forward step.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (None, _) => false,
            (Some(_), None) => matches!(self, MessageStatus::Sending | MessageStatus::Sent),
            (Some(current), Some(next)) => next > current,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    /// The later of two statuses, or `self` when neither follows the other.
    pub fn furthest(self, other: MessageStatus) -> MessageStatus {
        if self.can_transition_to(other) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Sending => write!(f, "sending"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Read => write!(f, "read"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a message ended up `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The server refused the message
    Rejected,
    /// The recipient's key changed and the resend did not succeed
    StaleRecipientKey,
    /// No local key pair to encrypt with
    NoLocalKey,
    /// Cancelled by the user while still sending
    Cancelled,
    /// Marked failed by an external timeout policy
    TimedOut,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected => write!(f, "rejected"),
            FailureReason::StaleRecipientKey => write!(f, "stale recipient key"),
            FailureReason::NoLocalKey => write!(f, "no local key"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Receipt the transport should send back to a message's author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    Delivered {
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
    },
    Read {
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
    },
}

impl Receipt {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Receipt::Delivered { message_id, .. } | Receipt::Read { message_id, .. } => message_id,
        }
    }
}
