//! Delivery tracking
//!
//! The [`DeliveryStateMachine`] owns every message once it is ingested and is
//! the only place message status changes.

mod ledger;
mod message;
mod pending;
mod status;

pub use ledger::{
    AckOutcome, DeliveryStateMachine, IncomingOutcome, MarkerOutcome, ReceiptHook, StatusOutcome,
};
pub use message::{Deletion, Message, OutgoingDraft, Payload, Reaction};
pub use status::{FailureReason, MessageStatus, Receipt};
