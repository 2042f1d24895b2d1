//! Courier Core Library
//!
//! End-to-end encrypted messaging core with real-time delivery tracking.
//!
//! ## Overview
//!
//! Courier owns everything between the wire and the UI of a messaging client:
//! device keys, sealing and opening message bodies, the per-message delivery
//! ledger, real-time event routing and the derived conversation list. The
//! transport, REST server and key directory are collaborators behind traits.
//!
//! ## Core Principles
//!
//! - **Server never sees plaintext**: X25519 + XChaCha20-Poly1305, one sealed
//!   copy per recipient
//! - **Optimistic sends**: a message is visible as `sending` before any network
//!   call and reconciled with its server id on acknowledgement
//! - **Replay-safe**: every event handler is idempotent and monotonic
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier_core::{
//!     CachedDirectory, ConversationId, CourierConfig, KeyStore, RedbSecretStore, Session,
//!     UserId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(RedbSecretStore::open("~/.courier/keys.redb")?);
//!     let keys = Arc::new(KeyStore::open(backend, None)?);
//!     let session = Session::new(
//!         UserId::new("alice"),
//!         keys,
//!         Arc::new(my_rest_client()),
//!         Arc::new(CachedDirectory::new(my_directory())),
//!         CourierConfig::default(),
//!     )?;
//!
//!     session.provision_keys()?;
//!     session.send_text(&ConversationId::new("bob"), "hello").await?;
//!
//!     for conversation in session.conversations() {
//!         println!("{} ({} unread)", conversation.name, conversation.unread_count);
//!     }
//!     Ok(())
//! }
//! ```

pub mod collab;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod logging;
pub mod projector;
pub mod roster;
pub mod router;
pub mod session;
pub mod storage;
pub mod types;

// Re-exports
pub use collab::{
    CachedDirectory, ConnectionStatus, ConversationSummary, Directory, OfflineRest, OutgoingEdit,
    OutgoingMessage, RestApi, SealedCopy, StaticDirectory, TransportSignal,
};
pub use config::CourierConfig;
pub use crypto::{CipherEngine, EncryptedEnvelope, NONCE_SIZE};
pub use delivery::{
    AckOutcome, DeliveryStateMachine, Deletion, FailureReason, IncomingOutcome, MarkerOutcome,
    Message, MessageStatus, OutgoingDraft, Payload, Reaction, Receipt, ReceiptHook, StatusOutcome,
};
pub use error::{CourierError, CourierResult};
pub use keys::{decode_public_key, encode_public_key, KeyPair, KeyStore, RotationOutcome, KEY_SIZE};
pub use projector::{Conversation, ConversationProjector};
pub use roster::{ConversationKind, GroupInfo, Roster};
pub use router::{CoreEvent, DispatchOutcome, EventRouter, PresenceStatus, RealtimeEvent, WireMessage};
pub use session::Session;
pub use storage::{MemorySecretStore, RedbSecretStore, SecretStore};
pub use types::*;
