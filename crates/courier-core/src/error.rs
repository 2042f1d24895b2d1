//! Error types for Courier

use thiserror::Error;

/// Main error type for Courier core operations
#[derive(Error, Debug)]
pub enum CourierError {
    /// No key pair has been provisioned on this device yet
    #[error("No local key pair provisioned")]
    NoLocalKey,

    /// Authentication failed against every candidate key.
    ///
    /// Carries no detail: wrong key and tampered ciphertext look identical.
    #[error("Message could not be decrypted")]
    DecryptionFailed,

    /// The directory handed out a recipient key that has since been rotated
    #[error("Recipient key is stale: {0}")]
    StaleRecipientKey(String),

    /// The operating system RNG could not be read
    #[error("Random number generator unavailable: {0}")]
    RngUnavailable(String),

    /// Message was not found in the delivery ledger
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Conversation is unknown or has been removed
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    /// Requested status change is not allowed from the current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A known real-time event carried a payload that does not parse
    #[error("Malformed event '{event}': {reason}")]
    MalformedEvent { event: String, reason: String },

    /// REST collaborator failure
    #[error("REST error: {0}")]
    Rest(String),

    /// Directory collaborator failure
    #[error("Directory error: {0}")]
    Directory(String),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed for a reason other than authentication
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Whether the caller may retry the operation that produced this error.
    ///
    /// Only a stale recipient key is retryable; a decryption failure can
    /// never resolve itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CourierError::StaleRecipientKey(_))
    }
}

/// Result type alias using CourierError
pub type CourierResult<T> = Result<T, CourierError>;
