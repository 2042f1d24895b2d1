//! Runtime configuration for the Courier core.
//!
//! Every field has a default so a partial (or missing) config file is valid.
//!
//! ```json
//! { "typing_ttl_ms": 4000, "key_history_limit": 8 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, CourierResult};

/// Default lifetime of a typing indicator without a refresh.
pub const DEFAULT_TYPING_TTL_MS: u64 = 5_000;

/// Default number of characters shown in a conversation preview.
pub const DEFAULT_PREVIEW_CHARS: usize = 100;

/// Default page size for history fetches and resync.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Default capacity for the core event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default number of events parked for messages that have not arrived.
pub const DEFAULT_PARKED_LIMIT: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// How long a typing indicator stays visible without a refresh
    pub typing_ttl_ms: u64,
    /// Maximum number of superseded key pairs kept for decryption.
    /// `None` keeps every rotation.
    pub key_history_limit: Option<usize>,
    /// Characters of the last message shown in a conversation preview
    pub preview_chars: usize,
    /// Messages fetched per page (pagination and resync)
    pub page_size: usize,
    /// Capacity of the [`CoreEvent`](crate::router::CoreEvent) broadcast channel
    pub event_channel_capacity: usize,
    /// Status and marker events kept for messages that have not arrived yet;
    /// the oldest are evicted first. Also bounds the ids remembered from
    /// removed conversations.
    pub parked_limit: usize,
    /// File name of the key database inside the data directory
    pub key_db_file: String,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            typing_ttl_ms: DEFAULT_TYPING_TTL_MS,
            key_history_limit: None,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            page_size: DEFAULT_PAGE_SIZE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            parked_limit: DEFAULT_PARKED_LIMIT,
            key_db_file: "keys.redb".to_string(),
        }
    }
}

impl CourierConfig {
    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> CourierResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CourierError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json_str(raw: &str) -> CourierResult<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| CourierError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot operate with.
    pub fn validate(&self) -> CourierResult<()> {
        if self.typing_ttl_ms == 0 {
            return Err(CourierError::Config("typing_ttl_ms must be > 0".into()));
        }
        if self.page_size == 0 {
            return Err(CourierError::Config("page_size must be > 0".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(CourierError::Config(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        if self.parked_limit == 0 {
            return Err(CourierError::Config("parked_limit must be > 0".into()));
        }
        Ok(())
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }
}
