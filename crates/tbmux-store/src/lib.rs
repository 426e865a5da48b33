//! Durable update log shared by the upstream poller and downstream consumers.

use serde_json::Value;
use thiserror::Error;

mod sqlite;

pub use sqlite::{UpdateStore, UpdateTx};

/// Result type for update store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the update store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where an update entered the log. Recorded for debugging only and never
/// surfaced to downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Delivered by the upstream long poll.
    Upstream,
    /// Synthesised from a downstream send or edit response.
    Local,
}

impl UpdateOrigin {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            UpdateOrigin::Upstream => "upstream",
            UpdateOrigin::Local => "local",
        }
    }
}

/// One row of the update log.
#[derive(Debug, Clone)]
pub struct StoredUpdate {
    /// Log position, unique and strictly increasing across all updates.
    pub local_id: u64,
    /// Bot API update-type key (`message`, `callback_query`, ...).
    pub kind: String,
    /// The JSON value that appeared (or would appear) under that key.
    pub payload: Value,
}
