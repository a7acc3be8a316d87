//! Unified error handling for chantrackd.
//!
//! Per-channel fetch failures are recoverable by design: they are recorded
//! on the channel row and retried under the backoff policy, and must never
//! abort the cycle for other channels. Everything fatal (lock contention,
//! invalid config, a broken database) surfaces through `anyhow` at the
//! binary boundary instead.

use crate::db::DbError;
use crate::storage::StorageError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors from a single bounded fetch attempt against one channel.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The external transport failed; recorded as a failed attempt.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The source returned no messages past the channel's checkpoint.
    #[error("no messages past checkpoint")]
    Empty,

    /// The payload file could not be written; no batch row exists for it.
    #[error("payload storage error: {0}")]
    Storage(#[from] StorageError),

    /// Checkpoint bookkeeping failed; bubbles up, not counted as an attempt.
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

impl FetchError {
    /// Static error code for log labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Empty => "empty_result",
            Self::Storage(_) => "storage_error",
            Self::Db(_) => "db_error",
        }
    }
}
