//! Transport seam to the external message source.
//!
//! The wire protocol of the external source is out of scope here; the real
//! client lives behind [`MessageSource`] so the tracker, fetcher, and tests
//! all talk to the same trait.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// One (id, name) pair from the external channel list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: i64,
    pub name: String,
}

impl ChannelInfo {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// One raw message as retrieved from the external source.
#[derive(Debug, Clone, Serialize)]
pub struct RawMessage {
    /// Source-assigned message id, strictly increasing within a channel.
    pub id: i64,
    /// Message timestamp, epoch seconds UTC.
    pub date: i64,
    pub text: Option<String>,
    pub sender_id: Option<i64>,
    pub is_service_message: bool,
}

/// Transport failures. All recoverable per-channel; the retry policy
/// decides when the channel is attempted again. Which variants actually
/// occur depends on the transport client behind [`MessageSource`].
#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("channel {0} not accessible")]
    ChannelInaccessible(i64),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// External message source.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Retrieve the current full channel list.
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError>;

    /// Retrieve up to `limit` messages with id strictly greater than
    /// `offset_id`, in ascending id order.
    async fn fetch_messages(
        &self,
        channel_id: i64,
        offset_id: i64,
        limit: u32,
    ) -> Result<Vec<RawMessage>, TransportError>;
}

/// Placeholder source wired by the binary when no real transport is
/// configured. Every call fails with [`TransportError::Unavailable`], which
/// the role loops record and log like any other transport outage.
pub struct NullSource;

#[async_trait]
impl MessageSource for NullSource {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError> {
        Err(TransportError::Unavailable(
            "no transport configured".to_string(),
        ))
    }

    async fn fetch_messages(
        &self,
        _channel_id: i64,
        _offset_id: i64,
        _limit: u32,
    ) -> Result<Vec<RawMessage>, TransportError> {
        Err(TransportError::Unavailable(
            "no transport configured".to_string(),
        ))
    }
}
