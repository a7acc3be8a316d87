//! One bounded retrieval unit against one channel.

use crate::db::{Channel, Database, FetchStatus, PendingBatch};
use crate::error::FetchError;
use crate::retry::RetryPolicy;
use crate::storage::MessageStore;
use crate::transport::MessageSource;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

/// Executes single fetch attempts: stamps the attempt, calls the transport,
/// writes the payload file, and hands back a [`PendingBatch`] for the
/// atomic checkpoint commit. Failed attempts leave bookkeeping on the
/// channel row and never produce a batch row or payload file reference.
pub struct BatchFetcher {
    db: Database,
    store: MessageStore,
    source: Arc<dyn MessageSource>,
    policy: RetryPolicy,
    batch_size: u32,
    batch_clock: AtomicI64,
}

impl BatchFetcher {
    pub fn new(
        db: Database,
        store: MessageStore,
        source: Arc<dyn MessageSource>,
        policy: RetryPolicy,
        batch_size: u32,
    ) -> Self {
        Self {
            db,
            store,
            source,
            policy,
            batch_size,
            batch_clock: AtomicI64::new(0),
        }
    }

    /// Batch identity is (channel_id, batch_timestamp); two batches landing
    /// within the same clock second must still get distinct timestamps, so
    /// the allocator never hands out the same value twice in a process.
    fn next_batch_timestamp(&self, now: i64) -> i64 {
        let prev = self
            .batch_clock
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// Execute one fetch attempt against `channel` at `now` (epoch secs).
    ///
    /// The in_progress stamp lands before the transport call so concurrent
    /// readers (and a post-crash restart) can see the attempt. Empty and
    /// transport-failed attempts increment the channel's attempt counter;
    /// the retry policy decides when permanence is reached.
    pub async fn fetch_one(
        &self,
        channel: &Channel,
        now: i64,
    ) -> Result<PendingBatch, FetchError> {
        self.db.channels().mark_in_progress(channel.id, now).await?;

        let offset = channel.next_offset();
        debug!(
            channel_id = channel.id,
            offset,
            batch_size = self.batch_size,
            "Fetching batch"
        );

        let messages = match self
            .source
            .fetch_messages(channel.id, offset, self.batch_size)
            .await
        {
            Ok(messages) if messages.is_empty() => {
                self.record_failure(channel.id, now).await?;
                return Err(FetchError::Empty);
            }
            Ok(messages) => messages,
            Err(e) => {
                self.record_failure(channel.id, now).await?;
                return Err(FetchError::Transport(e));
            }
        };

        // Messages arrive in ascending id order; first/last bound the batch.
        let first = &messages[0];
        let last = &messages[messages.len() - 1];

        let batch_timestamp = self.next_batch_timestamp(now);
        let path = self
            .store
            .write_batch(channel.id, batch_timestamp, &messages)
            .map_err(|e| {
                warn!(channel_id = channel.id, error = %e, "Payload write failed");
                e
            })?;

        Ok(PendingBatch {
            channel_id: channel.id,
            batch_timestamp,
            message_file_path: path.to_string_lossy().into_owned(),
            first_message_id: first.id,
            first_timestamp: first.date,
            last_message_id: last.id,
            last_timestamp: last.date,
            message_count: messages.len() as i64,
        })
    }

    async fn record_failure(&self, channel_id: i64, now: i64) -> Result<(), FetchError> {
        let status = self
            .db
            .channels()
            .record_failure(channel_id, now, &self.policy)
            .await?;
        if status == FetchStatus::FailedPermanently {
            warn!(
                channel_id,
                "Channel exhausted its retry budget; operator reset required"
            );
        }
        Ok(())
    }
}
