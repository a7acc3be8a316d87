//! Periodic driver for both roles.
//!
//! A cooperative single-threaded loop with explicit suspension points (the
//! registry refresh call, each channel's fetch, the inter-channel pause,
//! and the inter-cycle sleep) so cancellation and crash-recovery points
//! are enumerable. Shutdown is observed at every suspension point; an
//! in-flight fetch either commits or is abandoned with the channel left
//! in_progress for next-startup reconciliation.

use crate::config::Config;
use crate::db::{Database, DbError};
use crate::error::FetchError;
use crate::fetcher::BatchFetcher;
use crate::retry::RetryPolicy;
use crate::storage::MessageStore;
use crate::transport::MessageSource;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler phases. Stopped is reached only through shutdown or the
/// invocation batch cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Refreshing,
    FetchCycle,
    Sleeping,
    Stopped,
}

/// Drives registry refresh and fetch cycles against one database.
pub struct SyncScheduler {
    db: Database,
    source: Arc<dyn MessageSource>,
    config: Arc<Config>,
    policy: RetryPolicy,
    fetcher: BatchFetcher,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    pub fn new(
        db: Database,
        source: Arc<dyn MessageSource>,
        config: Arc<Config>,
        shutdown: CancellationToken,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        let fetcher = BatchFetcher::new(
            db.clone(),
            MessageStore::new(config.storage.base_dir.clone()),
            Arc::clone(&source),
            policy,
            config.fetcher.batch_size,
        );
        Self {
            db,
            source,
            config,
            policy,
            fetcher,
            shutdown,
        }
    }

    /// Tracker role: periodically pull the external channel list and merge
    /// it into the registry. Transport failures are logged and retried on
    /// the next interval.
    pub async fn run_tracker(&self) -> Result<(), DbError> {
        let interval = Duration::from_secs(self.config.tracker.refresh_interval_secs);
        info!(interval_secs = interval.as_secs(), "Tracker started");

        loop {
            self.refresh_registry().await?;
            if self.interruptible_sleep(interval).await {
                break;
            }
        }

        info!("Tracker stopped");
        Ok(())
    }

    /// Fetcher role: repeated fetch cycles over the eligible channel set.
    ///
    /// `max_batches` bounds the number of batches committed by this
    /// invocation (0 = unlimited); reaching the bound stops the loop
    /// cleanly after the current commit.
    pub async fn run_fetcher(&self, max_batches: u64) -> Result<(), DbError> {
        info!(max_batches, "Fetcher started");

        let refresh_every = Duration::from_secs(self.config.fetcher.channel_refresh_secs);
        let sleep_between = Duration::from_secs(self.config.fetcher.sleep_secs);
        let pause_between = Duration::from_secs(self.config.fetcher.pause_secs);

        let mut state = SchedulerState::Idle;
        let mut last_refresh: Option<Instant> = None;
        let mut total_committed: u64 = 0;

        while state != SchedulerState::Stopped {
            let next = match state {
                SchedulerState::Idle => SchedulerState::Refreshing,

                SchedulerState::Refreshing => {
                    self.refresh_registry().await?;
                    last_refresh = Some(Instant::now());
                    if self.shutdown.is_cancelled() {
                        SchedulerState::Stopped
                    } else {
                        SchedulerState::FetchCycle
                    }
                }

                SchedulerState::FetchCycle => {
                    let committed = self
                        .fetch_cycle(max_batches, &mut total_committed, pause_between)
                        .await?;
                    if self.shutdown.is_cancelled()
                        || (max_batches > 0 && total_committed >= max_batches)
                    {
                        SchedulerState::Stopped
                    } else {
                        debug!(committed, total_committed, "Fetch cycle finished");
                        SchedulerState::Sleeping
                    }
                }

                SchedulerState::Sleeping => {
                    if self.interruptible_sleep(sleep_between).await {
                        SchedulerState::Stopped
                    } else if last_refresh.is_none_or(|t| t.elapsed() >= refresh_every) {
                        SchedulerState::Refreshing
                    } else {
                        SchedulerState::FetchCycle
                    }
                }

                SchedulerState::Stopped => SchedulerState::Stopped,
            };

            if next != state {
                debug!(from = ?state, to = ?next, "Scheduler transition");
            }
            state = next;
        }

        info!(total_committed, "Fetcher stopped");
        Ok(())
    }

    /// One pass over the eligible channels. Per-channel failures are
    /// isolated: they are recorded on the channel row and never abort the
    /// cycle for the others. Returns the number of batches committed.
    async fn fetch_cycle(
        &self,
        max_batches: u64,
        total_committed: &mut u64,
        pause_between: Duration,
    ) -> Result<u64, DbError> {
        let now = chrono::Utc::now().timestamp();
        let selected = self
            .db
            .channels()
            .select_next(
                &self.policy,
                now,
                self.config.fetcher.max_batches_per_cycle as usize,
            )
            .await?;
        debug!(selected = selected.len(), "Selected channels for cycle");

        let mut committed_this_cycle = 0u64;
        for channel in &selected {
            if self.shutdown.is_cancelled() {
                break;
            }
            if max_batches > 0 && *total_committed >= max_batches {
                info!(max_batches, "Invocation batch cap reached");
                break;
            }

            let now = chrono::Utc::now().timestamp();
            match self.fetcher.fetch_one(channel, now).await {
                Ok(pending) => match self.db.batches().commit(&pending, now).await {
                    Ok(crate::db::CommitOutcome::Committed) => {
                        committed_this_cycle += 1;
                        *total_committed += 1;
                        info!(
                            channel_id = channel.id,
                            first = pending.first_message_id,
                            last = pending.last_message_id,
                            count = pending.message_count,
                            "Committed batch"
                        );
                    }
                    Ok(crate::db::CommitOutcome::Duplicate) => {
                        warn!(
                            channel_id = channel.id,
                            batch_timestamp = pending.batch_timestamp,
                            "Batch already committed; skipping"
                        );
                    }
                    Err(DbError::PointerRegression {
                        channel_id,
                        batch_first,
                        current_latest,
                    }) => {
                        warn!(
                            channel_id,
                            batch_first,
                            current_latest,
                            "Pointer regression rejected; data-integrity review needed"
                        );
                    }
                    Err(e) => return Err(e),
                },
                Err(FetchError::Empty) => {
                    debug!(channel_id = channel.id, "No messages past checkpoint");
                }
                Err(FetchError::Db(e)) => return Err(e),
                Err(e) => {
                    warn!(
                        channel_id = channel.id,
                        error_code = e.error_code(),
                        error = %e,
                        "Fetch attempt failed"
                    );
                }
            }

            if self.interruptible_sleep(pause_between).await {
                break;
            }
        }

        Ok(committed_this_cycle)
    }

    /// Pull the channel list and merge it; a transport outage is logged
    /// and leaves the existing registry in place.
    async fn refresh_registry(&self) -> Result<(), DbError> {
        match self.source.list_channels().await {
            Ok(snapshot) => {
                let now = chrono::Utc::now().timestamp();
                let summary = self.db.channels().refresh(&snapshot, now).await?;
                info!(
                    snapshot = snapshot.len(),
                    inserted = summary.inserted,
                    updated = summary.updated,
                    disappeared = summary.disappeared,
                    "Registry refreshed"
                );
            }
            Err(e) => {
                warn!(error = %e, "Channel list retrieval failed; keeping existing registry");
            }
        }
        Ok(())
    }

    /// Sleep for `duration`, returning true if shutdown was requested.
    async fn interruptible_sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
