//! Fetch batch records and the atomic checkpoint commit.
//!
//! A batch row's existence is proof of a complete successful fetch. The
//! commit writes the batch row and advances the owning channel's pointers
//! in one transaction; a crash can therefore never leave a pointer
//! advanced without its batch, or a batch without its pointer.

use super::channels::FetchStatus;
use super::DbError;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

/// One committed fetch batch.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub channel_id: i64,
    pub batch_timestamp: i64,
    pub message_file_path: String,
    pub first_message_id: i64,
    pub first_timestamp: i64,
    pub last_message_id: i64,
    pub last_timestamp: i64,
    pub message_count: i64,
    pub processed: bool,
    pub created_dt: i64,
}

impl FromRow<'_, SqliteRow> for FetchBatch {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            channel_id: row.try_get("channel_id")?,
            batch_timestamp: row.try_get("batch_timestamp")?,
            message_file_path: row.try_get("message_file_path")?,
            first_message_id: row.try_get("first_message_id")?,
            first_timestamp: row.try_get("first_timestamp")?,
            last_message_id: row.try_get("last_message_id")?,
            last_timestamp: row.try_get("last_timestamp")?,
            message_count: row.try_get("message_count")?,
            processed: row.try_get("processed")?,
            created_dt: row.try_get("created_dt")?,
        })
    }
}

/// A successful fetch awaiting its atomic commit.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub channel_id: i64,
    pub batch_timestamp: i64,
    pub message_file_path: String,
    pub first_message_id: i64,
    pub first_timestamp: i64,
    pub last_message_id: i64,
    pub last_timestamp: i64,
    pub message_count: i64,
}

/// Result of a checkpoint commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Batch row written and channel pointers advanced.
    Committed,
    /// A batch with this (channel_id, batch_timestamp) already exists;
    /// the commit was a no-op and the channel is untouched. Indicates a
    /// re-run over already completed work, not corruption.
    Duplicate,
}

/// Which channels an operator reset applies to.
#[derive(Debug, Clone, Copy)]
pub enum ResetFilter {
    All,
    Channel(i64),
}

/// Rows touched by an operator reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResetSummary {
    pub batches_deleted: u64,
    pub channels_reset: u64,
}

/// Repository for batch records and checkpoint commits.
pub struct BatchRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BatchRepository<'a> {
    /// Create a new batch repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Durably commit one batch and its channel pointer update.
    ///
    /// An already committed `(channel_id, batch_timestamp)` is recognized
    /// first and reported as a [`CommitOutcome::Duplicate`] no-op: a re-run
    /// over completed work re-presents a batch whose own earlier commit
    /// moved the pointer, and that must not read as a regression. Only a
    /// genuinely new batch is then checked against the checkpoint and
    /// rejected with [`DbError::PointerRegression`] if its first message id
    /// precedes it: pointers only ever move forward, and a violation means
    /// an external-source anomaly or a misconfigured reset, never something
    /// to silently overwrite.
    pub async fn commit(
        &self,
        pending: &PendingBatch,
        now: i64,
    ) -> Result<CommitOutcome, DbError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM channel_fetch_batches WHERE channel_id = ? AND batch_timestamp = ?",
        )
        .bind(pending.channel_id)
        .bind(pending.batch_timestamp)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Ok(CommitOutcome::Duplicate);
        }

        let current: Option<Option<i64>> =
            sqlx::query_scalar("SELECT latest_message_id FROM channels WHERE id = ?")
                .bind(pending.channel_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current_latest = current.ok_or(DbError::ChannelNotFound(pending.channel_id))?;

        if let Some(latest) = current_latest
            && pending.first_message_id < latest
        {
            return Err(DbError::PointerRegression {
                channel_id: pending.channel_id,
                batch_first: pending.first_message_id,
                current_latest: latest,
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO channel_fetch_batches (
                channel_id, batch_timestamp, message_file_path,
                first_message_id, first_timestamp,
                last_message_id, last_timestamp,
                message_count, processed, created_dt
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT (channel_id, batch_timestamp) DO NOTHING
            "#,
        )
        .bind(pending.channel_id)
        .bind(pending.batch_timestamp)
        .bind(&pending.message_file_path)
        .bind(pending.first_message_id)
        .bind(pending.first_timestamp)
        .bind(pending.last_message_id)
        .bind(pending.last_timestamp)
        .bind(pending.message_count)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::Duplicate);
        }

        sqlx::query(
            r#"
            UPDATE channels
            SET latest_message_id = ?,
                latest_message_date = ?,
                earliest_message_id = COALESCE(earliest_message_id, ?),
                earliest_message_date = COALESCE(earliest_message_date, ?),
                fetch_status = ?,
                fetch_attempts = 0,
                update_dt = ?
            WHERE id = ?
            "#,
        )
        .bind(pending.last_message_id)
        .bind(pending.last_timestamp)
        .bind(pending.first_message_id)
        .bind(pending.first_timestamp)
        .bind(FetchStatus::Succeeded.as_str())
        .bind(now)
        .bind(pending.channel_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    /// Flag a batch payload as consumed downstream. The transition is
    /// one-way; an already processed batch is left alone.
    #[allow(dead_code)] // TODO: Call from the payload import pipeline once it exists
    pub async fn mark_processed(
        &self,
        channel_id: i64,
        batch_timestamp: i64,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE channel_fetch_batches
            SET processed = 1
            WHERE channel_id = ? AND batch_timestamp = ? AND processed = 0
            "#,
        )
        .bind(channel_id)
        .bind(batch_timestamp)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recently committed batch for a channel, if any.
    #[allow(dead_code)]
    pub async fn last_committed(&self, channel_id: i64) -> Result<Option<FetchBatch>, DbError> {
        Ok(sqlx::query_as::<_, FetchBatch>(
            r#"
            SELECT channel_id, batch_timestamp, message_file_path,
                   first_message_id, first_timestamp,
                   last_message_id, last_timestamp,
                   message_count, processed, created_dt
            FROM channel_fetch_batches
            WHERE channel_id = ?
            ORDER BY batch_timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(channel_id)
        .fetch_optional(self.pool)
        .await?)
    }

    /// Number of committed batches for a channel.
    #[allow(dead_code)]
    pub async fn count(&self, channel_id: i64) -> Result<u64, DbError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM channel_fetch_batches WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_one(self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Operator disaster-recovery reset.
    ///
    /// Deletes the selected channels' batch rows and nulls their checkpoint
    /// pointers in the same transaction. The two resets are coupled so no
    /// surviving pointer can reference a purged batch. Idempotent; meant to
    /// run while the service is stopped.
    pub async fn reset_channels(
        &self,
        filter: ResetFilter,
        now: i64,
    ) -> Result<ResetSummary, DbError> {
        let mut tx = self.pool.begin().await?;

        let batches_deleted = match filter {
            ResetFilter::All => {
                sqlx::query("DELETE FROM channel_fetch_batches")
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
            ResetFilter::Channel(id) => {
                sqlx::query("DELETE FROM channel_fetch_batches WHERE channel_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
        };

        let reset_sql = r#"
            UPDATE channels
            SET earliest_message_id = NULL,
                earliest_message_date = NULL,
                latest_message_id = NULL,
                latest_message_date = NULL,
                last_attempt_at = NULL,
                fetch_status = 'unattempted',
                fetch_attempts = 0,
                update_dt = ?
        "#;
        let channels_reset = match filter {
            ResetFilter::All => {
                sqlx::query(reset_sql)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
            ResetFilter::Channel(id) => {
                sqlx::query(&format!("{reset_sql} WHERE id = ?"))
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
        };

        tx.commit().await?;
        Ok(ResetSummary {
            batches_deleted,
            channels_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::transport::ChannelInfo;

    async fn setup_with_channel(id: i64) -> Database {
        let db = Database::new(":memory:").await.expect("in-memory db");
        db.channels()
            .refresh(&[ChannelInfo::new(id, "test")], 100)
            .await
            .unwrap();
        db
    }

    fn pending(channel_id: i64, ts: i64, first: i64, last: i64) -> PendingBatch {
        PendingBatch {
            channel_id,
            batch_timestamp: ts,
            message_file_path: format!("messages/{channel_id}/batch_{ts}.json"),
            first_message_id: first,
            first_timestamp: 1_700_000_000 + first,
            last_message_id: last,
            last_timestamp: 1_700_000_000 + last,
            message_count: last - first + 1,
        }
    }

    #[tokio::test]
    async fn first_commit_sets_both_pointers() {
        let db = setup_with_channel(1).await;

        let outcome = db.batches().commit(&pending(1, 1000, 100, 150), 1000).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        let ch = db.channels().find(1).await.unwrap().unwrap();
        assert_eq!(ch.earliest_message_id, Some(100));
        assert_eq!(ch.latest_message_id, Some(150));
        assert_eq!(ch.fetch_status, FetchStatus::Succeeded);
        assert_eq!(ch.fetch_attempts, 0);

        let batch = db.batches().last_committed(1).await.unwrap().unwrap();
        assert_eq!(batch.message_count, 51);
        assert!(!batch.processed);
    }

    #[tokio::test]
    async fn later_commits_only_advance_latest() {
        let db = setup_with_channel(1).await;
        db.batches().commit(&pending(1, 1000, 100, 150), 1000).await.unwrap();
        db.batches().commit(&pending(1, 2000, 151, 200), 2000).await.unwrap();

        let ch = db.channels().find(1).await.unwrap().unwrap();
        assert_eq!(ch.earliest_message_id, Some(100), "earliest is sticky");
        assert_eq!(ch.latest_message_id, Some(200));
        assert_eq!(db.batches().count(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_commit_is_a_noop() {
        let db = setup_with_channel(1).await;
        db.batches().commit(&pending(1, 1000, 100, 150), 1000).await.unwrap();

        // Same (channel_id, batch_timestamp), different content: the second
        // commit must not corrupt the stored row or the channel pointers.
        let outcome = db
            .batches()
            .commit(&pending(1, 1000, 150, 300), 1001)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Duplicate);

        let batch = db.batches().last_committed(1).await.unwrap().unwrap();
        assert_eq!(batch.last_message_id, 150, "original row preserved");
        let ch = db.channels().find(1).await.unwrap().unwrap();
        assert_eq!(ch.latest_message_id, Some(150), "pointer unchanged");
        assert_eq!(db.batches().count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recommitting_identical_batch_is_a_noop() {
        let db = setup_with_channel(1).await;
        let batch = pending(1, 1000, 100, 150);
        db.batches().commit(&batch, 1000).await.unwrap();

        // A re-run re-presents the very batch whose earlier commit advanced
        // the pointer past first_message_id. That is a duplicate, not a
        // regression.
        let outcome = db.batches().commit(&batch, 1001).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Duplicate);

        let ch = db.channels().find(1).await.unwrap().unwrap();
        assert_eq!(ch.latest_message_id, Some(150), "pointer untouched");
        assert_eq!(db.batches().count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pointer_regression_rejected() {
        let db = setup_with_channel(1).await;
        db.batches().commit(&pending(1, 1000, 100, 150), 1000).await.unwrap();

        let err = db
            .batches()
            .commit(&pending(1, 2000, 90, 95), 2000)
            .await
            .unwrap_err();
        match err {
            DbError::PointerRegression {
                channel_id,
                batch_first,
                current_latest,
            } => {
                assert_eq!(channel_id, 1);
                assert_eq!(batch_first, 90);
                assert_eq!(current_latest, 150);
            }
            other => panic!("expected PointerRegression, got {other:?}"),
        }

        // Nothing was written.
        assert_eq!(db.batches().count(1).await.unwrap(), 1);
        let ch = db.channels().find(1).await.unwrap().unwrap();
        assert_eq!(ch.latest_message_id, Some(150));
    }

    #[tokio::test]
    async fn commit_to_unknown_channel_fails() {
        let db = setup_with_channel(1).await;
        let err = db.batches().commit(&pending(99, 1000, 1, 2), 1000).await.unwrap_err();
        assert!(matches!(err, DbError::ChannelNotFound(99)));
    }

    #[tokio::test]
    async fn mark_processed_is_one_way() {
        let db = setup_with_channel(1).await;
        db.batches().commit(&pending(1, 1000, 100, 150), 1000).await.unwrap();

        assert!(db.batches().mark_processed(1, 1000).await.unwrap());
        assert!(
            !db.batches().mark_processed(1, 1000).await.unwrap(),
            "second call finds nothing to do"
        );
        let batch = db.batches().last_committed(1).await.unwrap().unwrap();
        assert!(batch.processed);
    }

    #[tokio::test]
    async fn reset_couples_batch_purge_with_pointer_reset() {
        let db = setup_with_channel(1).await;
        db.channels()
            .refresh(&[ChannelInfo::new(1, "test"), ChannelInfo::new(2, "other")], 150)
            .await
            .unwrap();
        db.batches().commit(&pending(1, 1000, 100, 150), 1000).await.unwrap();
        db.batches().commit(&pending(2, 1000, 10, 20), 1000).await.unwrap();

        let summary = db
            .batches()
            .reset_channels(ResetFilter::Channel(1), 3000)
            .await
            .unwrap();
        assert_eq!(summary.batches_deleted, 1);
        assert_eq!(summary.channels_reset, 1);

        let ch1 = db.channels().find(1).await.unwrap().unwrap();
        assert_eq!(ch1.latest_message_id, None);
        assert_eq!(ch1.fetch_status, FetchStatus::Unattempted);
        assert_eq!(db.batches().count(1).await.unwrap(), 0);

        // Channel 2 untouched.
        assert_eq!(db.batches().count(2).await.unwrap(), 1);
        let ch2 = db.channels().find(2).await.unwrap().unwrap();
        assert_eq!(ch2.latest_message_id, Some(20));

        // Idempotent.
        let summary = db
            .batches()
            .reset_channels(ResetFilter::Channel(1), 3001)
            .await
            .unwrap();
        assert_eq!(summary.batches_deleted, 0);
    }
}
