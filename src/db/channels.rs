//! Channel registry repository.
//!
//! Source of truth for "what to fetch next". Registry refresh is the only
//! path that creates channel rows; channels absent from a later snapshot
//! are soft-retired via `disappeared`, never deleted, so historical batch
//! joins stay valid.

use super::DbError;
use crate::retry::RetryPolicy;
use crate::transport::ChannelInfo;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

/// Per-channel fetch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Unattempted,
    InProgress,
    Succeeded,
    Failed,
    FailedPermanently,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unattempted => "unattempted",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::FailedPermanently => "failed_permanently",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unattempted" => Some(Self::Unattempted),
            "in_progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "failed_permanently" => Some(Self::FailedPermanently),
            _ => None,
        }
    }
}

/// One tracked channel with its checkpoint pointers.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub operating: bool,
    pub disappeared: bool,
    pub created_dt: i64,
    pub update_dt: Option<i64>,
    pub earliest_message_id: Option<i64>,
    pub earliest_message_date: Option<i64>,
    pub latest_message_id: Option<i64>,
    pub latest_message_date: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub fetch_status: FetchStatus,
    pub fetch_attempts: i64,
    pub priority: i64,
    pub pattern_profile: Option<String>,
    pub usefulness_score: f64,
}

impl Channel {
    /// Offset id for the next fetch: one past the checkpoint, or 0 before
    /// the first committed batch.
    pub fn next_offset(&self) -> i64 {
        self.latest_message_id.unwrap_or(0)
    }
}

impl FromRow<'_, SqliteRow> for Channel {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("fetch_status")?;
        let fetch_status =
            FetchStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "fetch_status".to_string(),
                source: format!("unknown fetch status '{status}'").into(),
            })?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            operating: row.try_get("operating")?,
            disappeared: row.try_get("disappeared")?,
            created_dt: row.try_get("created_dt")?,
            update_dt: row.try_get("update_dt")?,
            earliest_message_id: row.try_get("earliest_message_id")?,
            earliest_message_date: row.try_get("earliest_message_date")?,
            latest_message_id: row.try_get("latest_message_id")?,
            latest_message_date: row.try_get("latest_message_date")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            fetch_status,
            fetch_attempts: row.try_get("fetch_attempts")?,
            priority: row.try_get("priority")?,
            pattern_profile: row.try_get("pattern_profile")?,
            usefulness_score: row.try_get("usefulness_score")?,
        })
    }
}

/// Outcome counts of one registry refresh.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub inserted: u64,
    pub updated: u64,
    pub disappeared: u64,
}

const CHANNEL_COLUMNS: &str = "id, name, operating, disappeared, created_dt, update_dt, \
     earliest_message_id, earliest_message_date, latest_message_id, latest_message_date, \
     last_attempt_at, fetch_status, fetch_attempts, priority, pattern_profile, usefulness_score";

/// Repository for channel operations.
pub struct ChannelRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChannelRepository<'a> {
    /// Create a new channel repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Merge a freshly retrieved external channel list into the registry.
    ///
    /// One transaction: the staging table is rebuilt from the snapshot,
    /// unknown ids are inserted as operating/unattempted, channels present
    /// again (possibly renamed) are un-retired, and known channels absent
    /// from the snapshot are marked disappeared. Nothing is ever deleted.
    pub async fn refresh(
        &self,
        snapshot: &[ChannelInfo],
        now: i64,
    ) -> Result<RefreshSummary, DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM temp_channels")
            .execute(&mut *tx)
            .await?;
        for info in snapshot {
            sqlx::query("INSERT OR REPLACE INTO temp_channels (id, name) VALUES (?, ?)")
                .bind(info.id)
                .bind(&info.name)
                .execute(&mut *tx)
                .await?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO channels (id, name, operating, disappeared, created_dt, fetch_status)
            SELECT t.id, t.name, 1, 0, ?, 'unattempted'
            FROM temp_channels t
            WHERE t.id NOT IN (SELECT id FROM channels)
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let updated = sqlx::query(
            r#"
            UPDATE channels
            SET name = (SELECT t.name FROM temp_channels t WHERE t.id = channels.id),
                disappeared = 0,
                update_dt = ?
            WHERE id IN (SELECT id FROM temp_channels)
              AND (disappeared = 1
                   OR name != (SELECT t.name FROM temp_channels t WHERE t.id = channels.id))
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let disappeared = sqlx::query(
            r#"
            UPDATE channels
            SET disappeared = 1, update_dt = ?
            WHERE disappeared = 0 AND id NOT IN (SELECT id FROM temp_channels)
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(RefreshSummary {
            inserted,
            updated,
            disappeared,
        })
    }

    /// Select up to `limit` channels due for a fetch attempt at `now`.
    ///
    /// Ordering is total (priority, then oldest attempt with NULLs first,
    /// then id) so selection is deterministic for a given table state.
    pub async fn select_next(
        &self,
        policy: &RetryPolicy,
        now: i64,
        limit: usize,
    ) -> Result<Vec<Channel>, DbError> {
        let query = format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            WHERE operating = 1 AND disappeared = 0 AND fetch_status != 'failed_permanently'
            ORDER BY priority ASC, last_attempt_at ASC NULLS FIRST, id ASC
            "#
        );
        let candidates = sqlx::query_as::<_, Channel>(&query)
            .fetch_all(self.pool)
            .await?;

        Ok(candidates
            .into_iter()
            .filter(|c| policy.eligible(c, now))
            .take(limit)
            .collect())
    }

    /// Find a channel by id.
    #[allow(dead_code)] // TODO: Use for a `chantrackd status <id>` subcommand
    pub async fn find(&self, id: i64) -> Result<Option<Channel>, DbError> {
        let query = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?");
        Ok(sqlx::query_as::<_, Channel>(&query)
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    /// Stamp a fetch attempt before calling the transport. The in_progress
    /// status plus the attempt timestamp is visible to concurrent readers
    /// and doubles as the stuck-job signal after a crash.
    pub async fn mark_in_progress(&self, id: i64, now: i64) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE channels
            SET fetch_status = 'in_progress', last_attempt_at = ?, update_dt = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::ChannelNotFound(id));
        }
        Ok(())
    }

    /// Record a failed attempt, transitioning to failed_permanently once
    /// the attempt counter crosses the policy ceiling. Returns the
    /// resulting status.
    pub async fn record_failure(
        &self,
        id: i64,
        now: i64,
        policy: &RetryPolicy,
    ) -> Result<FetchStatus, DbError> {
        let mut tx = self.pool.begin().await?;

        let attempts: Option<i64> =
            sqlx::query_scalar("SELECT fetch_attempts FROM channels WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let attempts = attempts.ok_or(DbError::ChannelNotFound(id))? + 1;

        let status = if policy.is_exhausted(attempts) {
            FetchStatus::FailedPermanently
        } else {
            FetchStatus::Failed
        };

        sqlx::query(
            r#"
            UPDATE channels
            SET fetch_attempts = ?, fetch_status = ?, update_dt = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::db::Database;

    async fn setup() -> Database {
        Database::new(":memory:").await.expect("in-memory db")
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            backoff_base_secs: 60,
            backoff_ceiling_secs: 3600,
            max_attempts: 5,
        })
    }

    fn snapshot(pairs: &[(i64, &str)]) -> Vec<ChannelInfo> {
        pairs
            .iter()
            .map(|(id, name)| ChannelInfo::new(*id, *name))
            .collect()
    }

    #[tokio::test]
    async fn refresh_inserts_then_soft_retires() {
        let db = setup().await;
        let repo = db.channels();

        let summary = repo.refresh(&snapshot(&[(1, "A")]), 100).await.unwrap();
        assert_eq!(summary.inserted, 1);

        // Second refresh adds channel 2, keeps channel 1 untouched.
        let summary = repo
            .refresh(&snapshot(&[(1, "A"), (2, "B")]), 200)
            .await
            .unwrap();
        assert_eq!(
            summary,
            RefreshSummary {
                inserted: 1,
                updated: 0,
                disappeared: 0
            }
        );
        let ch2 = repo.find(2).await.unwrap().unwrap();
        assert_eq!(ch2.fetch_status, FetchStatus::Unattempted);
        assert!(ch2.operating);
        assert!(!ch2.disappeared);

        // Channel 2 vanishes from the snapshot: soft-retired, not deleted.
        let summary = repo.refresh(&snapshot(&[(1, "A")]), 300).await.unwrap();
        assert_eq!(summary.disappeared, 1);
        let ch2 = repo.find(2).await.unwrap().unwrap();
        assert!(ch2.disappeared);
        assert_eq!(ch2.update_dt, Some(300));
    }

    #[tokio::test]
    async fn refresh_undisappears_and_renames() {
        let db = setup().await;
        let repo = db.channels();

        repo.refresh(&snapshot(&[(1, "A")]), 100).await.unwrap();
        repo.refresh(&snapshot(&[]), 200).await.unwrap();
        assert!(repo.find(1).await.unwrap().unwrap().disappeared);

        let summary = repo
            .refresh(&snapshot(&[(1, "A-renamed")]), 300)
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
        let ch = repo.find(1).await.unwrap().unwrap();
        assert!(!ch.disappeared);
        assert_eq!(ch.name, "A-renamed");
    }

    #[tokio::test]
    async fn select_next_orders_by_priority_then_staleness() {
        let db = setup().await;
        let repo = db.channels();
        repo.refresh(&snapshot(&[(1, "A"), (2, "B"), (3, "C")]), 100)
            .await
            .unwrap();

        // Channel 3 is high priority; channel 1 was attempted recently.
        sqlx::query("UPDATE channels SET priority = 10 WHERE id = 3")
            .execute(db.pool())
            .await
            .unwrap();
        repo.mark_in_progress(1, 500).await.unwrap();
        sqlx::query("UPDATE channels SET fetch_status = 'succeeded' WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();

        let selected = repo.select_next(&policy(), 10_000, 10).await.unwrap();
        let ids: Vec<i64> = selected.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 2, 1], "priority first, then NULL attempt, then oldest");
    }

    #[tokio::test]
    async fn select_next_skips_retired_and_backed_off() {
        let db = setup().await;
        let repo = db.channels();
        repo.refresh(&snapshot(&[(1, "A"), (2, "B"), (3, "C")]), 100)
            .await
            .unwrap();

        // Channel 1 disappeared; channel 2 failed 60s ago (backoff 60s).
        repo.refresh(&snapshot(&[(2, "B"), (3, "C")]), 150).await.unwrap();
        repo.mark_in_progress(2, 1000).await.unwrap();
        repo.record_failure(2, 1000, &policy()).await.unwrap();

        let selected = repo.select_next(&policy(), 1030, 10).await.unwrap();
        let ids: Vec<i64> = selected.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3], "1 is retired, 2 still backing off");

        let selected = repo.select_next(&policy(), 1060, 10).await.unwrap();
        let ids: Vec<i64> = selected.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 2], "2 eligible once backoff(1) elapsed");
    }

    #[tokio::test]
    async fn record_failure_escalates_to_permanent() {
        let db = setup().await;
        let repo = db.channels();
        repo.refresh(&snapshot(&[(1, "A")]), 100).await.unwrap();
        let p = policy();

        for attempt in 1..=4 {
            let status = repo.record_failure(1, 1000 + attempt, &p).await.unwrap();
            assert_eq!(status, FetchStatus::Failed, "attempt {attempt}");
        }
        let status = repo.record_failure(1, 2000, &p).await.unwrap();
        assert_eq!(status, FetchStatus::FailedPermanently);

        // Never selected again, no matter how much time passes.
        let selected = repo.select_next(&p, i64::MAX, 10).await.unwrap();
        assert!(selected.is_empty());
    }
}
