//! Database operations for Redcast

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::Result;
use crate::types::{
    ActivityRecord, CampaignPost, ContentKind, Credential, PostStatus, SyncedPost, UsageWindow,
};

/// Per-status post counts for a campaign or the whole table.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusCounts {
    pub scheduled: i64,
    pub processing: i64,
    pub posted: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.scheduled + self.processing + self.posted + self.failed
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::error::DbError::IoError)?;
        }

        // Use forward slashes for the SQLite URL and mode=rwc so the file is
        // created on first run.
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(crate::error::DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // credentials
    // ------------------------------------------------------------------

    pub async fn insert_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials
                (id, username, access_token, refresh_token, token_expires_at,
                 active, last_used_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.username)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.token_expires_at)
        .bind(credential.active as i64)
        .bind(credential.last_used_at)
        .bind(credential.last_synced_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_credential(&self, id: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, access_token, refresh_token, token_expires_at,
                   active, last_used_at, last_synced_at
            FROM credentials WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.map(|r| credential_from_row(&r)))
    }

    /// Active credentials ordered for selection: never-used first, then
    /// oldest `last_used_at` first.
    pub async fn list_active_credentials(&self) -> Result<Vec<Credential>> {
        let rows = sqlx::query(
            r#"
            SELECT id, username, access_token, refresh_token, token_expires_at,
                   active, last_used_at, last_synced_at
            FROM credentials
            WHERE active = 1
            ORDER BY last_used_at IS NOT NULL, last_used_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows.iter().map(credential_from_row).collect())
    }

    /// Persist a freshly refreshed access token and its new expiry.
    pub async fn update_credential_token(
        &self,
        id: &str,
        access_token: &str,
        token_expires_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = ?, token_expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(token_expires_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Drop the stored access token after a failed refresh so the credential
    /// is re-evaluated from scratch on its next use.
    pub async fn clear_credential_token(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = NULL, token_expires_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn touch_credential_last_used(&self, id: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE credentials SET last_used_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn touch_credential_last_synced(&self, id: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE credentials SET last_synced_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // usage windows
    // ------------------------------------------------------------------

    /// Atomic insert-or-increment for the durable request counter.
    ///
    /// This is the cross-process side of the rate tracker; multiple service
    /// instances sharing a credential pool all land on the same row.
    pub async fn increment_usage_window(
        &self,
        credential_id: &str,
        window_start: i64,
        endpoint: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_windows
                (credential_id, window_start, request_count, last_request_at, last_endpoint)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(credential_id, window_start)
            DO UPDATE SET
                request_count = request_count + 1,
                last_request_at = excluded.last_request_at,
                last_endpoint = excluded.last_endpoint
            "#,
        )
        .bind(credential_id)
        .bind(window_start)
        .bind(now)
        .bind(endpoint)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_usage_window(
        &self,
        credential_id: &str,
        window_start: i64,
    ) -> Result<Option<UsageWindow>> {
        let row = sqlx::query(
            r#"
            SELECT credential_id, window_start, request_count, last_request_at, last_endpoint
            FROM usage_windows
            WHERE credential_id = ? AND window_start = ?
            "#,
        )
        .bind(credential_id)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.map(|r| UsageWindow {
            credential_id: r.get("credential_id"),
            window_start: r.get("window_start"),
            request_count: r.get("request_count"),
            last_request_at: r.get("last_request_at"),
            last_endpoint: r.get("last_endpoint"),
        }))
    }

    pub async fn usage_window_count(
        &self,
        credential_id: &str,
        window_start: i64,
    ) -> Result<i64> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            r#"
            SELECT request_count FROM usage_windows
            WHERE credential_id = ? AND window_start = ?
            "#,
        )
        .bind(credential_id)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.and_then(|r| r.0).unwrap_or(0))
    }

    /// Request counts for every credential in a given window, used by the
    /// selector as its tie-breaker.
    pub async fn usage_counts_for_window(
        &self,
        window_start: i64,
    ) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT credential_id, request_count FROM usage_windows
            WHERE window_start = ?
            "#,
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| (r.get("credential_id"), r.get("request_count")))
            .collect())
    }

    // ------------------------------------------------------------------
    // campaign posts
    // ------------------------------------------------------------------

    pub async fn insert_campaign_post(&self, post: &CampaignPost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO campaign_posts
                (id, campaign_id, credential_id, subreddit, title, content_kind,
                 body, media_url, status, scheduled_for, processing_started_at,
                 posted_at, execution_time_ms, reddit_post_id, reddit_permalink,
                 last_error, interval_hours, parent_post_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.campaign_id)
        .bind(&post.credential_id)
        .bind(&post.subreddit)
        .bind(&post.title)
        .bind(post.content_kind.as_str())
        .bind(&post.body)
        .bind(&post.media_url)
        .bind(post.status.as_str())
        .bind(post.scheduled_for)
        .bind(post.processing_started_at)
        .bind(post.posted_at)
        .bind(post.execution_time_ms)
        .bind(&post.reddit_post_id)
        .bind(&post.reddit_permalink)
        .bind(&post.last_error)
        .bind(post.interval_hours)
        .bind(&post.parent_post_id)
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_campaign_post(&self, id: &str) -> Result<Option<CampaignPost>> {
        let row = sqlx::query("SELECT * FROM campaign_posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.map(|r| campaign_post_from_row(&r)))
    }

    /// Scheduled posts whose time has come, oldest first.
    ///
    /// Ascending `scheduled_for` keeps long-overdue posts ahead of the queue;
    /// recurrence does not depend on this ordering.
    pub async fn due_campaign_posts(&self, now: i64) -> Result<Vec<CampaignPost>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM campaign_posts
            WHERE status = 'scheduled' AND scheduled_for <= ?
            ORDER BY scheduled_for ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows.iter().map(campaign_post_from_row).collect())
    }

    /// Claim a due post by moving it to `processing`.
    ///
    /// The conditional UPDATE is the exclusivity gate: it succeeds for exactly
    /// one caller per scheduled row. Returns `false` when the row was already
    /// claimed (or no longer scheduled).
    pub async fn claim_campaign_post(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_posts
            SET status = 'processing', processing_started_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_campaign_post_posted(
        &self,
        id: &str,
        posted_at: i64,
        execution_time_ms: i64,
        reddit_post_id: &str,
        reddit_permalink: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_posts
            SET status = 'posted', posted_at = ?, execution_time_ms = ?,
                reddit_post_id = ?, reddit_permalink = ?, last_error = NULL
            WHERE id = ?
            "#,
        )
        .bind(posted_at)
        .bind(execution_time_ms)
        .bind(reddit_post_id)
        .bind(reddit_permalink)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn mark_campaign_post_failed(
        &self,
        id: &str,
        posted_at: i64,
        execution_time_ms: i64,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_posts
            SET status = 'failed', posted_at = ?, execution_time_ms = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(posted_at)
        .bind(execution_time_ms)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Next scheduled posts regardless of due time, soonest first.
    pub async fn upcoming_campaign_posts(&self, limit: i64) -> Result<Vec<CampaignPost>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM campaign_posts
            WHERE status = 'scheduled'
            ORDER BY scheduled_for ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows.iter().map(campaign_post_from_row).collect())
    }

    /// Post counts by status, optionally restricted to one campaign.
    pub async fn campaign_status_counts(
        &self,
        campaign_id: Option<&str>,
    ) -> Result<StatusCounts> {
        let rows = if let Some(campaign) = campaign_id {
            sqlx::query(
                r#"
                SELECT status, COUNT(*) AS n FROM campaign_posts
                WHERE campaign_id = ?
                GROUP BY status
                "#,
            )
            .bind(campaign)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query("SELECT status, COUNT(*) AS n FROM campaign_posts GROUP BY status")
                .fetch_all(&self.pool)
                .await
        }
        .map_err(crate::error::DbError::SqlxError)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let n: i64 = row.get("n");
            match PostStatus::parse(&row.get::<String, _>("status")) {
                Some(PostStatus::Scheduled) => counts.scheduled = n,
                Some(PostStatus::Processing) => counts.processing = n,
                Some(PostStatus::Posted) => counts.posted = n,
                Some(PostStatus::Failed) => counts.failed = n,
                None => {}
            }
        }

        Ok(counts)
    }

    // ------------------------------------------------------------------
    // activity records
    // ------------------------------------------------------------------

    pub async fn append_activity(&self, record: &ActivityRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_records (campaign_id, post_id, action, details, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.campaign_id)
        .bind(&record.post_id)
        .bind(&record.action)
        .bind(&record.details)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn activity_for_post(&self, post_id: &str) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, campaign_id, post_id, action, details, created_at
            FROM activity_records
            WHERE post_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| ActivityRecord {
                id: r.get("id"),
                campaign_id: r.get("campaign_id"),
                post_id: r.get("post_id"),
                action: r.get("action"),
                details: r.get("details"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // synced posts
    // ------------------------------------------------------------------

    pub async fn known_reddit_post_ids(&self, credential_id: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT reddit_post_id FROM synced_posts WHERE credential_id = ?")
            .bind(credential_id)
            .fetch_all(&self.pool)
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("reddit_post_id")).collect())
    }

    /// Insert one batch of synced posts inside a single transaction.
    pub async fn insert_synced_posts(&self, batch: &[SyncedPost]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        for post in batch {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO synced_posts
                    (reddit_post_id, credential_id, title, subreddit, permalink,
                     posted_at, synced_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&post.reddit_post_id)
            .bind(&post.credential_id)
            .bind(&post.title)
            .bind(&post.subreddit)
            .bind(&post.permalink)
            .bind(post.posted_at)
            .bind(post.synced_at)
            .execute(&mut *tx)
            .await
            .map_err(crate::error::DbError::SqlxError)?;
        }

        tx.commit().await.map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    pub async fn synced_post_count(&self, credential_id: &str) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM synced_posts WHERE credential_id = ?",
        )
        .bind(credential_id)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.0)
    }
}

fn credential_from_row(row: &sqlx::sqlite::SqliteRow) -> Credential {
    Credential {
        id: row.get("id"),
        username: row.get("username"),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        token_expires_at: row.get("token_expires_at"),
        active: row.get::<i64, _>("active") != 0,
        last_used_at: row.get("last_used_at"),
        last_synced_at: row.get("last_synced_at"),
    }
}

fn campaign_post_from_row(row: &sqlx::sqlite::SqliteRow) -> CampaignPost {
    CampaignPost {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        credential_id: row.get("credential_id"),
        subreddit: row.get("subreddit"),
        title: row.get("title"),
        content_kind: ContentKind::parse(&row.get::<String, _>("content_kind"))
            .unwrap_or(ContentKind::Text),
        body: row.get("body"),
        media_url: row.get("media_url"),
        status: PostStatus::parse(&row.get::<String, _>("status"))
            .unwrap_or(PostStatus::Scheduled),
        scheduled_for: row.get("scheduled_for"),
        processing_started_at: row.get("processing_started_at"),
        posted_at: row.get("posted_at"),
        execution_time_ms: row.get("execution_time_ms"),
        reddit_post_id: row.get("reddit_post_id"),
        reddit_permalink: row.get("reddit_permalink"),
        last_error: row.get("last_error"),
        interval_hours: row.get("interval_hours"),
        parent_post_id: row.get("parent_post_id"),
        created_at: row.get("created_at"),
    }
}
