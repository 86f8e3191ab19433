//! Campaign post scheduler
//!
//! The top-level poll loop body: find due posts, drive each through the
//! scheduled → processing → posted/failed state machine, enqueue the next
//! occurrence of recurring posts, and record activity.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{ApiError, Result};
use crate::rate_tracker::RateTracker;
use crate::reddit::{submit, RedditApi, SubmissionOutcome};
use crate::retry::RetryPolicy;
use crate::tokens::{TokenManager, SCHEDULER_EXPIRY_MARGIN_SECS};
use crate::types::{ActivityRecord, CampaignPost};

/// What one poll tick did.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TickSummary {
    /// False when the tick was skipped because another was still running
    pub ran: bool,
    pub due: usize,
    pub posted: usize,
    pub failed: usize,
    /// Posts another owner claimed first
    pub skipped: usize,
}

enum PostOutcome {
    Posted,
    Failed,
    Skipped,
}

pub struct Scheduler {
    db: Database,
    api: Arc<dyn RedditApi>,
    tokens: TokenManager,
    rate: Arc<RateTracker>,
    retry: RetryPolicy,
    /// Tick-in-progress guard; a timer tick and a manual trigger must not
    /// process the same queue concurrently
    tick_guard: Mutex<()>,
}

impl Scheduler {
    pub fn new(db: Database, api: Arc<dyn RedditApi>, rate: Arc<RateTracker>) -> Self {
        let tokens = TokenManager::new(db.clone(), Arc::clone(&api));
        Self {
            db,
            api,
            tokens,
            rate,
            retry: RetryPolicy::default(),
            tick_guard: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run one poll tick: process every scheduled post that is due.
    ///
    /// Posts are handled strictly sequentially, in ascending `scheduled_for`
    /// order, to stay inside a single credential's rate budget per tick and
    /// keep failures isolated. A failure inside one post never reaches the
    /// next; only the due-posts query itself can fail the tick.
    pub async fn tick(&self) -> Result<TickSummary> {
        let _guard = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Tick already in progress, skipping this one");
                return Ok(TickSummary::default());
            }
        };

        let now = chrono::Utc::now().timestamp();
        let due = self.db.due_campaign_posts(now).await?;

        let mut summary = TickSummary {
            ran: true,
            due: due.len(),
            ..TickSummary::default()
        };

        if due.is_empty() {
            return Ok(summary);
        }

        info!("Found {} post(s) due for publishing", due.len());

        for post in due {
            match self.process_post(post).await {
                PostOutcome::Posted => summary.posted += 1,
                PostOutcome::Failed => summary.failed += 1,
                PostOutcome::Skipped => summary.skipped += 1,
            }
        }

        info!(
            "Tick complete: {} posted, {} failed, {} skipped",
            summary.posted, summary.failed, summary.skipped
        );

        Ok(summary)
    }

    /// Wait until no tick is running, up to `timeout`. Used during shutdown
    /// to drain in-flight work.
    pub async fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        tokio::time::timeout(timeout, self.tick_guard.lock())
            .await
            .is_ok()
    }

    /// Drive one post through the state machine. Never propagates errors;
    /// everything after a successful claim ends in `posted` or `failed`.
    async fn process_post(&self, post: CampaignPost) -> PostOutcome {
        let started = Instant::now();
        let now = chrono::Utc::now().timestamp();

        // Claiming the row is the exclusivity gate. Losing it (or failing to
        // write it) means another owner has the post; leave it alone.
        match self.db.claim_campaign_post(&post.id, now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Post {} already claimed elsewhere", post.id);
                return PostOutcome::Skipped;
            }
            Err(e) => {
                warn!("Could not claim post {}: {}; skipping this tick", post.id, e);
                return PostOutcome::Skipped;
            }
        }

        info!(
            "Publishing post {} to r/{} for campaign {}",
            post.id, post.subreddit, post.campaign_id
        );

        let result = self.attempt_submission(&post).await;
        let execution_time_ms = started.elapsed().as_millis() as i64;
        let finished_at = chrono::Utc::now().timestamp();

        match result {
            Ok(outcome) => {
                if let Err(e) = self
                    .db
                    .mark_campaign_post_posted(
                        &post.id,
                        finished_at,
                        execution_time_ms,
                        &outcome.reddit_post_id,
                        outcome.permalink.as_deref(),
                    )
                    .await
                {
                    error!("Post {} published but state write failed: {}", post.id, e);
                }

                self.enqueue_recurrence(&post, finished_at).await;

                self.log_activity(
                    &post,
                    "post_published",
                    serde_json::json!({
                        "reddit_post_id": outcome.reddit_post_id,
                        "permalink": outcome.permalink,
                        "execution_time_ms": execution_time_ms,
                    }),
                )
                .await;

                PostOutcome::Posted
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Post {} failed: {}", post.id, message);

                if let Err(write_err) = self
                    .db
                    .mark_campaign_post_failed(
                        &post.id,
                        finished_at,
                        execution_time_ms,
                        &message,
                    )
                    .await
                {
                    error!(
                        "Post {} failed and state write also failed: {}",
                        post.id, write_err
                    );
                }

                self.log_activity(
                    &post,
                    "post_failed",
                    serde_json::json!({
                        "error": message,
                        "execution_time_ms": execution_time_ms,
                    }),
                )
                .await;

                PostOutcome::Failed
            }
        }
    }

    /// Validate, resolve the credential, and submit with retries.
    ///
    /// Validation runs first so malformed posts fail before any network
    /// call is attempted.
    async fn attempt_submission(&self, post: &CampaignPost) -> Result<SubmissionOutcome> {
        let request = submit::build_submit_request(post)?;

        let credential = self
            .db
            .get_credential(&post.credential_id)
            .await?
            .ok_or_else(|| {
                ApiError::Auth(format!(
                    "credential {} not found for post {}",
                    post.credential_id, post.id
                ))
            })?;

        if !credential.active {
            return Err(ApiError::Auth(format!(
                "credential {} is deactivated",
                credential.id
            ))
            .into());
        }

        let credential = self
            .tokens
            .ensure_valid(&credential, SCHEDULER_EXPIRY_MARGIN_SECS)
            .await?;

        let access_token = credential.access_token.clone().ok_or_else(|| {
            ApiError::Auth(format!(
                "credential {} has no access token after refresh",
                credential.id
            ))
        })?;

        // Community existence check. It rides the client's cache, so a
        // campaign posting into the same subreddit spends quota on it once
        // per TTL, not once per post.
        self.retry
            .run(|| {
                let api = Arc::clone(&self.api);
                let token = access_token.clone();
                let subreddit = post.subreddit.clone();
                async move { api.subreddit_about(&token, &subreddit).await }
            })
            .await
            .map_err(|e| match e {
                ApiError::Rejected(msg) => ApiError::Validation(format!(
                    "target community r/{} is not available: {}",
                    post.subreddit, msg
                )),
                other => other,
            })?;

        match self.api.subreddit_rules(&access_token, &post.subreddit).await {
            Ok(rules) => {
                let n = rules
                    .get("rules")
                    .and_then(|r| r.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                debug!("r/{} lists {} posting rule(s)", post.subreddit, n);
            }
            Err(e) => debug!("Could not fetch posting rules for r/{}: {}", post.subreddit, e),
        }

        let now = chrono::Utc::now().timestamp();
        self.rate.record(&credential.id, "/api/submit", now).await;

        let outcome = self
            .retry
            .run(|| {
                let api = Arc::clone(&self.api);
                let token = access_token.clone();
                let request = request.clone();
                async move { api.submit(&token, &request).await }
            })
            .await?;

        Ok(outcome)
    }

    /// Insert the next occurrence of a recurring post as a new scheduled row.
    async fn enqueue_recurrence(&self, post: &CampaignPost, now: i64) {
        let Some(next) = post.next_occurrence(now) else {
            return;
        };

        match self.db.insert_campaign_post(&next).await {
            Ok(()) => info!(
                "Scheduled recurrence {} of post {} for {}",
                next.id, post.id, next.scheduled_for
            ),
            Err(e) => error!("Failed to schedule recurrence of post {}: {}", post.id, e),
        }
    }

    /// Best-effort activity logging. A failure here is logged and swallowed;
    /// observability must not threaten the state machine it observes.
    async fn log_activity(&self, post: &CampaignPost, action: &str, details: serde_json::Value) {
        let record = ActivityRecord {
            id: None,
            campaign_id: post.campaign_id.clone(),
            post_id: Some(post.id.clone()),
            action: action.to_string(),
            details: Some(details.to_string()),
            created_at: chrono::Utc::now().timestamp(),
        };

        if let Err(e) = self.db.append_activity(&record).await {
            warn!("Failed to record activity for post {}: {}", post.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reddit::mock::MockRedditApi;
    use crate::types::{ContentKind, Credential, PostStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database, Arc<MockRedditApi>, Scheduler) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        let api = Arc::new(MockRedditApi::new());
        let rate = Arc::new(RateTracker::new(db.clone(), 60));
        let scheduler = Scheduler::new(
            db.clone(),
            Arc::clone(&api) as Arc<dyn RedditApi>,
            rate,
        )
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)));
        (temp_dir, db, api, scheduler)
    }

    async fn insert_credential(db: &Database, id: &str) {
        let now = chrono::Utc::now().timestamp();
        db.insert_credential(&Credential {
            id: id.to_string(),
            username: format!("user-{}", id),
            access_token: Some("tok".to_string()),
            refresh_token: Some("ref".to_string()),
            token_expires_at: Some(now + 7200),
            active: true,
            last_used_at: None,
            last_synced_at: None,
        })
        .await
        .unwrap();
    }

    fn due_text_post(credential_id: &str) -> CampaignPost {
        let now = chrono::Utc::now().timestamp();
        let mut post = CampaignPost::new_scheduled(
            "campaign-1".to_string(),
            credential_id.to_string(),
            "rust".to_string(),
            "Hello".to_string(),
            ContentKind::Text,
            now - 1,
        );
        post.body = Some("world".to_string());
        post
    }

    #[tokio::test]
    async fn test_happy_path_tick() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;
        let post = due_text_post("c1");
        db.insert_campaign_post(&post).await.unwrap();

        let summary = scheduler.tick().await.unwrap();
        assert!(summary.ran);
        assert_eq!(summary.due, 1);
        assert_eq!(summary.posted, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(api.submit_call_count(), 1);

        let loaded = db.get_campaign_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Posted);
        assert!(loaded.reddit_post_id.is_some());
        assert!(loaded.reddit_permalink.is_some());
        assert!(loaded.posted_at.is_some());
        assert!(loaded.execution_time_ms.is_some());
        assert!(loaded.last_error.is_none());

        let activity = db.activity_for_post(&post.id).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].action, "post_published");
    }

    #[tokio::test]
    async fn test_retick_is_idempotent() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;
        let post = due_text_post("c1");
        db.insert_campaign_post(&post).await.unwrap();

        scheduler.tick().await.unwrap();
        let second = scheduler.tick().await.unwrap();

        assert!(second.ran);
        assert_eq!(second.due, 0);
        assert_eq!(api.submit_call_count(), 1, "posted rows must not reprocess");
    }

    #[tokio::test]
    async fn test_processing_rows_are_not_candidates() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;
        let post = due_text_post("c1");
        db.insert_campaign_post(&post).await.unwrap();

        // Another owner already claimed the row
        let now = chrono::Utc::now().timestamp();
        assert!(db.claim_campaign_post(&post.id, now).await.unwrap());

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.due, 0);
        assert_eq!(api.submit_call_count(), 0);

        let loaded = db.get_campaign_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Processing);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_post() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;

        let mut failing = due_text_post("c1");
        failing.scheduled_for -= 100; // processed first
        let succeeding = due_text_post("c1");
        db.insert_campaign_post(&failing).await.unwrap();
        db.insert_campaign_post(&succeeding).await.unwrap();

        api.queue_submit(Err(ApiError::Rejected(
            "SUBREDDIT_NOTALLOWED: not allowed to post there".to_string(),
        )));

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.posted, 1);
        assert_eq!(summary.failed, 1);

        let failed = db.get_campaign_post(&failing.id).await.unwrap().unwrap();
        assert_eq!(failed.status, PostStatus::Failed);
        assert!(failed
            .last_error
            .as_deref()
            .unwrap()
            .contains("SUBREDDIT_NOTALLOWED"));
        assert!(failed.posted_at.is_some(), "terminal attempt time is stamped");

        let posted = db.get_campaign_post(&succeeding.id).await.unwrap().unwrap();
        assert_eq!(posted.status, PostStatus::Posted);
    }

    #[tokio::test]
    async fn test_image_post_without_media_fails_before_network() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;

        let now = chrono::Utc::now().timestamp();
        let post = CampaignPost::new_scheduled(
            "campaign-1".to_string(),
            "c1".to_string(),
            "pics".to_string(),
            "A cat".to_string(),
            ContentKind::Image,
            now - 1,
        );
        db.insert_campaign_post(&post).await.unwrap();

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(api.submit_call_count(), 0, "no network call for invalid posts");

        let loaded = db.get_campaign_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Failed);
        assert!(loaded.last_error.as_deref().unwrap().contains("media"));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_midtick() {
        let (_temp, db, api, scheduler) = setup().await;

        let now = chrono::Utc::now().timestamp();
        db.insert_credential(&Credential {
            id: "c1".to_string(),
            username: "alice".to_string(),
            access_token: Some("stale".to_string()),
            refresh_token: Some("ref".to_string()),
            token_expires_at: Some(now - 3600),
            active: true,
            last_used_at: None,
            last_synced_at: None,
        })
        .await
        .unwrap();

        let post = due_text_post("c1");
        db.insert_campaign_post(&post).await.unwrap();

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.posted, 1);
        assert_eq!(api.refresh_call_count(), 1);

        let credential = db.get_credential("c1").await.unwrap().unwrap();
        assert!(credential.token_expires_at.unwrap() > now);
    }

    #[tokio::test]
    async fn test_recurrence_creates_new_row() {
        let (_temp, db, _api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;

        let mut post = due_text_post("c1");
        post.interval_hours = Some(24);
        db.insert_campaign_post(&post).await.unwrap();

        scheduler.tick().await.unwrap();

        let counts = db.campaign_status_counts(None).await.unwrap();
        assert_eq!(counts.posted, 1);
        assert_eq!(counts.scheduled, 1);

        let upcoming = db.upcoming_campaign_posts(10).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        let next = &upcoming[0];
        assert_eq!(next.parent_post_id.as_deref(), Some(post.id.as_str()));
        assert_eq!(next.scheduled_for, post.scheduled_for + 24 * 3600);
        assert_ne!(next.id, post.id);

        // The original row is terminal and untouched by its recurrence
        let original = db.get_campaign_post(&post.id).await.unwrap().unwrap();
        assert_eq!(original.status, PostStatus::Posted);
        assert!(original.parent_post_id.is_none());
    }

    #[tokio::test]
    async fn test_delayed_recurrence_never_lands_in_past() {
        let (_temp, db, _api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;

        let now = chrono::Utc::now().timestamp();
        let mut post = due_text_post("c1");
        // Overdue by several intervals
        post.scheduled_for = now - 5 * 3600;
        post.interval_hours = Some(1);
        db.insert_campaign_post(&post).await.unwrap();

        scheduler.tick().await.unwrap();

        let upcoming = db.upcoming_campaign_posts(10).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert!(upcoming[0].scheduled_for >= now);
    }

    #[tokio::test]
    async fn test_retry_then_success_counts_as_posted() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;
        let post = due_text_post("c1");
        db.insert_campaign_post(&post).await.unwrap();

        api.queue_submit(Err(ApiError::Transient("502 bad gateway".to_string())));
        api.queue_submit(Err(ApiError::RateLimit("429".to_string())));
        // Third attempt falls through to the default success

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.posted, 1);
        assert_eq!(api.submit_call_count(), 3);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_fails_without_retry() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;
        let post = due_text_post("c1");
        db.insert_campaign_post(&post).await.unwrap();

        api.queue_submit(Err(ApiError::QuotaExhausted(
            "402 payment required".to_string(),
        )));

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(api.submit_call_count(), 1, "402 must never be retried");

        let loaded = db.get_campaign_post(&post.id).await.unwrap().unwrap();
        assert!(loaded
            .last_error
            .as_deref()
            .unwrap()
            .contains("quota exhausted"));
    }

    #[tokio::test]
    async fn test_submission_records_rate_usage() {
        let (_temp, db, _api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;
        db.insert_campaign_post(&due_text_post("c1")).await.unwrap();

        scheduler.tick().await.unwrap();

        // The recording happened within the last window or, right at a
        // boundary, the one before it.
        let now = chrono::Utc::now().timestamp();
        let current = db
            .usage_window_count("c1", RateTracker::window_start(now))
            .await
            .unwrap();
        let previous = db
            .usage_window_count("c1", RateTracker::window_start(now) - 60)
            .await
            .unwrap();
        assert!(current + previous >= 1);
    }

    #[tokio::test]
    async fn test_unavailable_community_fails_validation() {
        let (_temp, db, api, scheduler) = setup().await;
        insert_credential(&db, "c1").await;
        let post = due_text_post("c1");
        db.insert_campaign_post(&post).await.unwrap();

        api.fail_subreddit_about(ApiError::Rejected("404 not found".to_string()));

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(api.submit_call_count(), 0);

        let loaded = db.get_campaign_post(&post.id).await.unwrap().unwrap();
        assert!(loaded
            .last_error
            .as_deref()
            .unwrap()
            .contains("target community r/rust"));
    }

    #[tokio::test]
    async fn test_unknown_credential_fails_post() {
        let (_temp, db, api, scheduler) = setup().await;
        db.insert_campaign_post(&due_text_post("ghost")).await.unwrap();

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(api.submit_call_count(), 0);
    }
}
