//! Post sync: reconcile externally published content into local storage
//!
//! Pulls each linked account's most recent posts back in, deduplicating by
//! the upstream post id. Reads ride on the selector's current credential so
//! listing traffic spreads across the pool instead of always taxing the
//! account being synced.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{ApiError, Result};
use crate::rate_tracker::RateTracker;
use crate::reddit::RedditApi;
use crate::retry::RetryPolicy;
use crate::selector::AccountSelector;
use crate::tokens::{TokenManager, API_EXPIRY_MARGIN_SECS};
use crate::types::SyncedPost;

/// Most recent posts fetched per account
const SYNC_PAGE_LIMIT: u32 = 50;

/// Rows inserted per transaction, to bound transaction size
const SYNC_INSERT_BATCH: usize = 10;

/// Pause between accounts in a full sync so many credentials do not burst
/// the shared upstream quota at once
const SYNC_ACCOUNT_DELAY: Duration = Duration::from_secs(2);

pub struct PostSync {
    db: Database,
    api: Arc<dyn RedditApi>,
    tokens: TokenManager,
    selector: Arc<AccountSelector>,
    rate: Arc<RateTracker>,
    retry: RetryPolicy,
}

impl PostSync {
    pub fn new(
        db: Database,
        api: Arc<dyn RedditApi>,
        selector: Arc<AccountSelector>,
        rate: Arc<RateTracker>,
    ) -> Self {
        let tokens = TokenManager::new(db.clone(), Arc::clone(&api));
        Self {
            db,
            api,
            tokens,
            selector,
            rate,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sync one account's published posts. Returns whether anything new was
    /// stored. Finding nothing still stamps `last_synced_at`; absence of new
    /// data is a recordable outcome.
    pub async fn sync_account(&self, credential_id: &str) -> Result<bool> {
        let target = self
            .db
            .get_credential(credential_id)
            .await?
            .ok_or_else(|| {
                crate::RedcastError::InvalidInput(format!(
                    "credential {} not found",
                    credential_id
                ))
            })?;

        // The listing endpoint is public; any pool credential can read it.
        // Let the selector pick the coldest one rather than taxing the
        // account being synced.
        let reader = match self.selector.acquire().await? {
            Some(reader) => reader,
            None => target.clone(),
        };
        let reader = self
            .tokens
            .ensure_valid(&reader, API_EXPIRY_MARGIN_SECS)
            .await?;
        let access_token = reader.access_token.clone().ok_or_else(|| {
            ApiError::Auth(format!("credential {} has no access token", reader.id))
        })?;

        let now = chrono::Utc::now().timestamp();

        // A deleted or suspended account has no listing to read; detect that
        // first so the failure mode is explicit rather than an empty page.
        self.rate.record(&reader.id, "/user/about", now).await;
        let profile = self
            .retry
            .run(|| {
                let api = Arc::clone(&self.api);
                let token = access_token.clone();
                let username = target.username.clone();
                async move { api.user_about(&token, &username).await }
            })
            .await;
        if let Err(e) = profile {
            warn!("Profile lookup failed for {}: {}", target.username, e);
            if matches!(e, ApiError::Rejected(_)) {
                // The account is gone upstream. Nothing to list, but the
                // check itself is a recordable outcome.
                self.db
                    .touch_credential_last_synced(credential_id, now)
                    .await?;
                return Ok(false);
            }
            return Err(e.into());
        }

        self.rate.record(&reader.id, "/user/submitted", now).await;

        let remote = self
            .retry
            .run(|| {
                let api = Arc::clone(&self.api);
                let token = access_token.clone();
                let username = target.username.clone();
                async move { api.user_posts(&token, &username, SYNC_PAGE_LIMIT).await }
            })
            .await?;

        let known = self.db.known_reddit_post_ids(credential_id).await?;
        let fresh: Vec<SyncedPost> = remote
            .into_iter()
            .filter(|p| !known.contains(&p.reddit_post_id))
            .map(|p| SyncedPost {
                reddit_post_id: p.reddit_post_id,
                credential_id: credential_id.to_string(),
                title: Some(p.title),
                subreddit: Some(p.subreddit),
                permalink: p.permalink,
                posted_at: p.posted_at,
                synced_at: now,
            })
            .collect();

        for batch in fresh.chunks(SYNC_INSERT_BATCH) {
            self.db.insert_synced_posts(batch).await?;
        }

        self.db
            .touch_credential_last_synced(credential_id, now)
            .await?;

        info!(
            "Synced {} new post(s) for {} ({})",
            fresh.len(),
            target.username,
            credential_id
        );

        Ok(!fresh.is_empty())
    }

    /// Sync every active account, pausing between them. Returns the number
    /// of accounts synced successfully; one account's failure does not stop
    /// the rest.
    pub async fn sync_all(&self) -> Result<usize> {
        let credentials = self.db.list_active_credentials().await?;
        let mut synced = 0usize;

        for (i, credential) in credentials.iter().enumerate() {
            if i > 0 {
                sleep(SYNC_ACCOUNT_DELAY).await;
            }

            match self.sync_account(&credential.id).await {
                Ok(_) => synced += 1,
                Err(e) => warn!("Sync failed for {}: {}", credential.id, e),
            }
        }

        Ok(synced)
    }
}
