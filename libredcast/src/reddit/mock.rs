//! Configurable in-memory Reddit API for tests
//!
//! Lives outside `#[cfg(test)]` so integration tests in `tests/` can drive
//! the scheduler and sync paths without touching the network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::{ApiResult, RedditApi, RemotePost, SubmissionOutcome, SubmitRequest, TokenResponse};
use crate::error::ApiError;

/// Scriptable mock: queue per-call results, inspect call counts afterwards.
///
/// With nothing queued, submissions succeed with generated ids and token
/// refreshes return a one-hour token.
#[derive(Default)]
pub struct MockRedditApi {
    pub submit_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub listing_calls: AtomicU32,
    submit_queue: Mutex<VecDeque<ApiResult<SubmissionOutcome>>>,
    refresh_queue: Mutex<VecDeque<ApiResult<TokenResponse>>>,
    user_posts: Mutex<Vec<RemotePost>>,
    subreddit_about_error: Mutex<Option<ApiError>>,
    user_about_error: Mutex<Option<ApiError>>,
}

impl MockRedditApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next submission; earlier entries are consumed
    /// first.
    pub fn queue_submit(&self, result: ApiResult<SubmissionOutcome>) {
        self.submit_queue.lock().unwrap().push_back(result);
    }

    /// Queue the result of the next token refresh.
    pub fn queue_refresh(&self, result: ApiResult<TokenResponse>) {
        self.refresh_queue.lock().unwrap().push_back(result);
    }

    pub fn set_user_posts(&self, posts: Vec<RemotePost>) {
        *self.user_posts.lock().unwrap() = posts;
    }

    /// Make every subreddit lookup fail with the given error.
    pub fn fail_subreddit_about(&self, error: ApiError) {
        *self.subreddit_about_error.lock().unwrap() = Some(error);
    }

    /// Make every user profile lookup fail with the given error.
    pub fn fail_user_about(&self, error: ApiError) {
        *self.user_about_error.lock().unwrap() = Some(error);
    }

    pub fn submit_call_count(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_call_count(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RedditApi for MockRedditApi {
    async fn refresh_token(&self, _refresh_token: &str) -> ApiResult<TokenResponse> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(result) = self.refresh_queue.lock().unwrap().pop_front() {
            return result;
        }

        Ok(TokenResponse {
            access_token: format!("mock-token-{}", n + 1),
            expires_in: 3600,
            scope: "identity submit read".to_string(),
        })
    }

    async fn submit(
        &self,
        _access_token: &str,
        request: &SubmitRequest,
    ) -> ApiResult<SubmissionOutcome> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(result) = self.submit_queue.lock().unwrap().pop_front() {
            return result;
        }

        Ok(SubmissionOutcome {
            reddit_post_id: format!("t3_mock{:04}", n + 1),
            permalink: Some(format!("/r/{}/comments/mock{:04}", request.subreddit, n + 1)),
        })
    }

    async fn me(&self, _access_token: &str) -> ApiResult<serde_json::Value> {
        Ok(serde_json::json!({"name": "mock-user"}))
    }

    async fn user_about(
        &self,
        _access_token: &str,
        username: &str,
    ) -> ApiResult<serde_json::Value> {
        if let Some(error) = self.user_about_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(serde_json::json!({"data": {"name": username}}))
    }

    async fn subreddit_about(
        &self,
        _access_token: &str,
        subreddit: &str,
    ) -> ApiResult<serde_json::Value> {
        if let Some(error) = self.subreddit_about_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(serde_json::json!({"data": {"display_name": subreddit}}))
    }

    async fn subreddit_rules(
        &self,
        _access_token: &str,
        _subreddit: &str,
    ) -> ApiResult<serde_json::Value> {
        Ok(serde_json::json!({"rules": []}))
    }

    async fn user_posts(
        &self,
        _access_token: &str,
        _username: &str,
        limit: u32,
    ) -> ApiResult<Vec<RemotePost>> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        let posts = self.user_posts.lock().unwrap();
        Ok(posts.iter().take(limit as usize).cloned().collect())
    }
}

/// A mock that fails every call, for exercising error paths.
pub struct FailingRedditApi {
    pub error: ApiError,
}

#[async_trait]
impl RedditApi for FailingRedditApi {
    async fn refresh_token(&self, _refresh_token: &str) -> ApiResult<TokenResponse> {
        Err(self.error.clone())
    }

    async fn submit(
        &self,
        _access_token: &str,
        _request: &SubmitRequest,
    ) -> ApiResult<SubmissionOutcome> {
        Err(self.error.clone())
    }

    async fn me(&self, _access_token: &str) -> ApiResult<serde_json::Value> {
        Err(self.error.clone())
    }

    async fn user_about(
        &self,
        _access_token: &str,
        _username: &str,
    ) -> ApiResult<serde_json::Value> {
        Err(self.error.clone())
    }

    async fn subreddit_about(
        &self,
        _access_token: &str,
        _subreddit: &str,
    ) -> ApiResult<serde_json::Value> {
        Err(self.error.clone())
    }

    async fn subreddit_rules(
        &self,
        _access_token: &str,
        _subreddit: &str,
    ) -> ApiResult<serde_json::Value> {
        Err(self.error.clone())
    }

    async fn user_posts(
        &self,
        _access_token: &str,
        _username: &str,
        _limit: u32,
    ) -> ApiResult<Vec<RemotePost>> {
        Err(self.error.clone())
    }
}
