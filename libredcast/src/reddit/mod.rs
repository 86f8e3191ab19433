//! Reddit API abstraction and implementations
//!
//! The [`RedditApi`] trait is the seam between the scheduler and the
//! upstream platform. The production implementation lives in
//! [`client::RedditClient`]; a configurable mock for driving the scheduler
//! without network lives in [`mock::MockRedditApi`].

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ApiError;

pub mod client;
pub mod submit;

// Mock API is available for all builds (not just tests) to support
// integration tests
pub mod mock;

pub use submit::SubmitRequest;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Token endpoint response for the refresh-token grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the new access token expires
    pub expires_in: i64,
    #[serde(default)]
    pub scope: String,
}

/// A successful submission, reduced to the fields this service stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub reddit_post_id: String,
    pub permalink: Option<String>,
}

/// One externally published post as returned by a listing endpoint.
#[derive(Debug, Clone)]
pub struct RemotePost {
    pub reddit_post_id: String,
    pub title: String,
    pub subreddit: String,
    pub permalink: Option<String>,
    pub posted_at: Option<i64>,
}

/// Unified interface for authenticated Reddit calls.
///
/// Every method takes the access token explicitly; token freshness is the
/// token lifecycle manager's concern, not the client's.
#[async_trait]
pub trait RedditApi: Send + Sync {
    /// Exchange a refresh token for a new access token using app-level
    /// client credentials.
    async fn refresh_token(&self, refresh_token: &str) -> ApiResult<TokenResponse>;

    /// Submit a post. The request must already be validated and sanitized.
    async fn submit(&self, access_token: &str, request: &SubmitRequest)
        -> ApiResult<SubmissionOutcome>;

    /// Identity of the account behind the token.
    async fn me(&self, access_token: &str) -> ApiResult<serde_json::Value>;

    /// Public profile information for a user.
    async fn user_about(&self, access_token: &str, username: &str)
        -> ApiResult<serde_json::Value>;

    /// Subreddit metadata; slow-changing, cached by the client.
    async fn subreddit_about(
        &self,
        access_token: &str,
        subreddit: &str,
    ) -> ApiResult<serde_json::Value>;

    /// Subreddit posting rules; slow-changing, cached by the client.
    async fn subreddit_rules(
        &self,
        access_token: &str,
        subreddit: &str,
    ) -> ApiResult<serde_json::Value>;

    /// Most recent posts published by a user, newest first.
    async fn user_posts(
        &self,
        access_token: &str,
        username: &str,
        limit: u32,
    ) -> ApiResult<Vec<RemotePost>>;
}
