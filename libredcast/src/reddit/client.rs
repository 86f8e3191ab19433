//! HTTP implementation of the Reddit API
//!
//! All requests carry the configured identifying User-Agent and a per-call
//! timeout. Responses are classified into [`ApiError`] variants here so the
//! retry executor can decide what is worth repeating.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::submit::{form_fields, parse_error_body, parse_submit_response};
use super::{ApiResult, RedditApi, RemotePost, SubmissionOutcome, SubmitRequest, TokenResponse};
use crate::cache::Cache;
use crate::config::RedditConfig;
use crate::error::ApiError;

/// Timeout for ordinary API calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for listing endpoints, which are markedly slower upstream
const LISTING_TIMEOUT: Duration = Duration::from_secs(120);

/// How long cached subreddit metadata stays fresh
const SUBREDDIT_CACHE_TTL: Duration = Duration::from_secs(600);

pub struct RedditClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    auth_base: String,
    cache: Arc<Cache>,
}

impl RedditClient {
    pub fn new(config: &RedditConfig, cache: Arc<Cache>) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth_base: config.auth_base.trim_end_matches('/').to_string(),
            cache,
        })
    }

    fn map_request_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Transient(format!("request timed out: {}", e))
        } else {
            ApiError::Transient(format!("network error: {}", e))
        }
    }

    /// Turn a response into JSON or a classified error.
    async fn json_or_error(response: reqwest::Response) -> ApiResult<serde_json::Value> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| ApiError::Rejected(format!("unparseable upstream response: {}", e)));
        }

        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(code, parse_error_body(code, &body)))
    }

    async fn get_json(&self, access_token: &str, path: &str, timeout: Duration)
        -> ApiResult<serde_json::Value>
    {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        Self::json_or_error(response).await
    }

    /// Fetch through the TTL cache; subreddit metadata changes slowly enough
    /// that every tick re-reading it would waste quota.
    async fn get_json_cached(
        &self,
        access_token: &str,
        path: &str,
    ) -> ApiResult<serde_json::Value> {
        if let Some(value) = self.cache.get(path) {
            debug!("cache hit for {}", path);
            return Ok(value);
        }

        let value = self.get_json(access_token, path, DEFAULT_TIMEOUT).await?;
        self.cache.put(path, value.clone(), SUBREDDIT_CACHE_TTL);
        Ok(value)
    }
}

#[async_trait]
impl RedditApi for RedditClient {
    async fn refresh_token(&self, refresh_token: &str) -> ApiResult<TokenResponse> {
        let url = format!("{}/api/v1/access_token", self.auth_base);
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&params)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(code, parse_error_body(code, &body)));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ApiError::Auth(format!("unparseable token response: {}", e)))
    }

    async fn submit(
        &self,
        access_token: &str,
        request: &SubmitRequest,
    ) -> ApiResult<SubmissionOutcome> {
        let url = format!("{}/api/submit", self.api_base);
        let fields = form_fields(request);
        debug!("POST {} kind={}", url, request.kind.as_str());

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .form(&fields)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let value = Self::json_or_error(response).await?;

        parse_submit_response(&value).ok_or_else(|| {
            ApiError::Rejected(format!(
                "could not locate a post id in submit response: {}",
                value
            ))
        })
    }

    async fn me(&self, access_token: &str) -> ApiResult<serde_json::Value> {
        self.get_json(access_token, "/api/v1/me", DEFAULT_TIMEOUT)
            .await
    }

    async fn user_about(
        &self,
        access_token: &str,
        username: &str,
    ) -> ApiResult<serde_json::Value> {
        let path = format!("/user/{}/about.json", username);
        self.get_json(access_token, &path, DEFAULT_TIMEOUT).await
    }

    async fn subreddit_about(
        &self,
        access_token: &str,
        subreddit: &str,
    ) -> ApiResult<serde_json::Value> {
        let path = format!("/r/{}/about.json", subreddit);
        self.get_json_cached(access_token, &path).await
    }

    async fn subreddit_rules(
        &self,
        access_token: &str,
        subreddit: &str,
    ) -> ApiResult<serde_json::Value> {
        let path = format!("/r/{}/about/rules.json", subreddit);
        self.get_json_cached(access_token, &path).await
    }

    async fn user_posts(
        &self,
        access_token: &str,
        username: &str,
        limit: u32,
    ) -> ApiResult<Vec<RemotePost>> {
        let path = format!("/user/{}/submitted.json?limit={}", username, limit);
        let value = self.get_json(access_token, &path, LISTING_TIMEOUT).await?;

        Ok(parse_listing(&value))
    }
}

/// Flatten a listing response into remote posts, skipping malformed entries.
fn parse_listing(value: &serde_json::Value) -> Vec<RemotePost> {
    let children = match value
        .get("data")
        .and_then(|d| d.get("children"))
        .and_then(|c| c.as_array())
    {
        Some(children) => children,
        None => return Vec::new(),
    };

    children
        .iter()
        .filter_map(|child| {
            let data = child.get("data")?;
            let id = data
                .get("name")
                .and_then(|v| v.as_str())
                .or_else(|| data.get("id").and_then(|v| v.as_str()))?;

            Some(RemotePost {
                reddit_post_id: id.to_string(),
                title: data
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                subreddit: data
                    .get("subreddit")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                permalink: data
                    .get("permalink")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                posted_at: data.get("created_utc").and_then(|v| v.as_f64()).map(|f| f as i64),
            })
        })
        .collect()
}
