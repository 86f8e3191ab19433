//! Core types for Redcast

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A linked Reddit account with its OAuth material.
///
/// Rows live in the `credentials` table. Token fields are mutated only by
/// the token lifecycle manager; deactivation happens outside this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub username: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Unix timestamp after which the access token is no longer valid
    pub token_expires_at: Option<i64>,
    pub active: bool,
    pub last_used_at: Option<i64>,
    pub last_synced_at: Option<i64>,
}

impl Credential {
    /// Whether the access token is expired relative to `now` plus a safety
    /// margin. A credential without an expiry on record counts as expired.
    pub fn token_expired(&self, now: i64, margin: i64) -> bool {
        match self.token_expires_at {
            Some(expiry) => expiry < now + margin,
            None => true,
        }
    }

    /// Whether this credential can currently make authenticated calls,
    /// directly or after a refresh.
    pub fn usable(&self, now: i64, margin: i64) -> bool {
        if !self.active {
            return false;
        }
        if self.refresh_token.is_some() {
            return true;
        }
        self.access_token.is_some() && !self.token_expired(now, margin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Text,
    Link,
    Image,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Link => "link",
            ContentKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentKind::Text),
            "link" => Some(ContentKind::Link),
            "image" => Some(ContentKind::Image),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle states of a campaign post.
///
/// `Posted` and `Failed` are terminal; a recurrence continues the chain in a
/// new row rather than transitioning the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostStatus {
    Scheduled,
    Processing,
    Posted,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Scheduled => "scheduled",
            PostStatus::Processing => "processing",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(PostStatus::Scheduled),
            "processing" => Some(PostStatus::Processing),
            "posted" => Some(PostStatus::Posted),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled submission belonging to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPost {
    pub id: String,
    pub campaign_id: String,
    pub credential_id: String,
    pub subreddit: String,
    pub title: String,
    pub content_kind: ContentKind,
    /// Self-post body, link URL, or image caption depending on `content_kind`
    pub body: Option<String>,
    /// Hosted media URL for image posts
    pub media_url: Option<String>,
    pub status: PostStatus,
    pub scheduled_for: i64,
    pub processing_started_at: Option<i64>,
    pub posted_at: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub reddit_post_id: Option<String>,
    pub reddit_permalink: Option<String>,
    pub last_error: Option<String>,
    /// Recurrence interval; `None` means the post runs once
    pub interval_hours: Option<i64>,
    /// Set on rows created by recurrence, pointing at the completed post
    pub parent_post_id: Option<String>,
    pub created_at: i64,
}

impl CampaignPost {
    pub fn new_scheduled(
        campaign_id: String,
        credential_id: String,
        subreddit: String,
        title: String,
        content_kind: ContentKind,
        scheduled_for: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id,
            credential_id,
            subreddit,
            title,
            content_kind,
            body: None,
            media_url: None,
            status: PostStatus::Scheduled,
            scheduled_for,
            processing_started_at: None,
            posted_at: None,
            execution_time_ms: None,
            reddit_post_id: None,
            reddit_permalink: None,
            last_error: None,
            interval_hours: None,
            parent_post_id: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Build the next occurrence of a recurring post.
    ///
    /// The next run is anchored to the original `scheduled_for`; if the tick
    /// was delayed past a full interval, the occurrence is re-anchored to
    /// `now + interval` so it never lands in the past. Returns `None` for
    /// posts without a recurrence interval.
    pub fn next_occurrence(&self, now: i64) -> Option<CampaignPost> {
        let hours = self.interval_hours?;
        let interval_secs = hours * 3600;
        let mut next = self.scheduled_for + interval_secs;
        if next <= now {
            next = now + interval_secs;
        }

        Some(CampaignPost {
            id: Uuid::new_v4().to_string(),
            campaign_id: self.campaign_id.clone(),
            credential_id: self.credential_id.clone(),
            subreddit: self.subreddit.clone(),
            title: self.title.clone(),
            content_kind: self.content_kind,
            body: self.body.clone(),
            media_url: self.media_url.clone(),
            status: PostStatus::Scheduled,
            scheduled_for: next,
            processing_started_at: None,
            posted_at: None,
            execution_time_ms: None,
            reddit_post_id: None,
            reddit_permalink: None,
            last_error: None,
            interval_hours: self.interval_hours,
            parent_post_id: Some(self.id.clone()),
            created_at: now,
        })
    }
}

/// Append-only audit entry written by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Option<i64>,
    pub campaign_id: String,
    pub post_id: Option<String>,
    pub action: String,
    /// Structured details serialized as JSON
    pub details: Option<String>,
    pub created_at: i64,
}

/// One request-counting bucket for a credential.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    pub credential_id: String,
    pub window_start: i64,
    pub request_count: i64,
    pub last_request_at: Option<i64>,
    pub last_endpoint: Option<String>,
}

/// An externally published post pulled back into local storage.
#[derive(Debug, Clone)]
pub struct SyncedPost {
    pub reddit_post_id: String,
    pub credential_id: String,
    pub title: Option<String>,
    pub subreddit: Option<String>,
    pub permalink: Option<String>,
    pub posted_at: Option<i64>,
    pub synced_at: i64,
}
