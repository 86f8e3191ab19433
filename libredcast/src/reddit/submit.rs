//! Submission protocol adapter
//!
//! Translates a campaign post into the upstream submit endpoint's
//! form-encoded request and parses its inconsistent response shapes.
//! Sanitization and URL validation happen here, before any network call.

use url::Url;

use super::SubmissionOutcome;
use crate::error::ApiError;
use crate::types::{CampaignPost, ContentKind};

/// Wire kind of a submission: self post or link post. Image posts go out as
/// link posts pointing at hosted media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    SelfPost,
    Link,
}

impl SubmitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitKind::SelfPost => "self",
            SubmitKind::Link => "link",
        }
    }
}

/// A validated, sanitized submission ready to be form-encoded.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub subreddit: String,
    pub kind: SubmitKind,
    pub title: String,
    /// Self-post body (empty string allowed by the upstream)
    pub body: Option<String>,
    /// Target URL for link and image posts
    pub url: Option<String>,
}

/// Build a submit request from a campaign post.
///
/// All failures here are `ApiError::Validation`: the post is malformed and
/// no request must reach the network.
pub fn build_submit_request(post: &CampaignPost) -> Result<SubmitRequest, ApiError> {
    if post.title.trim().is_empty() {
        return Err(ApiError::Validation("post has an empty title".to_string()));
    }
    if post.subreddit.trim().is_empty() {
        return Err(ApiError::Validation(
            "post has no target community".to_string(),
        ));
    }

    let title = sanitize_text(&post.title);

    match post.content_kind {
        ContentKind::Text => Ok(SubmitRequest {
            subreddit: post.subreddit.clone(),
            kind: SubmitKind::SelfPost,
            title,
            body: Some(sanitize_text(post.body.as_deref().unwrap_or(""))),
            url: None,
        }),
        ContentKind::Link => {
            let raw = post.body.as_deref().filter(|s| !s.trim().is_empty()).ok_or_else(|| {
                ApiError::Validation("link post has no URL".to_string())
            })?;
            let url = validate_url(raw)?;
            Ok(SubmitRequest {
                subreddit: post.subreddit.clone(),
                kind: SubmitKind::Link,
                title,
                body: None,
                url: Some(url.to_string()),
            })
        }
        ContentKind::Image => {
            let raw = post
                .media_url
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::Validation("image post has no media reference".to_string())
                })?;
            let url = validate_url(raw)?;
            // Caption rides along as sanitized text when present
            let caption = post
                .body
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(sanitize_text);
            Ok(SubmitRequest {
                subreddit: post.subreddit.clone(),
                kind: SubmitKind::Link,
                title,
                body: caption,
                url: Some(url.to_string()),
            })
        }
    }
}

/// Strip markup and markdown control characters from free text.
///
/// Angle-bracket tag spans are dropped wholesale, so injected `<script>`
/// blocks lose their tags; the remaining markdown control characters are
/// removed so the upstream cannot reinterpret injected formatting.
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;

    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            '\\' | '*' | '_' | '~' | '`' => {}
            _ => out.push(ch),
        }
    }

    out
}

/// Parse and validate a URL field.
///
/// Only `http` and `https` schemes pass; everything else (including
/// `javascript:`) is rejected here, before any request is issued.
pub fn validate_url(raw: &str) -> Result<Url, ApiError> {
    let parsed = Url::parse(raw.trim())
        .map_err(|e| ApiError::Validation(format!("invalid URL '{}': {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ApiError::Validation(format!(
            "unsupported URL scheme '{}'",
            other
        ))),
    }
}

/// Form fields for the submit endpoint.
pub fn form_fields(request: &SubmitRequest) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("api_type", "json".to_string()),
        ("sr", request.subreddit.clone()),
        ("kind", request.kind.as_str().to_string()),
        ("title", request.title.clone()),
        ("resubmit", "true".to_string()),
    ];

    if let Some(body) = &request.body {
        fields.push(("text", body.clone()));
    }
    if let Some(url) = &request.url {
        fields.push(("url", url.clone()));
    }

    fields
}

/// Extract the created post's id and permalink from a submit response.
///
/// The upstream answers in several shapes depending on endpoint version and
/// error path. Parsers are tried in order: the nested `json.data` envelope,
/// flat top-level fields, then a heuristic scan over all keys. That
/// inconsistency belongs to the upstream; do not collapse the strategies.
pub fn parse_submit_response(value: &serde_json::Value) -> Option<SubmissionOutcome> {
    parse_nested(value)
        .or_else(|| parse_flat(value))
        .or_else(|| parse_scan(value))
}

/// Shape 1: `{"json": {"data": {"id": ..., "name": ..., "url": ...}}}`
fn parse_nested(value: &serde_json::Value) -> Option<SubmissionOutcome> {
    let data = value.get("json")?.get("data")?;
    let id = string_field(data, "name").or_else(|| string_field(data, "id"))?;
    let permalink = string_field(data, "url").or_else(|| string_field(data, "permalink"));
    Some(SubmissionOutcome {
        reddit_post_id: id,
        permalink,
    })
}

/// Shape 2: flat `{"id": ..., "name": ..., "permalink": ...}`
fn parse_flat(value: &serde_json::Value) -> Option<SubmissionOutcome> {
    let id = string_field(value, "name").or_else(|| string_field(value, "id"))?;
    let permalink = string_field(value, "permalink").or_else(|| string_field(value, "url"));
    Some(SubmissionOutcome {
        reddit_post_id: id,
        permalink,
    })
}

/// Shape 3: fallback heuristic scanning every key for an id-like field.
fn parse_scan(value: &serde_json::Value) -> Option<SubmissionOutcome> {
    fn scan(value: &serde_json::Value, id: &mut Option<String>, permalink: &mut Option<String>) {
        if let Some(object) = value.as_object() {
            for (key, v) in object {
                let lower = key.to_lowercase();
                if let Some(s) = v.as_str() {
                    if id.is_none() && (lower == "name" || lower.ends_with("id")) && !s.is_empty() {
                        *id = Some(s.to_string());
                    }
                    if permalink.is_none()
                        && (lower.contains("permalink") || lower.contains("url"))
                        && !s.is_empty()
                    {
                        *permalink = Some(s.to_string());
                    }
                } else {
                    scan(v, id, permalink);
                }
            }
        } else if let Some(array) = value.as_array() {
            for v in array {
                scan(v, id, permalink);
            }
        }
    }

    let mut id = None;
    let mut permalink = None;
    scan(value, &mut id, &mut permalink);

    id.map(|reddit_post_id| SubmissionOutcome {
        reddit_post_id,
        permalink,
    })
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Extract the most specific error message a non-2xx body allows.
///
/// Tries the structured `errors` array, then `message`, then `error`, before
/// falling back to the raw response text.
pub fn parse_error_body(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let errors = value
            .get("json")
            .and_then(|j| j.get("errors"))
            .or_else(|| value.get("errors"));
        if let Some(list) = errors.and_then(|e| e.as_array()) {
            let rendered: Vec<String> = list
                .iter()
                .map(|entry| match entry.as_array() {
                    Some(parts) => parts
                        .iter()
                        .filter_map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(": "),
                    None => entry.to_string(),
                })
                .filter(|s| !s.is_empty())
                .collect();
            if !rendered.is_empty() {
                return rendered.join("; ");
            }
        }

        if let Some(message) = value.get("message").and_then(|v| v.as_str()) {
            return message.to_string();
        }
        if let Some(error) = value.get("error") {
            if let Some(s) = error.as_str() {
                return s.to_string();
            }
            return error.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        let mut snippet: String = trimmed.chars().take(200).collect();
        if snippet.len() < trimmed.len() {
            snippet.push_str("...");
        }
        snippet
    }
}
