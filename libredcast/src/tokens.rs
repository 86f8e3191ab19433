//! OAuth token lifecycle management
//!
//! Validates a credential's access token before use and refreshes it through
//! the upstream token endpoint when it is expired or about to expire.

use std::sync::Arc;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{ApiError, Result};
use crate::reddit::RedditApi;
use crate::types::Credential;

/// Expiry margin used by the scheduling layer. Coarse on purpose: a token
/// must outlive the whole tick that picked it up.
pub const SCHEDULER_EXPIRY_MARGIN_SECS: i64 = 600;

/// Expiry margin used immediately before a direct API call. Finer than the
/// scheduler margin; the two are intentionally independent.
pub const API_EXPIRY_MARGIN_SECS: i64 = 60;

pub struct TokenManager {
    db: Database,
    api: Arc<dyn RedditApi>,
}

impl TokenManager {
    pub fn new(db: Database, api: Arc<dyn RedditApi>) -> Self {
        Self { db, api }
    }

    /// Return a credential whose access token is valid for at least `margin`
    /// seconds, refreshing it if necessary.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Auth` when the credential has no refresh token or
    /// the upstream rejects the refresh. Auth failures are never retried.
    pub async fn ensure_valid(&self, credential: &Credential, margin: i64) -> Result<Credential> {
        let now = chrono::Utc::now().timestamp();
        self.ensure_valid_at(credential, margin, now).await
    }

    pub async fn ensure_valid_at(
        &self,
        credential: &Credential,
        margin: i64,
        now: i64,
    ) -> Result<Credential> {
        if credential.access_token.is_some() && !credential.token_expired(now, margin) {
            return Ok(credential.clone());
        }

        let refresh_token = credential.refresh_token.clone().ok_or_else(|| {
            ApiError::Auth(format!(
                "credential {} has an expired token and no refresh token",
                credential.id
            ))
        })?;

        match self.api.refresh_token(&refresh_token).await {
            Ok(token) => {
                let mut fresh = credential.clone();
                fresh.access_token = Some(token.access_token.clone());
                fresh.token_expires_at = Some(now + token.expires_in);

                // Persist before returning; the caller already holds the
                // fresh token, so a failed write must not fail the call.
                if let Err(e) = self
                    .db
                    .update_credential_token(
                        &fresh.id,
                        &token.access_token,
                        now + token.expires_in,
                    )
                    .await
                {
                    warn!(
                        "Refreshed token for {} but failed to persist it: {}",
                        credential.username, e
                    );
                } else {
                    info!("Refreshed access token for {}", credential.username);
                }

                Ok(fresh)
            }
            Err(e) => {
                // Drop the stored token so the selector re-evaluates this
                // credential from scratch next time.
                if let Err(clear_err) = self.db.clear_credential_token(&credential.id).await {
                    warn!(
                        "Failed to clear token state for {}: {}",
                        credential.id, clear_err
                    );
                }

                Err(ApiError::Auth(format!(
                    "token refresh failed for {}: {}",
                    credential.username, e
                ))
                .into())
            }
        }
    }
}
