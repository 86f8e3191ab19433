//! Credential selection and rotation
//!
//! Picks which linked account should carry the next outbound call: the
//! least-recently-used active credential, tie-broken by lowest current-window
//! usage. This spreads load across the pool instead of exhausting one
//! account's quota.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::Result;
use crate::rate_tracker::RateTracker;
use crate::tokens::API_EXPIRY_MARGIN_SECS;
use crate::types::Credential;

pub struct AccountSelector {
    db: Database,
    rate: Arc<RateTracker>,
    /// Credential carrying calls that are not bound to a specific post
    current: RwLock<Option<String>>,
    /// Serializes rotations; a caller that arrives mid-rotation waits here
    rotation: Mutex<()>,
    /// Bumped once per completed rotation so waiting callers can tell that
    /// the rotation they were queued behind already happened
    generation: AtomicU64,
}

impl AccountSelector {
    pub fn new(db: Database, rate: Arc<RateTracker>) -> Self {
        Self {
            db,
            rate,
            current: RwLock::new(None),
            rotation: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Pick the best available credential and stamp it as used.
    ///
    /// The `last_used_at` stamp happens before the caller issues any request,
    /// so a second selection a moment later cannot land on the same
    /// credential. Returns `None` when no usable credential is under the
    /// rotation threshold.
    pub async fn select_best(&self) -> Result<Option<Credential>> {
        let now = chrono::Utc::now().timestamp();
        self.select_best_at(now).await
    }

    pub async fn select_best_at(&self, now: i64) -> Result<Option<Credential>> {
        // Already ordered by last_used_at, never-used first
        let candidates = self.db.list_active_credentials().await?;

        let window_start = RateTracker::window_start(now);
        let usage = self.db.usage_counts_for_window(window_start).await?;

        let mut usable: Vec<Credential> = candidates
            .into_iter()
            .filter(|c| c.usable(now, API_EXPIRY_MARGIN_SECS))
            .collect();

        // Stable sort keeps the LRU order as primary key and breaks ties by
        // current-window usage
        usable.sort_by_key(|c| {
            (
                c.last_used_at.unwrap_or(i64::MIN),
                usage.get(&c.id).copied().unwrap_or(0),
            )
        });

        let chosen = usable
            .into_iter()
            .find(|c| !self.rate.is_near_limit(&c.id, now));

        if let Some(credential) = &chosen {
            self.db
                .touch_credential_last_used(&credential.id, now)
                .await?;
            debug!("Selected credential {} ({})", credential.id, credential.username);
        }

        Ok(chosen)
    }

    /// Id of the credential currently carrying unbound calls.
    pub fn current_id(&self) -> Option<String> {
        self.current.read().unwrap().clone()
    }

    /// Number of rotations that actually ran, for observability.
    pub fn rotations_completed(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Promote a freshly selected credential to current.
    ///
    /// Mutually exclusive under concurrency: callers that arrive while a
    /// rotation is in flight wait for it and adopt its result instead of
    /// running a second selection. Cooperative only; this holds within one
    /// process, while cross-process fairness rests on the durable usage
    /// counters.
    pub async fn rotate(&self) -> Result<Option<String>> {
        let now = chrono::Utc::now().timestamp();
        self.rotate_at(now).await
    }

    pub async fn rotate_at(&self, now: i64) -> Result<Option<String>> {
        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.rotation.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            // A rotation completed while we waited for the guard
            return Ok(self.current_id());
        }

        let chosen = self.select_best_at(now).await?;
        let chosen_id = chosen.map(|c| c.id);

        *self.current.write().unwrap() = chosen_id.clone();
        self.generation.fetch_add(1, Ordering::Release);

        match &chosen_id {
            Some(id) => info!("Rotated current credential to {}", id),
            None => info!("Rotation found no usable credential"),
        }

        Ok(chosen_id)
    }

    /// Current credential if it is still fit to use, otherwise rotate.
    ///
    /// Rotation triggers: no current credential, current no longer usable,
    /// or current at the near-limit threshold.
    pub async fn acquire(&self) -> Result<Option<Credential>> {
        let now = chrono::Utc::now().timestamp();
        self.acquire_at(now).await
    }

    pub async fn acquire_at(&self, now: i64) -> Result<Option<Credential>> {
        if let Some(id) = self.current_id() {
            if let Some(credential) = self.db.get_credential(&id).await? {
                if credential.usable(now, API_EXPIRY_MARGIN_SECS)
                    && !self.rate.is_near_limit(&id, now)
                {
                    return Ok(Some(credential));
                }
            }
            debug!("Current credential {} no longer fit, rotating", id);
        }

        match self.rotate_at(now).await? {
            Some(id) => self.db.get_credential(&id).await,
            None => Ok(None),
        }
    }
}
