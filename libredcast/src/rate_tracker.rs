//! Per-credential sliding-window request counting
//!
//! Tracks how many requests each credential has made in the current fixed
//! window. Two layers: an in-memory map as the fast path, and a durable
//! `usage_windows` row per bucket so that multiple service instances sharing
//! a credential pool see each other's traffic.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

use crate::db::Database;
use crate::error::Result;

/// Fixed window size in seconds
pub const WINDOW_SECS: i64 = 60;

/// Fraction of the quota at which a credential should be rotated away from,
/// in percent. Waiting for an upstream 429 instead would burn a request and
/// a full backoff cycle.
const NEAR_LIMIT_PERCENT: u32 = 80;

struct MemWindow {
    window_start: i64,
    count: u32,
}

pub struct RateTracker {
    db: Database,
    quota: u32,
    windows: Mutex<HashMap<String, MemWindow>>,
}

impl RateTracker {
    pub fn new(db: Database, quota: u32) -> Self {
        Self {
            db,
            quota,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Get the window start timestamp (floor to the window size)
    pub fn window_start(now: i64) -> i64 {
        (now / WINDOW_SECS) * WINDOW_SECS
    }

    /// Record one request for a credential.
    ///
    /// Increments the in-memory counter and the durable counter row for the
    /// current bucket. A durable-write failure is logged and swallowed; the
    /// in-memory counter stays authoritative for this process.
    pub async fn record(&self, credential_id: &str, endpoint: &str, now: i64) {
        let window_start = Self::window_start(now);

        {
            let mut windows = self.windows.lock().unwrap();
            let entry = windows
                .entry(credential_id.to_string())
                .or_insert(MemWindow {
                    window_start,
                    count: 0,
                });
            if entry.window_start != window_start {
                // Rolled over; the stale bucket is superseded, not cleared
                entry.window_start = window_start;
                entry.count = 0;
            }
            entry.count += 1;
        }

        if let Err(e) = self
            .db
            .increment_usage_window(credential_id, window_start, endpoint, now)
            .await
        {
            warn!(
                "Durable usage counter write failed for {}: {}",
                credential_id, e
            );
        }
    }

    /// Requests recorded for this credential in the current window.
    pub fn current_count(&self, credential_id: &str, now: i64) -> u32 {
        let window_start = Self::window_start(now);
        let windows = self.windows.lock().unwrap();

        match windows.get(credential_id) {
            Some(w) if w.window_start == window_start => w.count,
            _ => 0,
        }
    }

    /// Whether the credential has reached the proactive-rotation threshold.
    ///
    /// This is not a hard block; it tells the selector to prefer a colder
    /// credential before the upstream starts returning 429s.
    pub fn is_near_limit(&self, credential_id: &str, now: i64) -> bool {
        self.current_count(credential_id, now) * 100 >= self.quota * NEAR_LIMIT_PERCENT
    }

    /// Durable request count for the credential's current window.
    ///
    /// Reads the cross-process counter table rather than the in-memory map;
    /// the selector uses this as its tie-breaker so instances sharing the
    /// pool agree on load.
    pub async fn durable_count(&self, credential_id: &str, now: i64) -> Result<i64> {
        self.db
            .usage_window_count(credential_id, Self::window_start(now))
            .await
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_counts_start_at_zero() {
        let (_temp, db) = setup_test_db().await;
        let tracker = RateTracker::new(db, 60);

        assert_eq!(tracker.current_count("c1", 1_000_000), 0);
        assert!(!tracker.is_near_limit("c1", 1_000_000));
    }

    #[tokio::test]
    async fn test_record_increments_both_layers() {
        let (_temp, db) = setup_test_db().await;
        let tracker = RateTracker::new(db.clone(), 60);
        let now = 1_000_000;

        for _ in 0..5 {
            tracker.record("c1", "/api/submit", now).await;
        }

        assert_eq!(tracker.current_count("c1", now), 5);
        assert_eq!(tracker.durable_count("c1", now).await.unwrap(), 5);
        assert_eq!(
            db.usage_window_count("c1", RateTracker::window_start(now))
                .await
                .unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn test_durable_row_tracks_last_request() {
        let (_temp, db) = setup_test_db().await;
        let tracker = RateTracker::new(db.clone(), 60);

        tracker.record("c1", "/api/submit", 1_000_000).await;
        tracker.record("c1", "/user/submitted", 1_000_005).await;

        let window = db
            .get_usage_window("c1", RateTracker::window_start(1_000_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(window.request_count, 2);
        assert_eq!(window.last_request_at, Some(1_000_005));
        assert_eq!(window.last_endpoint.as_deref(), Some("/user/submitted"));
    }

    #[tokio::test]
    async fn test_near_limit_threshold() {
        let (_temp, db) = setup_test_db().await;
        let tracker = RateTracker::new(db, 60);
        let now = 1_000_000;

        for _ in 0..47 {
            tracker.record("c1", "/api/submit", now).await;
        }
        assert!(!tracker.is_near_limit("c1", now), "47/60 is under 80%");

        tracker.record("c1", "/api/submit", now).await;
        assert!(tracker.is_near_limit("c1", now), "48/60 hits 80%");
    }

    #[tokio::test]
    async fn test_window_rollover_resets_memory_counter() {
        let (_temp, db) = setup_test_db().await;
        let tracker = RateTracker::new(db.clone(), 60);
        let first_window = 1_000_020;

        for _ in 0..10 {
            tracker.record("c1", "/api/submit", first_window).await;
        }

        let next_window = first_window + WINDOW_SECS;
        assert_eq!(tracker.current_count("c1", next_window), 0);

        tracker.record("c1", "/api/submit", next_window).await;
        assert_eq!(tracker.current_count("c1", next_window), 1);

        // The previous durable bucket is superseded, not rewritten
        assert_eq!(
            db.usage_window_count("c1", RateTracker::window_start(first_window))
                .await
                .unwrap(),
            10
        );
        assert_eq!(
            db.usage_window_count("c1", RateTracker::window_start(next_window))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_credentials_are_independent() {
        let (_temp, db) = setup_test_db().await;
        let tracker = RateTracker::new(db, 10);
        let now = 1_000_000;

        for _ in 0..8 {
            tracker.record("hot", "/api/submit", now).await;
        }
        tracker.record("cold", "/api/submit", now).await;

        assert!(tracker.is_near_limit("hot", now));
        assert!(!tracker.is_near_limit("cold", now));
        assert_eq!(tracker.current_count("cold", now), 1);
    }

    #[tokio::test]
    async fn test_durable_counter_survives_new_tracker() {
        let (_temp, db) = setup_test_db().await;
        let now = 1_000_000;

        {
            let tracker = RateTracker::new(db.clone(), 60);
            for _ in 0..3 {
                tracker.record("c1", "/api/submit", now).await;
            }
        }

        // A fresh tracker (new process) has no in-memory state but still
        // sees the shared durable count.
        let tracker = RateTracker::new(db, 60);
        assert_eq!(tracker.current_count("c1", now), 0);
        assert_eq!(tracker.durable_count("c1", now).await.unwrap(), 3);
    }
}
