//! Multi-account selection and sync integration
//!
//! Exercises the selector and the sync pass together over a pool of linked
//! accounts, including proactive rotation away from hot credentials.

use std::sync::Arc;
use std::time::Duration;

use libredcast::reddit::mock::MockRedditApi;
use libredcast::reddit::{RedditApi, RemotePost};
use libredcast::{
    AccountSelector, Credential, Database, PostSync, RateTracker, RetryPolicy,
};
use tempfile::TempDir;

struct Harness {
    _temp: TempDir,
    db: Database,
    api: Arc<MockRedditApi>,
    rate: Arc<RateTracker>,
    selector: Arc<AccountSelector>,
    sync: PostSync,
}

async fn setup() -> Harness {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("redcast.db");
    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    let api = Arc::new(MockRedditApi::new());
    let rate = Arc::new(RateTracker::new(db.clone(), 60));
    let selector = Arc::new(AccountSelector::new(db.clone(), Arc::clone(&rate)));
    let sync = PostSync::new(
        db.clone(),
        Arc::clone(&api) as Arc<dyn RedditApi>,
        Arc::clone(&selector),
        Arc::clone(&rate),
    )
    .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)));

    Harness {
        _temp: temp,
        db,
        api,
        rate,
        selector,
        sync,
    }
}

async fn seed_credential(db: &Database, id: &str, last_used_at: Option<i64>) {
    let now = chrono::Utc::now().timestamp();
    db.insert_credential(&Credential {
        id: id.to_string(),
        username: format!("user-{}", id),
        access_token: Some("tok".to_string()),
        refresh_token: Some("ref".to_string()),
        token_expires_at: Some(now + 7200),
        active: true,
        last_used_at,
        last_synced_at: None,
    })
    .await
    .unwrap();
}

fn remote_post(id: &str) -> RemotePost {
    RemotePost {
        reddit_post_id: id.to_string(),
        title: format!("Post {}", id),
        subreddit: "rust".to_string(),
        permalink: Some(format!("/r/rust/comments/{}", id)),
        posted_at: Some(1_700_000_000),
    }
}

#[tokio::test]
async fn sync_reads_ride_on_selector_credential() {
    let h = setup().await;
    let now = chrono::Utc::now().timestamp();

    // "cold" has been idle longest, so the selector should route reads
    // through it
    seed_credential(&h.db, "cold", Some(now - 9000)).await;
    seed_credential(&h.db, "warm", Some(now - 10)).await;
    h.api.set_user_posts(vec![remote_post("t3_a")]);

    h.sync.sync_account("warm").await.unwrap();

    assert_eq!(h.selector.current_id().as_deref(), Some("cold"));

    // The read was attributed to the reader credential's window (checking the
    // adjacent bucket too, in case the call straddled a boundary)
    let check = chrono::Utc::now().timestamp();
    let window = RateTracker::window_start(check);
    let counted = h.db.usage_window_count("cold", window).await.unwrap()
        + h.db.usage_window_count("cold", window - 60).await.unwrap();
    assert!(counted >= 1);
}

#[tokio::test]
async fn full_sync_covers_pool_and_rotates_off_hot_reader() {
    let h = setup().await;
    let now = chrono::Utc::now().timestamp();

    seed_credential(&h.db, "a", Some(now - 5000)).await;
    seed_credential(&h.db, "b", Some(now - 50)).await;
    h.api.set_user_posts(vec![remote_post("t3_a"), remote_post("t3_b")]);

    // Make "a" hot enough to trip the proactive threshold
    for _ in 0..48 {
        h.rate.record("a", "/api/submit", now).await;
    }

    let synced = h.sync.sync_all().await.unwrap();
    assert_eq!(synced, 2);

    // The hot credential was never promoted to reader
    assert_eq!(h.selector.current_id().as_deref(), Some("b"));

    for id in ["a", "b"] {
        let cred = h.db.get_credential(id).await.unwrap().unwrap();
        assert!(cred.last_synced_at.is_some(), "account {} was synced", id);
        assert_eq!(h.db.synced_post_count(id).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn sync_is_incremental_across_runs() {
    let h = setup().await;
    seed_credential(&h.db, "only", None).await;

    h.api.set_user_posts(vec![remote_post("t3_a")]);
    assert!(h.sync.sync_account("only").await.unwrap());

    // Nothing new upstream: reported as such, but still recorded
    let stamped_before = h
        .db
        .get_credential("only")
        .await
        .unwrap()
        .unwrap()
        .last_synced_at
        .unwrap();
    assert!(!h.sync.sync_account("only").await.unwrap());
    let stamped_after = h
        .db
        .get_credential("only")
        .await
        .unwrap()
        .unwrap()
        .last_synced_at
        .unwrap();
    assert!(stamped_after >= stamped_before);

    // A large backlog is inserted in bounded batches without loss
    let backlog: Vec<RemotePost> = (0..35).map(|i| remote_post(&format!("t3_n{}", i))).collect();
    h.api.set_user_posts(backlog);
    assert!(h.sync.sync_account("only").await.unwrap());
    assert_eq!(h.db.synced_post_count("only").await.unwrap(), 1 + 35);
}
