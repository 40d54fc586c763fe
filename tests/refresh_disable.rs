mod support;

use std::sync::atomic::Ordering;
use support::{build_harness, notification_xml, now_ts};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tubelater_server::api;
use tubelater_server::storage::StorageBackend;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_refresh_disables_automation_and_keeps_the_refresh_token() {
    let harness = build_harness();
    let mut user = harness.seed_user("U2", Some("PL2"));
    user.token_expires_at = Some(now_ts() + 60.0);
    harness.storage.upsert_user(&user).unwrap();
    harness.seed_subscription("U2", "CH2");
    harness.platform.refresh_fails.store(true, Ordering::SeqCst);

    harness
        .state
        .refresher
        .tick(now_ts(), &CancellationToken::new())
        .await
        .unwrap();

    let reloaded = harness.storage.get_user("U2").unwrap().unwrap();
    assert!(reloaded.automation_disabled);
    // The refresh token survives so an out-of-band re-consent can revive the user.
    assert_eq!(reloaded.refresh_token, user.refresh_token);

    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/webhook")
                .body(axum::body::Body::from(notification_xml("CH2", "VID2", "t")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    harness
        .state
        .processor
        .tick(now_ts(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(harness.platform.insert_count(), 0);
    assert!(harness.storage.get_processed_video("U2", "VID2").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_to_back_refresh_ticks_are_idempotent() {
    let harness = build_harness();
    let now = now_ts();
    let mut user = harness.seed_user("U3", Some("PL3"));
    user.token_expires_at = Some(now + 10.0 * 60.0);
    harness.storage.upsert_user(&user).unwrap();

    let refreshed = harness
        .state
        .refresher
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(refreshed, 1);
    assert_eq!(harness.platform.refresh_count(), 1);

    let after_first = harness.storage.get_user("U3").unwrap().unwrap();
    assert_ne!(after_first.access_token, user.access_token);
    let expires_at = after_first.token_expires_at.unwrap();
    assert!((expires_at - (now + 3600.0)).abs() < 1.0);

    // The fresh expiry sits outside the 30-minute buffer, so nothing happens.
    let refreshed = harness
        .state
        .refresher
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(refreshed, 0);
    assert_eq!(harness.platform.refresh_count(), 1);
    let after_second = harness.storage.get_user("U3").unwrap().unwrap();
    assert_eq!(after_second.access_token, after_first.access_token);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expiry_exactly_on_the_buffer_boundary_is_refreshed() {
    let harness = build_harness();
    let now = now_ts();
    let mut user = harness.seed_user("U4", None);
    user.token_expires_at = Some(now + 30.0 * 60.0);
    harness.storage.upsert_user(&user).unwrap();

    let refreshed = harness
        .state
        .refresher
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(refreshed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_expiry_with_refresh_token_is_refreshed() {
    let harness = build_harness();
    let mut user = harness.seed_user("U5", None);
    user.token_expires_at = None;
    harness.storage.upsert_user(&user).unwrap();

    let refreshed = harness
        .state
        .refresher
        .tick(now_ts(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(refreshed, 1);
    assert_eq!(harness.platform.refresh_count(), 1);
}
