mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use support::{build_harness, notification_xml, now_ts};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tubelater_server::api;
use tubelater_server::storage::StorageBackend;

fn post_notification(body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/atom+xml")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_delivery_lands_in_the_playlist() {
    let harness = build_harness();
    harness.seed_user("U1", Some("PL1"));
    harness.seed_subscription("U1", "CH1");

    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(post_notification(notification_xml("CH1", "VID1", "Hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = harness.storage.list_unprocessed_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].channel_id, "CH1");
    assert_eq!(events[0].video_id, "VID1");
    assert_eq!(events[0].source, "Webhook");

    let processed = harness
        .state
        .processor
        .tick(now_ts(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(processed, 1);

    let calls = harness.platform.insert_calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("PL1".to_string(), "VID1".to_string())]);

    let row = harness
        .storage
        .get_processed_video("U1", "VID1")
        .unwrap()
        .expect("outcome row");
    assert!(row.added_to_playlist);
    assert_eq!(row.channel_id, "CH1");
    assert_eq!(row.title.as_deref(), Some("Hello"));
    assert_eq!(row.source, "Webhook");
    assert!(row.error_message.is_none());

    assert!(harness.storage.list_unprocessed_events(10).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_delivery_inserts_once() {
    let harness = build_harness();
    harness.seed_user("U1", Some("PL1"));
    harness.seed_subscription("U1", "CH1");

    for _ in 0..2 {
        let app = api::build_router(harness.state.clone());
        let response = app
            .oneshot(post_notification(notification_xml("CH1", "VID1", "Hello")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(harness.storage.list_unprocessed_events(10).unwrap().len(), 2);

    let processed = harness
        .state
        .processor
        .tick(now_ts(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(processed, 2);

    assert_eq!(harness.platform.insert_count(), 1);
    let row = harness
        .storage
        .get_processed_video("U1", "VID1")
        .unwrap()
        .expect("outcome row");
    assert!(row.added_to_playlist);
    assert!(harness.storage.list_unprocessed_events(10).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_without_subscribers_is_drained_quietly() {
    let harness = build_harness();

    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(post_notification(notification_xml("CHX", "VIDX", "Nobody")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let processed = harness
        .state
        .processor
        .tick(now_ts(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(processed, 1);
    assert_eq!(harness.platform.insert_count(), 0);
    assert!(harness.storage.list_unprocessed_events(10).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn excluded_and_disabled_users_are_not_fanned_out() {
    let harness = build_harness();
    harness.seed_user("U1", Some("PL1"));
    harness.seed_subscription("U1", "CH1");
    harness
        .storage
        .set_subscription_included("U1", "CH1", false)
        .unwrap();

    let disabled = harness.seed_user("U2", Some("PL2"));
    harness.seed_subscription("U2", "CH1");
    harness
        .storage
        .set_automation_disabled(&disabled.user_id, true, now_ts())
        .unwrap();

    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(post_notification(notification_xml("CH1", "VID1", "Hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    harness
        .state
        .processor
        .tick(now_ts(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(harness.platform.insert_count(), 0);
    assert!(harness.storage.get_processed_video("U1", "VID1").unwrap().is_none());
    assert!(harness.storage.get_processed_video("U2", "VID1").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hub_verification_echoes_the_challenge() {
    let harness = build_harness();
    let app = api::build_router(harness.state.clone());
    let uri = "/webhook?hub.mode=subscribe&hub.challenge=abc123&hub.topic=https://www.youtube.com/xml/feeds/videos.xml?channel_id=CH1";
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"abc123");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verification_rejects_foreign_topics_and_missing_params() {
    let harness = build_harness();

    let app = api::build_router(harness.state.clone());
    let foreign = "/webhook?hub.mode=subscribe&hub.challenge=abc&hub.topic=https://evil.example.com/feed";
    let response = app
        .oneshot(Request::builder().uri(foreign).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhook?hub.mode=subscribe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_notification_bodies_get_the_right_status() {
    let harness = build_harness();

    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(post_notification(String::new()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Malformed XML answers 5xx so the hub keeps retrying the delivery.
    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(post_notification("<feed><entry>".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let app = api::build_router(harness.state.clone());
    let response = app
        .oneshot(post_notification(
            "<feed><entry><title>no ids</title></entry></feed>".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    assert!(harness.storage.list_unprocessed_events(10).unwrap().is_empty());
}
