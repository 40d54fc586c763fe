mod support;

use support::{build_harness, now_ts};
use tokio_util::sync::CancellationToken;
use tubelater_server::platform::DiscoveredVideo;
use tubelater_server::storage::{StorageBackend, WebhookEventRecord, SOURCE_WEBHOOK};

fn video(id: &str, published_at: f64) -> DiscoveredVideo {
    DiscoveredVideo {
        video_id: id.to_string(),
        title: format!("video {id}"),
        published_at,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poller_skips_videos_the_webhook_already_queued() {
    let harness = build_harness();
    harness.seed_user("U1", Some("PL1"));
    harness.seed_subscription("U1", "CH1");
    let now = now_ts();

    // The hub delivered VID1 before the polling pass ran.
    let delivered = WebhookEventRecord::new(
        "CH1",
        "VID1",
        Some("video VID1".to_string()),
        SOURCE_WEBHOOK,
        String::new(),
        now - 60.0,
    );
    harness.storage.insert_webhook_event(&delivered).unwrap();

    harness.platform.set_search_results(
        "CH1",
        vec![video("VID1", now - 120.0), video("VID2", now - 30.0)],
    );

    let discovered = harness
        .state
        .poller
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(discovered, 1);

    let events = harness.storage.list_unprocessed_events(10).unwrap();
    assert_eq!(events.len(), 2);
    let polled = events
        .iter()
        .find(|event| event.video_id == "VID2")
        .expect("synthesized event");
    assert_eq!(polled.source, "Polling");

    harness
        .state
        .processor
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    // One insert per video even though discovery came from two paths.
    assert_eq!(harness.platform.insert_count(), 2);
    let webhook_row = harness
        .storage
        .get_processed_video("U1", "VID1")
        .unwrap()
        .unwrap();
    assert_eq!(webhook_row.source, "Webhook");
    let polled_row = harness
        .storage
        .get_processed_video("U1", "VID2")
        .unwrap()
        .unwrap();
    assert_eq!(polled_row.source, "Polling");
    assert!(polled_row.added_to_playlist);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_marker_prevents_rediscovery() {
    let harness = build_harness();
    harness.seed_user("U1", Some("PL1"));
    harness.seed_subscription("U1", "CH1");
    let now = now_ts();
    harness.platform.set_search_results(
        "CH1",
        vec![video("VID1", now - 120.0), video("VID2", now - 30.0)],
    );

    let discovered = harness
        .state
        .poller
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(discovered, 2);

    let subscription = harness.storage.get_subscription("U1", "CH1").unwrap().unwrap();
    assert_eq!(subscription.last_polled_video_id.as_deref(), Some("VID2"));
    assert!(subscription.last_polled_at.is_some());

    // Next interval: same search window, nothing new past the marker.
    let later = now + 3700.0;
    let discovered = harness
        .state
        .poller
        .tick(later, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(discovered, 0);
    assert_eq!(harness.storage.list_unprocessed_events(10).unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recently_polled_healthy_channels_wait_for_the_interval() {
    let harness = build_harness();
    harness.seed_user("U1", Some("PL1"));
    let mut subscription = harness.seed_subscription("U1", "CH1");
    let now = now_ts();
    subscription.websub_subscribed = true;
    subscription.lease_expires_at = Some(now + 86_400.0);
    subscription.last_polled_at = Some(now - 60.0);
    harness.storage.upsert_subscription(&subscription).unwrap();
    harness
        .platform
        .set_search_results("CH1", vec![video("VID1", now - 30.0)]);

    let discovered = harness
        .state
        .poller
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(discovered, 0);
    assert!(harness.storage.list_unprocessed_events(10).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_insert_is_recorded_and_not_retried() {
    let harness = build_harness();
    harness.seed_user("U1", Some("PL1"));
    harness.seed_subscription("U1", "CH1");
    harness
        .platform
        .insert_fails
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let now = now_ts();
    let event = WebhookEventRecord::new(
        "CH1",
        "VID1",
        Some("gone".to_string()),
        SOURCE_WEBHOOK,
        String::new(),
        now,
    );
    harness.storage.insert_webhook_event(&event).unwrap();

    harness
        .state
        .processor
        .tick(now, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(harness.platform.insert_count(), 1);
    let row = harness
        .storage
        .get_processed_video("U1", "VID1")
        .unwrap()
        .unwrap();
    assert!(!row.added_to_playlist);
    assert!(row.error_message.unwrap().contains("not found"));
    // The event is consumed; a later event for the same video stays a no-op.
    assert!(harness.storage.list_unprocessed_events(10).unwrap().is_empty());

    let repeat = WebhookEventRecord::new(
        "CH1",
        "VID1",
        Some("gone".to_string()),
        SOURCE_WEBHOOK,
        String::new(),
        now + 1.0,
    );
    harness.storage.insert_webhook_event(&repeat).unwrap();
    harness
        .state
        .processor
        .tick(now + 2.0, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(harness.platform.insert_count(), 1);

    let failed = harness.storage.list_failed_jobs(now - 10.0, 50).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].video_id, "VID1");
}
