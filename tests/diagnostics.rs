mod support;

use support::{build_harness, now_ts, temp_storage};
use tubelater_server::storage::{
    ProcessedVideoRecord, StorageBackend, WebhookEventRecord, SOURCE_POLLING, SOURCE_WEBHOOK,
};

fn outcome_row(user_id: &str, video_id: &str, added: bool, processed_at: f64) -> ProcessedVideoRecord {
    ProcessedVideoRecord {
        id: uuid::Uuid::new_v4().simple().to_string(),
        user_id: user_id.to_string(),
        video_id: video_id.to_string(),
        channel_id: "CH1".to_string(),
        title: None,
        processed_at,
        added_to_playlist: added,
        error_message: if added { None } else { Some("quota exceeded: 429".to_string()) },
        retry_count: 1,
        source: SOURCE_WEBHOOK.to_string(),
    }
}

#[test]
fn quota_upsert_accumulates_within_a_day() {
    let storage = temp_storage();
    storage.record_api_usage("youtube", 1, 50).unwrap();
    storage.record_api_usage("youtube", 2, 100).unwrap();

    let rows = storage.list_quota_usage(1).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].service, "youtube");
    assert_eq!(rows[0].requests_used, 3);
    assert_eq!(rows[0].cost_units_used, 150);
    assert_eq!(rows[0].quota_limit, 10_000);
}

#[test]
fn summary_counts_the_pipeline_state() {
    let harness = build_harness();
    let now = now_ts();
    harness.seed_user("U1", Some("PL1"));
    let mut subscription = harness.seed_subscription("U1", "CH1");
    subscription.websub_subscribed = true;
    subscription.lease_expires_at = Some(now + 86_400.0);
    harness.storage.upsert_subscription(&subscription).unwrap();

    let pending = WebhookEventRecord::new("CH1", "VID1", None, SOURCE_WEBHOOK, String::new(), now);
    harness.storage.insert_webhook_event(&pending).unwrap();
    let mut drained =
        WebhookEventRecord::new("CH1", "VID2", None, SOURCE_POLLING, String::new(), now - 60.0);
    drained.processed = true;
    drained.processed_at = Some(now);
    harness.storage.insert_webhook_event(&drained).unwrap();

    harness
        .storage
        .insert_processed_video(&outcome_row("U1", "VID2", true, now - 30.0))
        .unwrap();
    harness
        .storage
        .insert_processed_video(&outcome_row("U1", "VID3", false, now - 20.0))
        .unwrap();

    let summary = harness.storage.pipeline_summary(now).unwrap();
    assert_eq!(summary.active_subscriptions, 1);
    assert_eq!(summary.websub_active, 1);
    assert_eq!(summary.failed_jobs_24h, 1);
    assert_eq!(summary.unprocessed_events_24h, 1);
    assert_eq!(summary.processed_7d, 2);
    assert_eq!(summary.events_received_24h, 2);
    assert!((summary.success_rate_7d - 0.5).abs() < f64::EPSILON);
}

#[test]
fn failed_jobs_listing_is_scoped_to_the_window() {
    let storage = temp_storage();
    let now = now_ts();
    storage
        .insert_processed_video(&outcome_row("U1", "OLD", false, now - 9.0 * 86_400.0))
        .unwrap();
    storage
        .insert_processed_video(&outcome_row("U1", "NEW", false, now - 3600.0))
        .unwrap();
    storage
        .insert_processed_video(&outcome_row("U1", "OK", true, now - 3600.0))
        .unwrap();

    let failed = storage.list_failed_jobs(now - 86_400.0, 100).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].video_id, "NEW");
}

#[test]
fn duplicate_outcome_rows_collapse_onto_the_unique_index() {
    let storage = temp_storage();
    let now = now_ts();
    assert!(storage
        .insert_processed_video(&outcome_row("U1", "VID1", true, now))
        .unwrap());
    // Same (user, video): swallowed, not an error.
    assert!(!storage
        .insert_processed_video(&outcome_row("U1", "VID1", false, now + 1.0))
        .unwrap());
    let row = storage.get_processed_video("U1", "VID1").unwrap().unwrap();
    assert!(row.added_to_playlist);
}
