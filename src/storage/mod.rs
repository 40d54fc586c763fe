// Storage layer: one schema over SQLite/Postgres behind a blocking trait.
// The database is the single source of truth; loops coordinate through it.

mod postgres;
mod sqlite;

use crate::config::StorageConfig;
use anyhow::{anyhow, Result};

pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

pub const SOURCE_WEBHOOK: &str = "Webhook";
pub const SOURCE_POLLING: &str = "Polling";
pub const SOURCE_MANUAL: &str = "Manual";

#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub user_id: String,
    /// Vault opaques; None/empty means the token is absent.
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<f64>,
    pub playlist_id: Option<String>,
    pub automation_disabled: bool,
    pub is_admin: bool,
    pub created_at: f64,
    pub updated_at: f64,
}

impl UserRecord {
    pub fn has_access_token(&self) -> bool {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .is_some()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_title: String,
    pub included: bool,
    pub created_at: f64,
    pub websub_subscribed: bool,
    pub lease_expires_at: Option<f64>,
    pub attempt_count: i64,
    pub last_attempt_at: Option<f64>,
    pub websub_secret: Option<String>,
    pub polling_enabled: bool,
    pub last_polled_at: Option<f64>,
    pub last_polled_video_id: Option<String>,
}

impl SubscriptionRecord {
    pub fn new(user_id: &str, channel_id: &str, channel_title: &str, now: f64) -> Self {
        Self {
            subscription_id: uuid::Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            channel_title: channel_title.to_string(),
            included: true,
            created_at: now,
            websub_subscribed: false,
            lease_expires_at: None,
            attempt_count: 0,
            last_attempt_at: None,
            websub_secret: None,
            polling_enabled: true,
            last_polled_at: None,
            last_polled_video_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub channel_id: String,
    pub video_id: String,
    pub title: Option<String>,
    pub source: String,
    pub received_at: f64,
    pub processed: bool,
    pub processed_at: Option<f64>,
    pub raw_payload: String,
}

impl WebhookEventRecord {
    pub fn new(
        channel_id: &str,
        video_id: &str,
        title: Option<String>,
        source: &str,
        raw_payload: String,
        now: f64,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            channel_id: channel_id.to_string(),
            video_id: video_id.to_string(),
            title,
            source: source.to_string(),
            received_at: now,
            processed: false,
            processed_at: None,
            raw_payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedVideoRecord {
    pub id: String,
    pub user_id: String,
    pub video_id: String,
    pub channel_id: String,
    pub title: Option<String>,
    pub processed_at: f64,
    pub added_to_playlist: bool,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct QuotaUsageRecord {
    pub usage_date: String,
    pub service: String,
    pub requests_used: i64,
    pub quota_limit: i64,
    pub cost_units_used: i64,
    pub cost_unit_limit: i64,
    pub last_updated: f64,
}

/// Flat join row for the fan-out: every user an event maps onto, with the
/// fields needed to insert, in one query.
#[derive(Debug, Clone)]
pub struct FanoutTarget {
    pub user_id: String,
    pub playlist_id: String,
    pub access_token: String,
}

/// A subscription due for polling together with its owner's encrypted token.
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub subscription: SubscriptionRecord,
    pub access_token: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub active_subscriptions: i64,
    pub websub_active: i64,
    pub failed_jobs_24h: i64,
    pub unprocessed_events_24h: i64,
    pub processed_7d: i64,
    pub success_rate_7d: f64,
    pub events_received_24h: i64,
}

pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn upsert_user(&self, record: &UserRecord) -> Result<()>;
    fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>>;
    /// Users with a refresh token whose automation is still enabled.
    fn list_refreshable_users(&self) -> Result<Vec<UserRecord>>;
    /// Persists a refreshed grant and re-enables automation. The stored
    /// refresh token is replaced only when the grant rotated it.
    fn update_user_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: f64,
        now: f64,
    ) -> Result<()>;
    fn set_automation_disabled(&self, user_id: &str, disabled: bool, now: f64) -> Result<()>;
    fn set_user_playlist(&self, user_id: &str, playlist_id: &str, now: f64) -> Result<()>;

    fn upsert_subscription(&self, record: &SubscriptionRecord) -> Result<()>;
    fn get_subscription(&self, user_id: &str, channel_id: &str)
        -> Result<Option<SubscriptionRecord>>;
    fn list_user_subscriptions(&self, user_id: &str) -> Result<Vec<SubscriptionRecord>>;
    fn delete_subscription(&self, user_id: &str, channel_id: &str) -> Result<i64>;
    fn set_subscription_included(
        &self,
        user_id: &str,
        channel_id: &str,
        included: bool,
    ) -> Result<Option<SubscriptionRecord>>;

    /// Union of never-subscribed, lease-near-expiry and backoff-elapsed rows,
    /// capped at `max_attempts`. Rows inside their backoff window are excluded
    /// by the query itself, which also keeps concurrent instances from
    /// hammering the same row.
    fn list_websub_due(&self, now: f64, max_attempts: i64) -> Result<Vec<SubscriptionRecord>>;
    fn record_subscribe_attempt(&self, subscription_id: &str, now: f64) -> Result<()>;
    fn set_websub_secret(&self, subscription_id: &str, secret: &str) -> Result<()>;
    fn mark_subscribed(&self, subscription_id: &str, lease_expires_at: f64) -> Result<()>;
    fn reset_websub_state(&self, subscription_id: &str) -> Result<()>;
    fn mark_unsubscribed(&self, subscription_id: &str) -> Result<()>;
    fn list_channel_secrets(&self, channel_id: &str) -> Result<Vec<String>>;

    fn list_polling_due(&self, now: f64, interval_s: f64) -> Result<Vec<PollTarget>>;
    fn update_poll_state(
        &self,
        subscription_id: &str,
        last_video_id: Option<&str>,
        now: f64,
    ) -> Result<()>;

    fn insert_webhook_event(&self, record: &WebhookEventRecord) -> Result<()>;
    fn webhook_event_exists(&self, channel_id: &str, video_id: &str) -> Result<bool>;
    fn list_unprocessed_events(&self, limit: i64) -> Result<Vec<WebhookEventRecord>>;
    fn mark_event_processed(&self, event_id: &str, now: f64) -> Result<()>;

    fn processed_video_exists(&self, user_id: &str, video_id: &str) -> Result<bool>;
    fn get_processed_video(
        &self,
        user_id: &str,
        video_id: &str,
    ) -> Result<Option<ProcessedVideoRecord>>;
    /// Returns false when a row for (user, video) already exists; the unique
    /// index makes the duplicate a no-op instead of an error.
    fn insert_processed_video(&self, record: &ProcessedVideoRecord) -> Result<bool>;
    fn list_fanout_targets(&self, channel_id: &str) -> Result<Vec<FanoutTarget>>;

    fn record_api_usage(&self, service: &str, requests: i64, cost_units: i64) -> Result<()>;
    fn pipeline_summary(&self, now: f64) -> Result<PipelineSummary>;
    fn list_quota_usage(&self, days: i64) -> Result<Vec<QuotaUsageRecord>>;
    fn list_failed_jobs(&self, since: f64, limit: i64) -> Result<Vec<ProcessedVideoRecord>>;
    fn list_unprocessed_since(&self, since: f64) -> Result<Vec<WebhookEventRecord>>;
}

pub fn build_storage(config: &StorageConfig) -> Result<std::sync::Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(std::sync::Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        "postgres" | "postgresql" | "pg" => Ok(std::sync::Arc::new(PostgresStorage::new(
            config.postgres.dsn.clone(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?)),
        "sqlserver" | "mssql" => Err(anyhow!(
            "sql server is not supported by this build; use sqlite or postgres"
        )),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}

pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub(crate) fn today_string() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

pub(crate) fn date_cutoff(days: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::days(days.max(0)))
        .format("%Y-%m-%d")
        .to_string()
}
