// Postgres backend. The trait surface is blocking, so every call checks a
// pooled client out inside `wait`, which drives the query future on the
// ambient runtime when one exists and on a private one otherwise.
use crate::storage::{
    date_cutoff, now_ts, today_string, FanoutTarget, PipelineSummary, PollTarget,
    ProcessedVideoRecord, QuotaUsageRecord, StorageBackend, SubscriptionRecord, UserRecord,
    WebhookEventRecord,
};
use anyhow::{anyhow, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

const FALLBACK_POOL_SIZE: usize = 16;
const DEFAULT_QUOTA_LIMIT: i64 = 10_000;

pub struct PostgresStorage {
    pool: Pool,
    // Drives queries from threads that have no tokio context of their own.
    io_runtime: tokio::runtime::Runtime,
    schema_ready: AtomicBool,
    schema_lock: Mutex<()>,
}

impl PostgresStorage {
    pub fn new(dsn: String, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let dsn = dsn.trim();
        if dsn.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let mut pg_config: tokio_postgres::Config = dsn.parse()?;
        pg_config.connect_timeout(Duration::from_secs(connect_timeout_s.max(1)));
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let size = if pool_size == 0 {
            FALLBACK_POOL_SIZE
        } else {
            pool_size
        };
        let pool = Pool::builder(manager).max_size(size).build()?;
        let io_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|err| anyhow!("postgres bridge runtime: {err}"))?;
        Ok(Self {
            pool,
            io_runtime,
            schema_ready: AtomicBool::new(false),
            schema_lock: Mutex::new(()),
        })
    }

    fn wait<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tokio::task::block_in_place(|| handle.block_on(fut))
        } else {
            self.io_runtime.block_on(fut)
        }
    }

    fn execute(&self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.wait(async {
            let client = self.pool.get().await?;
            Ok(client.execute(query, params).await?)
        })
    }

    fn fetch(&self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.wait(async {
            let client = self.pool.get().await?;
            Ok(client.query(query, params).await?)
        })
    }

    fn fetch_opt(&self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>> {
        self.wait(async {
            let client = self.pool.get().await?;
            Ok(client.query_opt(query, params).await?)
        })
    }

    fn count(&self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<i64> {
        let row = self.wait(async {
            let client = self.pool.get().await?;
            Ok(client.query_one(query, params).await?)
        })?;
        Ok(row.get(0))
    }

    fn create_schema(&self) -> Result<()> {
        self.wait(async {
            let client = self.pool.get().await?;
            client.batch_execute(SCHEMA_SQL).await?;
            Ok(())
        })
    }

    fn map_user(row: &Row) -> UserRecord {
        UserRecord {
            user_id: row.get(0),
            access_token: row.get(1),
            refresh_token: row.get(2),
            token_expires_at: row.get(3),
            playlist_id: row.get(4),
            automation_disabled: row.get(5),
            is_admin: row.get(6),
            created_at: row.get(7),
            updated_at: row.get(8),
        }
    }

    fn map_subscription(row: &Row) -> SubscriptionRecord {
        SubscriptionRecord {
            subscription_id: row.get(0),
            user_id: row.get(1),
            channel_id: row.get(2),
            channel_title: row.get(3),
            included: row.get(4),
            created_at: row.get(5),
            websub_subscribed: row.get(6),
            lease_expires_at: row.get(7),
            attempt_count: row.get(8),
            last_attempt_at: row.get(9),
            websub_secret: row.get(10),
            polling_enabled: row.get(11),
            last_polled_at: row.get(12),
            last_polled_video_id: row.get(13),
        }
    }

    fn map_event(row: &Row) -> WebhookEventRecord {
        WebhookEventRecord {
            event_id: row.get(0),
            channel_id: row.get(1),
            video_id: row.get(2),
            title: row.get(3),
            source: row.get(4),
            received_at: row.get(5),
            processed: row.get(6),
            processed_at: row.get(7),
            raw_payload: row.get(8),
        }
    }

    fn map_processed(row: &Row) -> ProcessedVideoRecord {
        ProcessedVideoRecord {
            id: row.get(0),
            user_id: row.get(1),
            video_id: row.get(2),
            channel_id: row.get(3),
            title: row.get(4),
            processed_at: row.get(5),
            added_to_playlist: row.get(6),
            error_message: row.get(7),
            retry_count: row.get(8),
            source: row.get(9),
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, channel_id, channel_title, included, \
     created_at, websub_subscribed, lease_expires_at, attempt_count, last_attempt_at, \
     websub_secret, polling_enabled, last_polled_at, last_polled_video_id";

const EVENT_COLUMNS: &str =
    "event_id, channel_id, video_id, title, source, received_at, processed, processed_at, raw_payload";

const PROCESSED_COLUMNS: &str = "id, user_id, video_id, channel_id, title, processed_at, \
     added_to_playlist, error_message, retry_count, source";

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
      user_id TEXT PRIMARY KEY,
      access_token TEXT,
      refresh_token TEXT,
      token_expires_at DOUBLE PRECISION,
      playlist_id TEXT,
      automation_disabled BOOLEAN NOT NULL DEFAULT FALSE,
      is_admin BOOLEAN NOT NULL DEFAULT FALSE,
      created_at DOUBLE PRECISION NOT NULL,
      updated_at DOUBLE PRECISION NOT NULL
    );
    CREATE TABLE IF NOT EXISTS subscriptions (
      subscription_id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      channel_id TEXT NOT NULL,
      channel_title TEXT NOT NULL DEFAULT '',
      included BOOLEAN NOT NULL DEFAULT TRUE,
      created_at DOUBLE PRECISION NOT NULL,
      websub_subscribed BOOLEAN NOT NULL DEFAULT FALSE,
      lease_expires_at DOUBLE PRECISION,
      attempt_count BIGINT NOT NULL DEFAULT 0,
      last_attempt_at DOUBLE PRECISION,
      websub_secret TEXT,
      polling_enabled BOOLEAN NOT NULL DEFAULT TRUE,
      last_polled_at DOUBLE PRECISION,
      last_polled_video_id TEXT,
      UNIQUE (user_id, channel_id)
    );
    CREATE INDEX IF NOT EXISTS idx_subscriptions_channel
      ON subscriptions (channel_id);
    CREATE TABLE IF NOT EXISTS webhook_events (
      event_id TEXT PRIMARY KEY,
      channel_id TEXT NOT NULL,
      video_id TEXT NOT NULL,
      title TEXT,
      source TEXT NOT NULL DEFAULT 'Webhook',
      received_at DOUBLE PRECISION NOT NULL,
      processed BOOLEAN NOT NULL DEFAULT FALSE,
      processed_at DOUBLE PRECISION,
      raw_payload TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_webhook_events_pending
      ON webhook_events (processed, received_at);
    CREATE INDEX IF NOT EXISTS idx_webhook_events_channel_video
      ON webhook_events (channel_id, video_id);
    CREATE TABLE IF NOT EXISTS processed_videos (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      video_id TEXT NOT NULL,
      channel_id TEXT NOT NULL,
      title TEXT,
      processed_at DOUBLE PRECISION NOT NULL,
      added_to_playlist BOOLEAN NOT NULL DEFAULT FALSE,
      error_message TEXT,
      retry_count BIGINT NOT NULL DEFAULT 0,
      source TEXT NOT NULL DEFAULT 'Webhook',
      UNIQUE (user_id, video_id)
    );
    CREATE INDEX IF NOT EXISTS idx_processed_videos_time
      ON processed_videos (processed_at);
    CREATE TABLE IF NOT EXISTS api_quota_usage (
      usage_date TEXT NOT NULL,
      service TEXT NOT NULL,
      requests_used BIGINT NOT NULL DEFAULT 0,
      quota_limit BIGINT NOT NULL DEFAULT 10000,
      cost_units_used BIGINT NOT NULL DEFAULT 0,
      cost_unit_limit BIGINT NOT NULL DEFAULT 10000,
      last_updated DOUBLE PRECISION NOT NULL,
      PRIMARY KEY (usage_date, service)
    );
"#;

impl StorageBackend for PostgresStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.schema_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.schema_lock.lock();
        if self.schema_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.create_schema()?;
        self.schema_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_user(&self, record: &UserRecord) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "INSERT INTO users (user_id, access_token, refresh_token, token_expires_at, playlist_id, \
             automation_disabled, is_admin, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (user_id) DO UPDATE SET access_token = excluded.access_token, \
             refresh_token = excluded.refresh_token, token_expires_at = excluded.token_expires_at, \
             playlist_id = excluded.playlist_id, automation_disabled = excluded.automation_disabled, \
             is_admin = excluded.is_admin, updated_at = excluded.updated_at",
            &[
                &record.user_id,
                &record.access_token,
                &record.refresh_token,
                &record.token_expires_at,
                &record.playlist_id,
                &record.automation_disabled,
                &record.is_admin,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let row = self.fetch_opt(
            "SELECT user_id, access_token, refresh_token, token_expires_at, playlist_id, \
             automation_disabled, is_admin, created_at, updated_at FROM users WHERE user_id = $1",
            &[&user_id.trim()],
        )?;
        Ok(row.as_ref().map(Self::map_user))
    }

    fn list_refreshable_users(&self) -> Result<Vec<UserRecord>> {
        self.ensure_initialized()?;
        let rows = self.fetch(
            "SELECT user_id, access_token, refresh_token, token_expires_at, playlist_id, \
             automation_disabled, is_admin, created_at, updated_at FROM users \
             WHERE refresh_token IS NOT NULL AND refresh_token != '' AND automation_disabled = FALSE \
             ORDER BY user_id",
            &[],
        )?;
        Ok(rows.iter().map(Self::map_user).collect())
    }

    fn update_user_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: f64,
        now: f64,
    ) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE users SET access_token = $1, refresh_token = COALESCE($2, refresh_token), \
             token_expires_at = $3, automation_disabled = FALSE, updated_at = $4 WHERE user_id = $5",
            &[
                &access_token,
                &refresh_token,
                &expires_at,
                &now,
                &user_id.trim(),
            ],
        )?;
        Ok(())
    }

    fn set_automation_disabled(&self, user_id: &str, disabled: bool, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE users SET automation_disabled = $1, updated_at = $2 WHERE user_id = $3",
            &[&disabled, &now, &user_id.trim()],
        )?;
        Ok(())
    }

    fn set_user_playlist(&self, user_id: &str, playlist_id: &str, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE users SET playlist_id = $1, updated_at = $2 WHERE user_id = $3",
            &[&playlist_id, &now, &user_id.trim()],
        )?;
        Ok(())
    }

    fn upsert_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "INSERT INTO subscriptions (subscription_id, user_id, channel_id, channel_title, included, \
             created_at, websub_subscribed, lease_expires_at, attempt_count, last_attempt_at, \
             websub_secret, polling_enabled, last_polled_at, last_polled_video_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (user_id, channel_id) DO UPDATE SET channel_title = excluded.channel_title, \
             included = excluded.included, websub_subscribed = excluded.websub_subscribed, \
             lease_expires_at = excluded.lease_expires_at, attempt_count = excluded.attempt_count, \
             last_attempt_at = excluded.last_attempt_at, websub_secret = excluded.websub_secret, \
             polling_enabled = excluded.polling_enabled, last_polled_at = excluded.last_polled_at, \
             last_polled_video_id = excluded.last_polled_video_id",
            &[
                &record.subscription_id,
                &record.user_id,
                &record.channel_id,
                &record.channel_title,
                &record.included,
                &record.created_at,
                &record.websub_subscribed,
                &record.lease_expires_at,
                &record.attempt_count,
                &record.last_attempt_at,
                &record.websub_secret,
                &record.polling_enabled,
                &record.last_polled_at,
                &record.last_polled_video_id,
            ],
        )?;
        Ok(())
    }

    fn get_subscription(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<Option<SubscriptionRecord>> {
        self.ensure_initialized()?;
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 AND channel_id = $2"
        );
        let row = self.fetch_opt(&query, &[&user_id.trim(), &channel_id.trim()])?;
        Ok(row.as_ref().map(Self::map_subscription))
    }

    fn list_user_subscriptions(&self, user_id: &str) -> Result<Vec<SubscriptionRecord>> {
        self.ensure_initialized()?;
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 \
             ORDER BY channel_title, channel_id"
        );
        let rows = self.fetch(&query, &[&user_id.trim()])?;
        Ok(rows.iter().map(Self::map_subscription).collect())
    }

    fn delete_subscription(&self, user_id: &str, channel_id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let removed = self.execute(
            "DELETE FROM subscriptions WHERE user_id = $1 AND channel_id = $2",
            &[&user_id.trim(), &channel_id.trim()],
        )?;
        Ok(removed as i64)
    }

    fn set_subscription_included(
        &self,
        user_id: &str,
        channel_id: &str,
        included: bool,
    ) -> Result<Option<SubscriptionRecord>> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE subscriptions SET included = $1 WHERE user_id = $2 AND channel_id = $3",
            &[&included, &user_id.trim(), &channel_id.trim()],
        )?;
        self.get_subscription(user_id, channel_id)
    }

    fn list_websub_due(&self, now: f64, max_attempts: i64) -> Result<Vec<SubscriptionRecord>> {
        self.ensure_initialized()?;
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE included = TRUE AND attempt_count < $2 AND ( \
               (websub_subscribed = FALSE AND attempt_count = 0) \
               OR (websub_subscribed = TRUE AND lease_expires_at IS NOT NULL AND lease_expires_at <= $1 + 86400.0) \
               OR (attempt_count > 0 AND (last_attempt_at IS NULL \
                   OR last_attempt_at + 60.0 * power(2, attempt_count) <= $1)) \
             ) ORDER BY created_at"
        );
        let rows = self.fetch(&query, &[&now, &max_attempts])?;
        Ok(rows.iter().map(Self::map_subscription).collect())
    }

    fn record_subscribe_attempt(&self, subscription_id: &str, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE subscriptions SET attempt_count = attempt_count + 1, last_attempt_at = $1 \
             WHERE subscription_id = $2",
            &[&now, &subscription_id],
        )?;
        Ok(())
    }

    fn set_websub_secret(&self, subscription_id: &str, secret: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE subscriptions SET websub_secret = $1 WHERE subscription_id = $2",
            &[&secret, &subscription_id],
        )?;
        Ok(())
    }

    fn mark_subscribed(&self, subscription_id: &str, lease_expires_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE subscriptions SET websub_subscribed = TRUE, lease_expires_at = $1, \
             attempt_count = 0 WHERE subscription_id = $2",
            &[&lease_expires_at, &subscription_id],
        )?;
        Ok(())
    }

    fn reset_websub_state(&self, subscription_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE subscriptions SET websub_subscribed = FALSE, lease_expires_at = NULL, \
             attempt_count = 0, last_attempt_at = NULL WHERE subscription_id = $1",
            &[&subscription_id],
        )?;
        Ok(())
    }

    fn mark_unsubscribed(&self, subscription_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE subscriptions SET websub_subscribed = FALSE, lease_expires_at = NULL, \
             attempt_count = 0 WHERE subscription_id = $1",
            &[&subscription_id],
        )?;
        Ok(())
    }

    fn list_channel_secrets(&self, channel_id: &str) -> Result<Vec<String>> {
        self.ensure_initialized()?;
        let rows = self.fetch(
            "SELECT DISTINCT websub_secret FROM subscriptions \
             WHERE channel_id = $1 AND websub_secret IS NOT NULL AND websub_secret != ''",
            &[&channel_id.trim()],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn list_polling_due(&self, now: f64, interval_s: f64) -> Result<Vec<PollTarget>> {
        self.ensure_initialized()?;
        let rows = self.fetch(
            "SELECT s.subscription_id, s.user_id, s.channel_id, s.channel_title, s.included, \
             s.created_at, s.websub_subscribed, s.lease_expires_at, s.attempt_count, s.last_attempt_at, \
             s.websub_secret, s.polling_enabled, s.last_polled_at, s.last_polled_video_id, u.access_token \
             FROM subscriptions s JOIN users u ON u.user_id = s.user_id \
             WHERE s.included = TRUE AND s.polling_enabled = TRUE AND u.automation_disabled = FALSE \
               AND u.access_token IS NOT NULL AND u.access_token != '' \
               AND ( s.websub_subscribed = FALSE \
                     OR (s.lease_expires_at IS NOT NULL AND s.lease_expires_at < $1) \
                     OR s.last_polled_at IS NULL OR s.last_polled_at < $1 - $2 ) \
             ORDER BY s.created_at",
            &[&now, &interval_s],
        )?;
        Ok(rows
            .iter()
            .map(|row| PollTarget {
                subscription: Self::map_subscription(row),
                access_token: row.get(14),
            })
            .collect())
    }

    fn update_poll_state(
        &self,
        subscription_id: &str,
        last_video_id: Option<&str>,
        now: f64,
    ) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE subscriptions SET last_polled_at = $1, \
             last_polled_video_id = COALESCE($2, last_polled_video_id) WHERE subscription_id = $3",
            &[&now, &last_video_id, &subscription_id],
        )?;
        Ok(())
    }

    fn insert_webhook_event(&self, record: &WebhookEventRecord) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "INSERT INTO webhook_events (event_id, channel_id, video_id, title, source, \
             received_at, processed, processed_at, raw_payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &record.event_id,
                &record.channel_id,
                &record.video_id,
                &record.title,
                &record.source,
                &record.received_at,
                &record.processed,
                &record.processed_at,
                &record.raw_payload,
            ],
        )?;
        Ok(())
    }

    fn webhook_event_exists(&self, channel_id: &str, video_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let count = self.count(
            "SELECT COUNT(*) FROM webhook_events WHERE channel_id = $1 AND video_id = $2",
            &[&channel_id.trim(), &video_id.trim()],
        )?;
        Ok(count > 0)
    }

    fn list_unprocessed_events(&self, limit: i64) -> Result<Vec<WebhookEventRecord>> {
        self.ensure_initialized()?;
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE processed = FALSE \
             ORDER BY received_at LIMIT $1"
        );
        let rows = self.fetch(&query, &[&limit.max(1)])?;
        Ok(rows.iter().map(Self::map_event).collect())
    }

    fn mark_event_processed(&self, event_id: &str, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "UPDATE webhook_events SET processed = TRUE, processed_at = $1 WHERE event_id = $2",
            &[&now, &event_id],
        )?;
        Ok(())
    }

    fn processed_video_exists(&self, user_id: &str, video_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let count = self.count(
            "SELECT COUNT(*) FROM processed_videos WHERE user_id = $1 AND video_id = $2",
            &[&user_id.trim(), &video_id.trim()],
        )?;
        Ok(count > 0)
    }

    fn get_processed_video(
        &self,
        user_id: &str,
        video_id: &str,
    ) -> Result<Option<ProcessedVideoRecord>> {
        self.ensure_initialized()?;
        let query = format!(
            "SELECT {PROCESSED_COLUMNS} FROM processed_videos WHERE user_id = $1 AND video_id = $2"
        );
        let row = self.fetch_opt(&query, &[&user_id.trim(), &video_id.trim()])?;
        Ok(row.as_ref().map(Self::map_processed))
    }

    fn insert_processed_video(&self, record: &ProcessedVideoRecord) -> Result<bool> {
        self.ensure_initialized()?;
        let inserted = self.execute(
            "INSERT INTO processed_videos (id, user_id, video_id, channel_id, title, processed_at, \
             added_to_playlist, error_message, retry_count, source) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (user_id, video_id) DO NOTHING",
            &[
                &record.id,
                &record.user_id,
                &record.video_id,
                &record.channel_id,
                &record.title,
                &record.processed_at,
                &record.added_to_playlist,
                &record.error_message,
                &record.retry_count,
                &record.source,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn list_fanout_targets(&self, channel_id: &str) -> Result<Vec<FanoutTarget>> {
        self.ensure_initialized()?;
        let rows = self.fetch(
            "SELECT u.user_id, u.playlist_id, u.access_token FROM users u \
             JOIN subscriptions s ON s.user_id = u.user_id AND s.channel_id = $1 \
             WHERE s.included = TRUE AND u.automation_disabled = FALSE \
               AND u.playlist_id IS NOT NULL AND u.playlist_id != '' \
               AND u.access_token IS NOT NULL AND u.access_token != '' \
             ORDER BY u.user_id",
            &[&channel_id.trim()],
        )?;
        Ok(rows
            .iter()
            .map(|row| FanoutTarget {
                user_id: row.get(0),
                playlist_id: row.get(1),
                access_token: row.get(2),
            })
            .collect())
    }

    fn record_api_usage(&self, service: &str, requests: i64, cost_units: i64) -> Result<()> {
        self.ensure_initialized()?;
        self.execute(
            "INSERT INTO api_quota_usage (usage_date, service, requests_used, quota_limit, \
             cost_units_used, cost_unit_limit, last_updated) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (usage_date, service) DO UPDATE SET \
             requests_used = api_quota_usage.requests_used + excluded.requests_used, \
             cost_units_used = api_quota_usage.cost_units_used + excluded.cost_units_used, \
             last_updated = excluded.last_updated",
            &[
                &today_string(),
                &service.trim(),
                &requests.max(0),
                &DEFAULT_QUOTA_LIMIT,
                &cost_units.max(0),
                &DEFAULT_QUOTA_LIMIT,
                &now_ts(),
            ],
        )?;
        Ok(())
    }

    fn pipeline_summary(&self, now: f64) -> Result<PipelineSummary> {
        self.ensure_initialized()?;
        let day_ago = now - 86_400.0;
        let week_ago = now - 7.0 * 86_400.0;
        let active_subscriptions = self.count(
            "SELECT COUNT(*) FROM subscriptions WHERE included = TRUE",
            &[],
        )?;
        let websub_active = self.count(
            "SELECT COUNT(*) FROM subscriptions WHERE included = TRUE AND websub_subscribed = TRUE \
             AND lease_expires_at IS NOT NULL AND lease_expires_at > $1",
            &[&now],
        )?;
        let failed_jobs_24h = self.count(
            "SELECT COUNT(*) FROM processed_videos WHERE added_to_playlist = FALSE AND processed_at >= $1",
            &[&day_ago],
        )?;
        let unprocessed_events_24h = self.count(
            "SELECT COUNT(*) FROM webhook_events WHERE processed = FALSE AND received_at >= $1",
            &[&day_ago],
        )?;
        let processed_7d = self.count(
            "SELECT COUNT(*) FROM processed_videos WHERE processed_at >= $1",
            &[&week_ago],
        )?;
        let added_7d = self.count(
            "SELECT COUNT(*) FROM processed_videos WHERE added_to_playlist = TRUE AND processed_at >= $1",
            &[&week_ago],
        )?;
        let events_received_24h = self.count(
            "SELECT COUNT(*) FROM webhook_events WHERE received_at >= $1",
            &[&day_ago],
        )?;
        let success_rate_7d = if processed_7d > 0 {
            added_7d as f64 / processed_7d as f64
        } else {
            0.0
        };
        Ok(PipelineSummary {
            active_subscriptions,
            websub_active,
            failed_jobs_24h,
            unprocessed_events_24h,
            processed_7d,
            success_rate_7d,
            events_received_24h,
        })
    }

    fn list_quota_usage(&self, days: i64) -> Result<Vec<QuotaUsageRecord>> {
        self.ensure_initialized()?;
        let cutoff = date_cutoff(days.max(1) - 1);
        let rows = self.fetch(
            "SELECT usage_date, service, requests_used, quota_limit, cost_units_used, \
             cost_unit_limit, last_updated FROM api_quota_usage WHERE usage_date >= $1 \
             ORDER BY usage_date DESC, service",
            &[&cutoff],
        )?;
        Ok(rows
            .iter()
            .map(|row| QuotaUsageRecord {
                usage_date: row.get(0),
                service: row.get(1),
                requests_used: row.get(2),
                quota_limit: row.get(3),
                cost_units_used: row.get(4),
                cost_unit_limit: row.get(5),
                last_updated: row.get(6),
            })
            .collect())
    }

    fn list_failed_jobs(&self, since: f64, limit: i64) -> Result<Vec<ProcessedVideoRecord>> {
        self.ensure_initialized()?;
        let query = format!(
            "SELECT {PROCESSED_COLUMNS} FROM processed_videos \
             WHERE added_to_playlist = FALSE AND processed_at >= $1 \
             ORDER BY processed_at DESC LIMIT $2"
        );
        let rows = self.fetch(&query, &[&since, &limit.max(1)])?;
        Ok(rows.iter().map(Self::map_processed).collect())
    }

    fn list_unprocessed_since(&self, since: f64) -> Result<Vec<WebhookEventRecord>> {
        self.ensure_initialized()?;
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE processed = FALSE AND received_at >= $1 \
             ORDER BY received_at"
        );
        let rows = self.fetch(&query, &[&since])?;
        Ok(rows.iter().map(Self::map_event).collect())
    }
}
