// SQLite backend. Connections are opened per call; WAL keeps the webhook
// handlers and the background loops from blocking each other.
use crate::storage::{
    date_cutoff, now_ts, today_string, FanoutTarget, PipelineSummary, PollTarget,
    ProcessedVideoRecord, QuotaUsageRecord, StorageBackend, SubscriptionRecord, UserRecord,
    WebhookEventRecord,
};
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

const DEFAULT_QUOTA_LIMIT: i64 = 10_000;

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/tubelater.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
        let automation_disabled: i64 = row.get(5)?;
        let is_admin: i64 = row.get(6)?;
        Ok(UserRecord {
            user_id: row.get(0)?,
            access_token: row.get(1)?,
            refresh_token: row.get(2)?,
            token_expires_at: row.get(3)?,
            playlist_id: row.get(4)?,
            automation_disabled: automation_disabled != 0,
            is_admin: is_admin != 0,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn map_subscription(row: &Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
        let included: i64 = row.get(4)?;
        let websub_subscribed: i64 = row.get(6)?;
        let polling_enabled: i64 = row.get(11)?;
        Ok(SubscriptionRecord {
            subscription_id: row.get(0)?,
            user_id: row.get(1)?,
            channel_id: row.get(2)?,
            channel_title: row.get(3)?,
            included: included != 0,
            created_at: row.get(5)?,
            websub_subscribed: websub_subscribed != 0,
            lease_expires_at: row.get(7)?,
            attempt_count: row.get(8)?,
            last_attempt_at: row.get(9)?,
            websub_secret: row.get(10)?,
            polling_enabled: polling_enabled != 0,
            last_polled_at: row.get(12)?,
            last_polled_video_id: row.get(13)?,
        })
    }

    fn map_event(row: &Row<'_>) -> rusqlite::Result<WebhookEventRecord> {
        let processed: i64 = row.get(6)?;
        Ok(WebhookEventRecord {
            event_id: row.get(0)?,
            channel_id: row.get(1)?,
            video_id: row.get(2)?,
            title: row.get(3)?,
            source: row.get(4)?,
            received_at: row.get(5)?,
            processed: processed != 0,
            processed_at: row.get(7)?,
            raw_payload: row.get(8)?,
        })
    }

    fn map_processed(row: &Row<'_>) -> rusqlite::Result<ProcessedVideoRecord> {
        let added: i64 = row.get(6)?;
        Ok(ProcessedVideoRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            video_id: row.get(2)?,
            channel_id: row.get(3)?,
            title: row.get(4)?,
            processed_at: row.get(5)?,
            added_to_playlist: added != 0,
            error_message: row.get(7)?,
            retry_count: row.get(8)?,
            source: row.get(9)?,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, channel_id, channel_title, included, \
     created_at, websub_subscribed, lease_expires_at, attempt_count, last_attempt_at, \
     websub_secret, polling_enabled, last_polled_at, last_polled_video_id";

const EVENT_COLUMNS: &str =
    "event_id, channel_id, video_id, title, source, received_at, processed, processed_at, raw_payload";

const PROCESSED_COLUMNS: &str = "id, user_id, video_id, channel_id, title, processed_at, \
     added_to_playlist, error_message, retry_count, source";

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              user_id TEXT PRIMARY KEY,
              access_token TEXT,
              refresh_token TEXT,
              token_expires_at REAL,
              playlist_id TEXT,
              automation_disabled INTEGER NOT NULL DEFAULT 0,
              is_admin INTEGER NOT NULL DEFAULT 0,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS subscriptions (
              subscription_id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              channel_id TEXT NOT NULL,
              channel_title TEXT NOT NULL DEFAULT '',
              included INTEGER NOT NULL DEFAULT 1,
              created_at REAL NOT NULL,
              websub_subscribed INTEGER NOT NULL DEFAULT 0,
              lease_expires_at REAL,
              attempt_count INTEGER NOT NULL DEFAULT 0,
              last_attempt_at REAL,
              websub_secret TEXT,
              polling_enabled INTEGER NOT NULL DEFAULT 1,
              last_polled_at REAL,
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
              received_at REAL NOT NULL,
              processed INTEGER NOT NULL DEFAULT 0,
              processed_at REAL,
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
              processed_at REAL NOT NULL,
              added_to_playlist INTEGER NOT NULL DEFAULT 0,
              error_message TEXT,
              retry_count INTEGER NOT NULL DEFAULT 0,
              source TEXT NOT NULL DEFAULT 'Webhook',
              UNIQUE (user_id, video_id)
            );
            CREATE INDEX IF NOT EXISTS idx_processed_videos_time
              ON processed_videos (processed_at);
            CREATE TABLE IF NOT EXISTS api_quota_usage (
              usage_date TEXT NOT NULL,
              service TEXT NOT NULL,
              requests_used INTEGER NOT NULL DEFAULT 0,
              quota_limit INTEGER NOT NULL DEFAULT 10000,
              cost_units_used INTEGER NOT NULL DEFAULT 0,
              cost_unit_limit INTEGER NOT NULL DEFAULT 10000,
              last_updated REAL NOT NULL,
              PRIMARY KEY (usage_date, service)
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_user(&self, record: &UserRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO users (user_id, access_token, refresh_token, token_expires_at, playlist_id, \
             automation_disabled, is_admin, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET access_token = excluded.access_token, \
             refresh_token = excluded.refresh_token, token_expires_at = excluded.token_expires_at, \
             playlist_id = excluded.playlist_id, automation_disabled = excluded.automation_disabled, \
             is_admin = excluded.is_admin, updated_at = excluded.updated_at",
            params![
                record.user_id,
                record.access_token,
                record.refresh_token,
                record.token_expires_at,
                record.playlist_id,
                if record.automation_disabled { 1 } else { 0 },
                if record.is_admin { 1 } else { 0 },
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT user_id, access_token, refresh_token, token_expires_at, playlist_id, \
                 automation_disabled, is_admin, created_at, updated_at FROM users WHERE user_id = ?",
                params![user_id.trim()],
                Self::map_user,
            )
            .optional()?;
        Ok(row)
    }

    fn list_refreshable_users(&self) -> Result<Vec<UserRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, access_token, refresh_token, token_expires_at, playlist_id, \
             automation_disabled, is_admin, created_at, updated_at FROM users \
             WHERE refresh_token IS NOT NULL AND refresh_token != '' AND automation_disabled = 0 \
             ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], Self::map_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
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
        let conn = self.open()?;
        conn.execute(
            "UPDATE users SET access_token = ?, refresh_token = COALESCE(?, refresh_token), \
             token_expires_at = ?, automation_disabled = 0, updated_at = ? WHERE user_id = ?",
            params![access_token, refresh_token, expires_at, now, user_id.trim()],
        )?;
        Ok(())
    }

    fn set_automation_disabled(&self, user_id: &str, disabled: bool, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE users SET automation_disabled = ?, updated_at = ? WHERE user_id = ?",
            params![if disabled { 1 } else { 0 }, now, user_id.trim()],
        )?;
        Ok(())
    }

    fn set_user_playlist(&self, user_id: &str, playlist_id: &str, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE users SET playlist_id = ?, updated_at = ? WHERE user_id = ?",
            params![playlist_id, now, user_id.trim()],
        )?;
        Ok(())
    }

    fn upsert_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO subscriptions (subscription_id, user_id, channel_id, channel_title, included, \
             created_at, websub_subscribed, lease_expires_at, attempt_count, last_attempt_at, \
             websub_secret, polling_enabled, last_polled_at, last_polled_video_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, channel_id) DO UPDATE SET channel_title = excluded.channel_title, \
             included = excluded.included, websub_subscribed = excluded.websub_subscribed, \
             lease_expires_at = excluded.lease_expires_at, attempt_count = excluded.attempt_count, \
             last_attempt_at = excluded.last_attempt_at, websub_secret = excluded.websub_secret, \
             polling_enabled = excluded.polling_enabled, last_polled_at = excluded.last_polled_at, \
             last_polled_video_id = excluded.last_polled_video_id",
            params![
                record.subscription_id,
                record.user_id,
                record.channel_id,
                record.channel_title,
                if record.included { 1 } else { 0 },
                record.created_at,
                if record.websub_subscribed { 1 } else { 0 },
                record.lease_expires_at,
                record.attempt_count,
                record.last_attempt_at,
                record.websub_secret,
                if record.polling_enabled { 1 } else { 0 },
                record.last_polled_at,
                record.last_polled_video_id,
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
        let conn = self.open()?;
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = ? AND channel_id = ?"
        );
        let row = conn
            .query_row(
                &query,
                params![user_id.trim(), channel_id.trim()],
                Self::map_subscription,
            )
            .optional()?;
        Ok(row)
    }

    fn list_user_subscriptions(&self, user_id: &str) -> Result<Vec<SubscriptionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = ? ORDER BY channel_title, channel_id"
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id.trim()], Self::map_subscription)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_subscription(&self, user_id: &str, channel_id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM subscriptions WHERE user_id = ? AND channel_id = ?",
            params![user_id.trim(), channel_id.trim()],
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
        let conn = self.open()?;
        conn.execute(
            "UPDATE subscriptions SET included = ? WHERE user_id = ? AND channel_id = ?",
            params![
                if included { 1 } else { 0 },
                user_id.trim(),
                channel_id.trim()
            ],
        )?;
        drop(conn);
        self.get_subscription(user_id, channel_id)
    }

    fn list_websub_due(&self, now: f64, max_attempts: i64) -> Result<Vec<SubscriptionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        // Backoff window: 2^attempts minutes, expressed as (60 << attempts) seconds.
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE included = 1 AND attempt_count < ?2 AND ( \
               (websub_subscribed = 0 AND attempt_count = 0) \
               OR (websub_subscribed = 1 AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1 + 86400.0) \
               OR (attempt_count > 0 AND (last_attempt_at IS NULL OR last_attempt_at + (60 << attempt_count) <= ?1)) \
             ) ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![now, max_attempts], Self::map_subscription)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn record_subscribe_attempt(&self, subscription_id: &str, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE subscriptions SET attempt_count = attempt_count + 1, last_attempt_at = ? \
             WHERE subscription_id = ?",
            params![now, subscription_id],
        )?;
        Ok(())
    }

    fn set_websub_secret(&self, subscription_id: &str, secret: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE subscriptions SET websub_secret = ? WHERE subscription_id = ?",
            params![secret, subscription_id],
        )?;
        Ok(())
    }

    fn mark_subscribed(&self, subscription_id: &str, lease_expires_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE subscriptions SET websub_subscribed = 1, lease_expires_at = ?, attempt_count = 0 \
             WHERE subscription_id = ?",
            params![lease_expires_at, subscription_id],
        )?;
        Ok(())
    }

    fn reset_websub_state(&self, subscription_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE subscriptions SET websub_subscribed = 0, lease_expires_at = NULL, \
             attempt_count = 0, last_attempt_at = NULL WHERE subscription_id = ?",
            params![subscription_id],
        )?;
        Ok(())
    }

    fn mark_unsubscribed(&self, subscription_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE subscriptions SET websub_subscribed = 0, lease_expires_at = NULL, attempt_count = 0 \
             WHERE subscription_id = ?",
            params![subscription_id],
        )?;
        Ok(())
    }

    fn list_channel_secrets(&self, channel_id: &str) -> Result<Vec<String>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT websub_secret FROM subscriptions \
             WHERE channel_id = ? AND websub_secret IS NOT NULL AND websub_secret != ''",
        )?;
        let rows = stmt.query_map(params![channel_id.trim()], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_polling_due(&self, now: f64, interval_s: f64) -> Result<Vec<PollTarget>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = format!(
            "SELECT s.subscription_id, s.user_id, s.channel_id, s.channel_title, s.included, \
             s.created_at, s.websub_subscribed, s.lease_expires_at, s.attempt_count, s.last_attempt_at, \
             s.websub_secret, s.polling_enabled, s.last_polled_at, s.last_polled_video_id, u.access_token \
             FROM subscriptions s JOIN users u ON u.user_id = s.user_id \
             WHERE s.included = 1 AND s.polling_enabled = 1 AND u.automation_disabled = 0 \
               AND u.access_token IS NOT NULL AND u.access_token != '' \
               AND ( s.websub_subscribed = 0 \
                     OR (s.lease_expires_at IS NOT NULL AND s.lease_expires_at < ?1) \
                     OR s.last_polled_at IS NULL OR s.last_polled_at < ?1 - ?2 ) \
             ORDER BY s.created_at"
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![now, interval_s], |row| {
            Ok(PollTarget {
                subscription: Self::map_subscription(row)?,
                access_token: row.get(14)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_poll_state(
        &self,
        subscription_id: &str,
        last_video_id: Option<&str>,
        now: f64,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE subscriptions SET last_polled_at = ?, \
             last_polled_video_id = COALESCE(?, last_polled_video_id) WHERE subscription_id = ?",
            params![now, last_video_id, subscription_id],
        )?;
        Ok(())
    }

    fn insert_webhook_event(&self, record: &WebhookEventRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO webhook_events (event_id, channel_id, video_id, title, source, \
             received_at, processed, processed_at, raw_payload) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.event_id,
                record.channel_id,
                record.video_id,
                record.title,
                record.source,
                record.received_at,
                if record.processed { 1 } else { 0 },
                record.processed_at,
                record.raw_payload,
            ],
        )?;
        Ok(())
    }

    fn webhook_event_exists(&self, channel_id: &str, video_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM webhook_events WHERE channel_id = ? AND video_id = ?",
            params![channel_id.trim(), video_id.trim()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_unprocessed_events(&self, limit: i64) -> Result<Vec<WebhookEventRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE processed = 0 \
             ORDER BY received_at LIMIT ?"
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![limit.max(1)], Self::map_event)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn mark_event_processed(&self, event_id: &str, now: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE webhook_events SET processed = 1, processed_at = ? WHERE event_id = ?",
            params![now, event_id],
        )?;
        Ok(())
    }

    fn processed_video_exists(&self, user_id: &str, video_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_videos WHERE user_id = ? AND video_id = ?",
            params![user_id.trim(), video_id.trim()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_processed_video(
        &self,
        user_id: &str,
        video_id: &str,
    ) -> Result<Option<ProcessedVideoRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = format!(
            "SELECT {PROCESSED_COLUMNS} FROM processed_videos WHERE user_id = ? AND video_id = ?"
        );
        let row = conn
            .query_row(
                &query,
                params![user_id.trim(), video_id.trim()],
                Self::map_processed,
            )
            .optional()?;
        Ok(row)
    }

    fn insert_processed_video(&self, record: &ProcessedVideoRecord) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT INTO processed_videos (id, user_id, video_id, channel_id, title, processed_at, \
             added_to_playlist, error_message, retry_count, source) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, video_id) DO NOTHING",
            params![
                record.id,
                record.user_id,
                record.video_id,
                record.channel_id,
                record.title,
                record.processed_at,
                if record.added_to_playlist { 1 } else { 0 },
                record.error_message,
                record.retry_count,
                record.source,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn list_fanout_targets(&self, channel_id: &str) -> Result<Vec<FanoutTarget>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT u.user_id, u.playlist_id, u.access_token FROM users u \
             JOIN subscriptions s ON s.user_id = u.user_id AND s.channel_id = ? \
             WHERE s.included = 1 AND u.automation_disabled = 0 \
               AND u.playlist_id IS NOT NULL AND u.playlist_id != '' \
               AND u.access_token IS NOT NULL AND u.access_token != '' \
             ORDER BY u.user_id",
        )?;
        let rows = stmt.query_map(params![channel_id.trim()], |row| {
            Ok(FanoutTarget {
                user_id: row.get(0)?,
                playlist_id: row.get(1)?,
                access_token: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn record_api_usage(&self, service: &str, requests: i64, cost_units: i64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO api_quota_usage (usage_date, service, requests_used, quota_limit, \
             cost_units_used, cost_unit_limit, last_updated) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(usage_date, service) DO UPDATE SET \
             requests_used = api_quota_usage.requests_used + excluded.requests_used, \
             cost_units_used = api_quota_usage.cost_units_used + excluded.cost_units_used, \
             last_updated = excluded.last_updated",
            params![
                today_string(),
                service.trim(),
                requests.max(0),
                DEFAULT_QUOTA_LIMIT,
                cost_units.max(0),
                DEFAULT_QUOTA_LIMIT,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    fn pipeline_summary(&self, now: f64) -> Result<PipelineSummary> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let day_ago = now - 86_400.0;
        let week_ago = now - 7.0 * 86_400.0;
        let count = |query: &str, binds: &[&dyn rusqlite::ToSql]| -> Result<i64> {
            Ok(conn.query_row(query, binds, |row| row.get(0))?)
        };
        let active_subscriptions = count(
            "SELECT COUNT(*) FROM subscriptions WHERE included = 1",
            &[],
        )?;
        let websub_active = count(
            "SELECT COUNT(*) FROM subscriptions WHERE included = 1 AND websub_subscribed = 1 \
             AND lease_expires_at IS NOT NULL AND lease_expires_at > ?",
            &[&now],
        )?;
        let failed_jobs_24h = count(
            "SELECT COUNT(*) FROM processed_videos WHERE added_to_playlist = 0 AND processed_at >= ?",
            &[&day_ago],
        )?;
        let unprocessed_events_24h = count(
            "SELECT COUNT(*) FROM webhook_events WHERE processed = 0 AND received_at >= ?",
            &[&day_ago],
        )?;
        let processed_7d = count(
            "SELECT COUNT(*) FROM processed_videos WHERE processed_at >= ?",
            &[&week_ago],
        )?;
        let added_7d = count(
            "SELECT COUNT(*) FROM processed_videos WHERE added_to_playlist = 1 AND processed_at >= ?",
            &[&week_ago],
        )?;
        let events_received_24h = count(
            "SELECT COUNT(*) FROM webhook_events WHERE received_at >= ?",
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
        let conn = self.open()?;
        let cutoff = date_cutoff(days.max(1) - 1);
        let mut stmt = conn.prepare(
            "SELECT usage_date, service, requests_used, quota_limit, cost_units_used, \
             cost_unit_limit, last_updated FROM api_quota_usage WHERE usage_date >= ? \
             ORDER BY usage_date DESC, service",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok(QuotaUsageRecord {
                usage_date: row.get(0)?,
                service: row.get(1)?,
                requests_used: row.get(2)?,
                quota_limit: row.get(3)?,
                cost_units_used: row.get(4)?,
                cost_unit_limit: row.get(5)?,
                last_updated: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_failed_jobs(&self, since: f64, limit: i64) -> Result<Vec<ProcessedVideoRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = format!(
            "SELECT {PROCESSED_COLUMNS} FROM processed_videos \
             WHERE added_to_playlist = 0 AND processed_at >= ? \
             ORDER BY processed_at DESC LIMIT ?"
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![since, limit.max(1)], Self::map_processed)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_unprocessed_since(&self, since: f64) -> Result<Vec<WebhookEventRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE processed = 0 AND received_at >= ? \
             ORDER BY received_at"
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![since], Self::map_event)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
