#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tubelater_server::config::Config;
use tubelater_server::platform::{
    ApiError, ApiResult, ChannelListing, DiscoveredVideo, Platform, TokenGrant,
};
use tubelater_server::services::poller::ChannelPoller;
use tubelater_server::services::fanout::VideoProcessor;
use tubelater_server::services::refresh::TokenRefresher;
use tubelater_server::services::websub::{Hub, HubRequest, HubStatus, WebSubManager};
use tubelater_server::state::AppState;
use tubelater_server::storage::{SqliteStorage, StorageBackend, SubscriptionRecord, UserRecord};
use tubelater_server::vault::TokenVault;

pub fn temp_storage() -> Arc<SqliteStorage> {
    let db_path = std::env::temp_dir().join(format!(
        "tubelater_it_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let storage = Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
    storage.ensure_initialized().unwrap();
    storage
}

pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Default)]
pub struct MockPlatform {
    pub refresh_calls: Mutex<Vec<String>>,
    pub insert_calls: Mutex<Vec<(String, String)>>,
    pub refresh_fails: AtomicBool,
    pub insert_fails: AtomicBool,
    pub search_results: Mutex<HashMap<String, Vec<DiscoveredVideo>>>,
    pub listings: Mutex<Vec<ChannelListing>>,
    token_counter: AtomicU64,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_count(&self) -> usize {
        self.insert_calls.lock().unwrap().len()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.lock().unwrap().len()
    }

    pub fn set_search_results(&self, channel_id: &str, videos: Vec<DiscoveredVideo>) {
        self.search_results
            .lock()
            .unwrap()
            .insert(channel_id.to_string(), videos);
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn refresh_access_token(&self, refresh_token: &str) -> ApiResult<TokenGrant> {
        self.refresh_calls
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized("400 invalid_grant".to_string()));
        }
        let serial = self.token_counter.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            access_token: format!("access-{serial}"),
            expires_in: 3600,
            refresh_token: None,
        })
    }

    async fn list_subscriptions(&self, _access_token: &str) -> ApiResult<Vec<ChannelListing>> {
        Ok(self.listings.lock().unwrap().clone())
    }

    async fn create_playlist(
        &self,
        _access_token: &str,
        _name: &str,
        _description: &str,
    ) -> ApiResult<String> {
        Ok("PL-created".to_string())
    }

    async fn insert_playlist_item(
        &self,
        _access_token: &str,
        playlist_id: &str,
        video_id: &str,
    ) -> ApiResult<i64> {
        self.insert_calls
            .lock()
            .unwrap()
            .push((playlist_id.to_string(), video_id.to_string()));
        if self.insert_fails.load(Ordering::SeqCst) {
            return Err(ApiError::NotFound("404 video deleted".to_string()));
        }
        Ok(1)
    }

    async fn search_channel_recent(
        &self,
        _access_token: &str,
        channel_id: &str,
        _since: f64,
    ) -> ApiResult<Vec<DiscoveredVideo>> {
        Ok(self
            .search_results
            .lock()
            .unwrap()
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MockHub {
    pub subscribe_calls: Mutex<Vec<HubRequest>>,
    pub unsubscribe_calls: Mutex<Vec<HubRequest>>,
    pub reject_with: Mutex<Option<u16>>,
    pub gone: AtomicBool,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn always_reject(&self, status: u16) {
        *self.reject_with.lock().unwrap() = Some(status);
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Hub for MockHub {
    async fn subscribe(&self, request: &HubRequest) -> anyhow::Result<HubStatus> {
        self.subscribe_calls.lock().unwrap().push(request.clone());
        if self.gone.load(Ordering::SeqCst) {
            return Ok(HubStatus::Gone);
        }
        if let Some(status) = *self.reject_with.lock().unwrap() {
            return Ok(HubStatus::Rejected(status));
        }
        Ok(HubStatus::Accepted)
    }

    async fn unsubscribe(&self, request: &HubRequest) -> anyhow::Result<HubStatus> {
        self.unsubscribe_calls.lock().unwrap().push(request.clone());
        Ok(HubStatus::Accepted)
    }
}

pub struct TestHarness {
    pub storage: Arc<SqliteStorage>,
    pub vault: Arc<TokenVault>,
    pub platform: Arc<MockPlatform>,
    pub hub: Arc<MockHub>,
    pub state: Arc<AppState>,
}

pub fn build_harness() -> TestHarness {
    let storage = temp_storage();
    let vault = Arc::new(TokenVault::load("").unwrap());
    let platform = MockPlatform::new();
    let hub = MockHub::new();
    let websub = WebSubManager::new(
        storage.clone(),
        hub.clone(),
        Some("https://watch.example.com/webhook".to_string()),
        432_000,
        false,
    );
    let refresher = TokenRefresher::new(storage.clone(), vault.clone(), platform.clone());
    let poller = ChannelPoller::new(storage.clone(), vault.clone(), platform.clone(), 1.0);
    let processor = VideoProcessor::new(storage.clone(), vault.clone(), platform.clone(), 5.0);
    let state = Arc::new(AppState {
        config: Config::default(),
        storage: storage.clone(),
        vault: vault.clone(),
        platform: platform.clone(),
        websub,
        refresher,
        poller,
        processor,
    });
    TestHarness {
        storage,
        vault,
        platform,
        hub,
        state,
    }
}

impl TestHarness {
    /// Seeds a user with encrypted tokens and, optionally, a managed playlist.
    pub fn seed_user(&self, user_id: &str, playlist_id: Option<&str>) -> UserRecord {
        let now = now_ts();
        let record = UserRecord {
            user_id: user_id.to_string(),
            access_token: Some(
                self.vault
                    .encrypt(&format!("access-token-{user_id}"))
                    .unwrap(),
            ),
            refresh_token: Some(
                self.vault
                    .encrypt(&format!("refresh-token-{user_id}"))
                    .unwrap(),
            ),
            token_expires_at: Some(now + 6.0 * 3600.0),
            playlist_id: playlist_id.map(str::to_string),
            automation_disabled: false,
            is_admin: false,
            created_at: now,
            updated_at: now,
        };
        self.storage.upsert_user(&record).unwrap();
        record
    }

    pub fn seed_subscription(&self, user_id: &str, channel_id: &str) -> SubscriptionRecord {
        let record = SubscriptionRecord::new(user_id, channel_id, "channel title", now_ts());
        self.storage.upsert_subscription(&record).unwrap();
        record
    }
}

pub fn notification_xml(channel_id: &str, video_id: &str, title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <title>YouTube video feed</title>
  <entry>
    <id>yt:video:{video_id}</id>
    <yt:videoId>{video_id}</yt:videoId>
    <yt:channelId>{channel_id}</yt:channelId>
    <title>{title}</title>
    <published>2024-05-01T12:00:00Z</published>
  </entry>
</feed>"#
    )
}
