// Process wiring: storage, vault and clients are constructed once at boot
// and handed to the background loops explicitly.
use crate::config::Config;
use crate::platform::{Platform, YouTubeApi};
use crate::services::poller::ChannelPoller;
use crate::services::fanout::VideoProcessor;
use crate::services::refresh::TokenRefresher;
use crate::services::websub::{HttpHub, WebSubManager};
use crate::storage::{build_storage, StorageBackend};
use crate::vault::TokenVault;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub vault: Arc<TokenVault>,
    pub platform: Arc<dyn Platform>,
    pub websub: Arc<WebSubManager>,
    pub refresher: Arc<TokenRefresher>,
    pub poller: Arc<ChannelPoller>,
    pub processor: Arc<VideoProcessor>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage)?;
        storage.ensure_initialized()?;
        let vault = Arc::new(TokenVault::load(&config.vault.key_dir)?);
        let http = reqwest::Client::new();
        let platform: Arc<dyn Platform> = Arc::new(YouTubeApi::new(
            http.clone(),
            config.auth.client_id.clone(),
            config.auth.client_secret.clone(),
            storage.clone(),
        ));
        let callback_url = config.callback_url();
        if callback_url.is_none() {
            warn!("server.base_url is not set; hub subscriptions stay paused until it is");
        }
        let hub = Arc::new(HttpHub::new(http, config.websub.hub_url.clone()));
        let websub = WebSubManager::new(
            storage.clone(),
            hub,
            callback_url,
            config.websub.lease_seconds,
            config.websub.sign_notifications,
        );
        let refresher = TokenRefresher::new(storage.clone(), vault.clone(), platform.clone());
        let poller = ChannelPoller::new(
            storage.clone(),
            vault.clone(),
            platform.clone(),
            config.polling.interval_hours,
        );
        let processor = VideoProcessor::new(
            storage.clone(),
            vault.clone(),
            platform.clone(),
            config.processing.interval_minutes,
        );
        Ok(Self {
            config,
            storage,
            vault,
            platform,
            websub,
            refresher,
            poller,
            processor,
        })
    }

    pub fn start_background(&self, shutdown: &CancellationToken) {
        self.refresher.start(shutdown.clone());
        self.websub.start(shutdown.clone());
        self.poller.start(shutdown.clone());
        self.processor.start(shutdown.clone());
    }
}
