// Fallback discovery for channels whose push feed is missing, expired or
// stale. Synthesized events land in the same queue the webhook feeds, so
// the downstream fan-out is identical.
use crate::platform::{DiscoveredVideo, Platform};
use crate::services::now_ts;
use crate::storage::{PollTarget, StorageBackend, WebhookEventRecord, SOURCE_POLLING};
use crate::vault::TokenVault;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const LOOKBACK_S: f64 = 7.0 * 86_400.0;
const INTER_CHANNEL_SLEEP_MS: u64 = 1000;

pub struct ChannelPoller {
    storage: Arc<dyn StorageBackend>,
    vault: Arc<TokenVault>,
    platform: Arc<dyn Platform>,
    interval_s: f64,
}

impl ChannelPoller {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        vault: Arc<TokenVault>,
        platform: Arc<dyn Platform>,
        interval_hours: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            vault,
            platform,
            interval_s: (interval_hours.max(0.01)) * 3600.0,
        })
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            poller.run_loop(shutdown).await;
        });
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.tick(now_ts(), &shutdown).await {
                Ok(discovered) if discovered > 0 => {
                    info!("poller queued {discovered} videos")
                }
                Ok(_) => {}
                Err(err) => warn!("polling tick failed: {err}"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(Duration::from_secs_f64(self.interval_s)) => {}
            }
        }
    }

    pub async fn tick(&self, now: f64, shutdown: &CancellationToken) -> Result<usize> {
        let targets = self.list_due(now).await?;
        let mut discovered = 0;
        let mut first = true;
        for target in targets {
            if shutdown.is_cancelled() {
                break;
            }
            if !first {
                // Spreads API load; the poller is the heaviest quota consumer.
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(Duration::from_millis(INTER_CHANNEL_SLEEP_MS)) => {}
                }
            }
            first = false;
            match self.poll_channel(&target, now).await {
                Ok(count) => discovered += count,
                Err(PollFailure::QuotaExhausted(message)) => {
                    warn!("polling stopped, quota exhausted: {message}");
                    break;
                }
                Err(PollFailure::Skipped(message)) => {
                    warn!(
                        "polling skipped channel {}: {message}",
                        target.subscription.channel_id
                    );
                }
                Err(PollFailure::Fatal(err)) => return Err(err),
            }
        }
        Ok(discovered)
    }

    async fn poll_channel(&self, target: &PollTarget, now: f64) -> PollResult<usize> {
        let subscription = &target.subscription;
        let access_token = match self.vault.decrypt(&target.access_token) {
            Ok(token) if !token.trim().is_empty() => token,
            Ok(_) => return Err(PollFailure::Skipped("access token is empty".to_string())),
            Err(err) => {
                // Undecryptable token: switch the owner off instead of retrying forever.
                self.disable_user(&subscription.user_id, now).await;
                return Err(PollFailure::Skipped(format!("token decrypt failed: {err}")));
            }
        };
        let videos = match self
            .platform
            .search_channel_recent(&access_token, &subscription.channel_id, now - LOOKBACK_S)
            .await
        {
            Ok(videos) => videos,
            Err(err) if err.is_quota_exceeded() => {
                return Err(PollFailure::QuotaExhausted(err.to_string()))
            }
            Err(err) => return Err(PollFailure::Skipped(err.to_string())),
        };
        let fresh = fresh_videos(&videos, subscription.last_polled_video_id.as_deref());
        let mut queued = 0;
        for video in fresh {
            if self
                .queue_discovered(subscription, video, now)
                .await
                .map_err(PollFailure::Fatal)?
            {
                queued += 1;
            }
        }
        let latest = videos.last().map(|video| video.video_id.clone());
        self.finish_channel(&subscription.subscription_id, latest, now)
            .await
            .map_err(PollFailure::Fatal)?;
        Ok(queued)
    }

    async fn queue_discovered(
        &self,
        subscription: &crate::storage::SubscriptionRecord,
        video: &DiscoveredVideo,
        now: f64,
    ) -> Result<bool> {
        let storage = self.storage.clone();
        let channel_id = subscription.channel_id.clone();
        let video_id = video.video_id.clone();
        let title = video.title.clone();
        let published_at = video.published_at;
        tokio::task::spawn_blocking(move || {
            if storage.webhook_event_exists(&channel_id, &video_id)? {
                return Ok(false);
            }
            let raw_payload = json!({
                "channel_id": channel_id,
                "video_id": video_id,
                "published_at": published_at,
                "discovered_by": "poller",
            })
            .to_string();
            let record = WebhookEventRecord::new(
                &channel_id,
                &video_id,
                Some(title).filter(|text| !text.trim().is_empty()),
                SOURCE_POLLING,
                raw_payload,
                now,
            );
            storage.insert_webhook_event(&record)?;
            Ok(true)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn finish_channel(
        &self,
        subscription_id: &str,
        latest: Option<String>,
        now: f64,
    ) -> Result<()> {
        let storage = self.storage.clone();
        let subscription_id = subscription_id.to_string();
        tokio::task::spawn_blocking(move || {
            storage.update_poll_state(&subscription_id, latest.as_deref(), now)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn list_due(&self, now: f64) -> Result<Vec<PollTarget>> {
        let storage = self.storage.clone();
        let interval_s = self.interval_s;
        tokio::task::spawn_blocking(move || storage.list_polling_due(now, interval_s))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn disable_user(&self, user_id: &str, now: f64) {
        let storage = self.storage.clone();
        let user_id = user_id.to_string();
        let result =
            tokio::task::spawn_blocking(move || storage.set_automation_disabled(&user_id, true, now))
                .await;
        if let Ok(Err(err)) | Err(err) = result.map_err(|err| anyhow!(err.to_string())) {
            warn!("disable automation failed: {err}");
        }
    }
}

enum PollFailure {
    /// Daily quota is gone; the whole tick stops and resumes next interval.
    QuotaExhausted(String),
    /// This channel is skipped; the rest of the tick continues.
    Skipped(String),
    Fatal(anyhow::Error),
}

type PollResult<T> = std::result::Result<T, PollFailure>;

/// Everything after the last video the previous poll recorded, oldest first.
/// An unknown marker means the whole window is fresh.
fn fresh_videos<'a>(
    videos: &'a [DiscoveredVideo],
    last_polled_video_id: Option<&str>,
) -> &'a [DiscoveredVideo] {
    let Some(marker) = last_polled_video_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return videos;
    };
    match videos.iter().position(|video| video.video_id == marker) {
        Some(index) => &videos[index + 1..],
        None => videos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: &str, published_at: f64) -> DiscoveredVideo {
        DiscoveredVideo {
            video_id: id.to_string(),
            title: format!("video {id}"),
            published_at,
        }
    }

    #[test]
    fn fresh_videos_resume_after_marker() {
        let videos = vec![video("a", 1.0), video("b", 2.0), video("c", 3.0)];
        let fresh = fresh_videos(&videos, Some("b"));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].video_id, "c");
    }

    #[test]
    fn unknown_or_missing_marker_keeps_everything() {
        let videos = vec![video("a", 1.0), video("b", 2.0)];
        assert_eq!(fresh_videos(&videos, None).len(), 2);
        assert_eq!(fresh_videos(&videos, Some("zz")).len(), 2);
        assert_eq!(fresh_videos(&videos, Some("  ")).len(), 2);
    }

    #[test]
    fn marker_at_tail_yields_nothing() {
        let videos = vec![video("a", 1.0), video("b", 2.0)];
        assert!(fresh_videos(&videos, Some("b")).is_empty());
    }
}
