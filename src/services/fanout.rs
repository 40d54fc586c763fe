// Fan-out: drains the durable event queue and appends each video to every
// subscribed user's playlist exactly once per (user, video).
use crate::platform::{ApiError, Platform};
use crate::services::now_ts;
use crate::storage::{
    FanoutTarget, ProcessedVideoRecord, StorageBackend, WebhookEventRecord, SOURCE_WEBHOOK,
};
use crate::vault::TokenVault;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_BATCH: i64 = 200;
const INSERT_RETRY_ATTEMPTS: i64 = 3;

pub struct VideoProcessor {
    storage: Arc<dyn StorageBackend>,
    vault: Arc<TokenVault>,
    platform: Arc<dyn Platform>,
    interval_s: f64,
}

struct InsertOutcome {
    added: bool,
    error_message: Option<String>,
    retry_count: i64,
}

impl VideoProcessor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        vault: Arc<TokenVault>,
        platform: Arc<dyn Platform>,
        interval_minutes: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            vault,
            platform,
            interval_s: (interval_minutes.max(0.01)) * 60.0,
        })
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            processor.run_loop(shutdown).await;
        });
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.tick(now_ts(), &shutdown).await {
                Ok(processed) if processed > 0 => info!("processed {processed} queued events"),
                Ok(_) => {}
                Err(err) => warn!("fan-out tick failed: {err}"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(Duration::from_secs_f64(self.interval_s)) => {}
            }
        }
    }

    pub async fn tick(&self, now: f64, shutdown: &CancellationToken) -> Result<usize> {
        let mut processed = 0;
        loop {
            let events = self.pending_events().await?;
            if events.is_empty() {
                return Ok(processed);
            }
            let batch_len = events.len();
            for event in events {
                if shutdown.is_cancelled() {
                    return Ok(processed);
                }
                self.process_event(&event, now, shutdown).await?;
                processed += 1;
            }
            if batch_len < EVENT_BATCH as usize {
                return Ok(processed);
            }
        }
    }

    async fn process_event(
        &self,
        event: &WebhookEventRecord,
        now: f64,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let targets = self.fanout_targets(&event.channel_id).await?;
        for target in targets {
            if shutdown.is_cancelled() {
                // The event stays queued; already-written outcome rows make
                // the rerun skip the users that were finished.
                return Ok(());
            }
            if self.already_attempted(&target.user_id, &event.video_id).await? {
                continue;
            }
            let outcome = self.insert_for_user(&target, event, now).await;
            if let Some(error) = outcome.error_message.as_deref() {
                warn!(
                    "playlist insert failed: user={}, video={}, error={error}",
                    target.user_id, event.video_id
                );
            }
            self.record_outcome(&target, event, outcome, now).await?;
        }
        self.finish_event(&event.event_id, now).await
    }

    async fn insert_for_user(
        &self,
        target: &FanoutTarget,
        event: &WebhookEventRecord,
        now: f64,
    ) -> InsertOutcome {
        let access_token = match self.vault.decrypt(&target.access_token) {
            Ok(token) if !token.trim().is_empty() => token,
            Ok(_) => {
                return InsertOutcome {
                    added: false,
                    error_message: Some("access token is empty".to_string()),
                    retry_count: 0,
                }
            }
            Err(err) => {
                self.disable_user(&target.user_id, now).await;
                return InsertOutcome {
                    added: false,
                    error_message: Some(format!("token decrypt failed: {err}")),
                    retry_count: 0,
                };
            }
        };
        match self
            .platform
            .insert_playlist_item(&access_token, &target.playlist_id, &event.video_id)
            .await
        {
            Ok(attempts) => InsertOutcome {
                added: true,
                error_message: None,
                retry_count: attempts,
            },
            Err(err) => InsertOutcome {
                added: false,
                retry_count: retry_count_for(&err),
                error_message: Some(err.to_string()),
            },
        }
    }

    async fn record_outcome(
        &self,
        target: &FanoutTarget,
        event: &WebhookEventRecord,
        outcome: InsertOutcome,
        now: f64,
    ) -> Result<()> {
        let source = if event.source.trim().is_empty() {
            SOURCE_WEBHOOK.to_string()
        } else {
            event.source.clone()
        };
        let record = ProcessedVideoRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            user_id: target.user_id.clone(),
            video_id: event.video_id.clone(),
            channel_id: event.channel_id.clone(),
            title: event.title.clone(),
            processed_at: now,
            added_to_playlist: outcome.added,
            error_message: outcome.error_message,
            retry_count: outcome.retry_count,
            source,
        };
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.insert_processed_video(&record))
            .await
            .map_err(|err| anyhow!(err.to_string()))??;
        Ok(())
    }

    async fn pending_events(&self) -> Result<Vec<WebhookEventRecord>> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.list_unprocessed_events(EVENT_BATCH))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn fanout_targets(&self, channel_id: &str) -> Result<Vec<FanoutTarget>> {
        let storage = self.storage.clone();
        let channel_id = channel_id.to_string();
        tokio::task::spawn_blocking(move || storage.list_fanout_targets(&channel_id))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn already_attempted(&self, user_id: &str, video_id: &str) -> Result<bool> {
        let storage = self.storage.clone();
        let user_id = user_id.to_string();
        let video_id = video_id.to_string();
        tokio::task::spawn_blocking(move || storage.processed_video_exists(&user_id, &video_id))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn finish_event(&self, event_id: &str, now: f64) -> Result<()> {
        let storage = self.storage.clone();
        let event_id = event_id.to_string();
        tokio::task::spawn_blocking(move || storage.mark_event_processed(&event_id, now))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn disable_user(&self, user_id: &str, now: f64) {
        let storage = self.storage.clone();
        let user_id = user_id.to_string();
        let result =
            tokio::task::spawn_blocking(move || storage.set_automation_disabled(&user_id, true, now))
                .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("disable automation failed: {err}"),
            Err(err) => warn!("disable automation task failed: {err}"),
        }
    }
}

/// Attempts the client burned before giving up: transient failures exhaust
/// the in-call retries, everything else fails on the first request.
fn retry_count_for(err: &ApiError) -> i64 {
    if err.is_transient() {
        INSERT_RETRY_ATTEMPTS
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_count_tracks_error_class() {
        assert_eq!(
            retry_count_for(&ApiError::Transient("timeout".into())),
            INSERT_RETRY_ATTEMPTS
        );
        assert_eq!(retry_count_for(&ApiError::Unauthorized("401".into())), 1);
        assert_eq!(retry_count_for(&ApiError::QuotaExceeded("429".into())), 1);
    }
}
