// WebSub lease management: subscribe, renew and retire channel push feeds
// at the hub, with exponential backoff persisted on the subscription row.
use crate::services::now_ts;
use crate::storage::{StorageBackend, SubscriptionRecord};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const WEBSUB_INTERVAL_S: u64 = 30 * 60;
pub const MAX_SUBSCRIBE_ATTEMPTS: i64 = 5;
const LEASE_SAFETY_MARGIN_S: f64 = 3600.0;

pub fn channel_feed_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/xml/feeds/videos.xml?channel_id={channel_id}")
}

#[derive(Debug, Clone)]
pub struct HubRequest {
    pub callback: String,
    pub topic: String,
    pub lease_seconds: i64,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatus {
    Accepted,
    /// The hub no longer serves the topic; the subscription starts over.
    Gone,
    Rejected(u16),
}

#[async_trait]
pub trait Hub: Send + Sync {
    async fn subscribe(&self, request: &HubRequest) -> Result<HubStatus>;
    async fn unsubscribe(&self, request: &HubRequest) -> Result<HubStatus>;
}

pub struct HttpHub {
    http: reqwest::Client,
    hub_url: String,
}

impl HttpHub {
    pub fn new(http: reqwest::Client, hub_url: String) -> Self {
        Self { http, hub_url }
    }

    async fn post_mode(&self, mode: &str, request: &HubRequest) -> Result<HubStatus> {
        let lease = request.lease_seconds.to_string();
        let mut form = vec![
            ("hub.callback", request.callback.as_str()),
            ("hub.topic", request.topic.as_str()),
            ("hub.mode", mode),
            ("hub.lease_seconds", lease.as_str()),
        ];
        if let Some(secret) = request.secret.as_deref() {
            form.push(("hub.secret", secret));
        }
        let response = self.http.post(&self.hub_url).form(&form).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(HubStatus::Accepted);
        }
        if status.as_u16() == 410 {
            return Ok(HubStatus::Gone);
        }
        Ok(HubStatus::Rejected(status.as_u16()))
    }
}

#[async_trait]
impl Hub for HttpHub {
    async fn subscribe(&self, request: &HubRequest) -> Result<HubStatus> {
        self.post_mode("subscribe", request).await
    }

    async fn unsubscribe(&self, request: &HubRequest) -> Result<HubStatus> {
        self.post_mode("unsubscribe", request).await
    }
}

pub struct WebSubManager {
    storage: Arc<dyn StorageBackend>,
    hub: Arc<dyn Hub>,
    callback_url: Option<String>,
    lease_seconds: i64,
    sign_notifications: bool,
}

impl WebSubManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        hub: Arc<dyn Hub>,
        callback_url: Option<String>,
        lease_seconds: i64,
        sign_notifications: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            hub,
            callback_url,
            lease_seconds: lease_seconds.max(60),
            sign_notifications,
        })
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_loop(shutdown).await;
        });
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.tick(now_ts(), &shutdown).await {
                Ok(subscribed) if subscribed > 0 => {
                    info!("confirmed {subscribed} hub subscriptions")
                }
                Ok(_) => {}
                Err(err) => warn!("websub tick failed: {err}"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(Duration::from_secs(WEBSUB_INTERVAL_S)) => {}
            }
        }
    }

    pub async fn tick(&self, now: f64, shutdown: &CancellationToken) -> Result<usize> {
        let Some(callback) = self.callback_url.clone() else {
            warn!("server.base_url is not configured; hub subscriptions are paused");
            return Ok(0);
        };
        let due = self.list_due(now).await?;
        let mut subscribed = 0;
        for subscription in due {
            if shutdown.is_cancelled() {
                break;
            }
            self.note_attempt(&subscription.subscription_id, now).await?;
            let secret = self.resolve_secret(&subscription).await?;
            let request = HubRequest {
                callback: callback.clone(),
                topic: channel_feed_url(&subscription.channel_id),
                lease_seconds: self.lease_seconds,
                secret,
            };
            match self.hub.subscribe(&request).await {
                Ok(HubStatus::Accepted) => {
                    let lease_expires_at = now + self.lease_seconds as f64 - LEASE_SAFETY_MARGIN_S;
                    self.apply(&subscription.subscription_id, move |storage, id| {
                        storage.mark_subscribed(id, lease_expires_at)
                    })
                    .await?;
                    subscribed += 1;
                }
                Ok(HubStatus::Gone) => {
                    warn!(
                        "hub dropped topic for channel {}, resetting subscription",
                        subscription.channel_id
                    );
                    self.apply(&subscription.subscription_id, |storage, id| {
                        storage.reset_websub_state(id)
                    })
                    .await?;
                }
                Ok(HubStatus::Rejected(status)) => {
                    warn!(
                        "hub rejected subscribe for channel {}: status {status}, attempt {}",
                        subscription.channel_id,
                        subscription.attempt_count + 1
                    );
                }
                Err(err) => {
                    warn!(
                        "hub subscribe failed for channel {}: {err}",
                        subscription.channel_id
                    );
                }
            }
        }
        Ok(subscribed)
    }

    /// Best-effort lease retirement; the local row is cleared even when the
    /// hub is unreachable, since an unrenewed lease lapses on its own.
    pub async fn retire(&self, subscription: &SubscriptionRecord) -> Result<()> {
        if let Some(callback) = self.callback_url.clone() {
            let request = HubRequest {
                callback,
                topic: channel_feed_url(&subscription.channel_id),
                lease_seconds: self.lease_seconds,
                secret: subscription.websub_secret.clone(),
            };
            if let Err(err) = self.hub.unsubscribe(&request).await {
                warn!(
                    "hub unsubscribe failed for channel {}: {err}",
                    subscription.channel_id
                );
            }
        }
        self.apply(&subscription.subscription_id, |storage, id| {
            storage.mark_unsubscribed(id)
        })
        .await
    }

    async fn list_due(&self, now: f64) -> Result<Vec<SubscriptionRecord>> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.list_websub_due(now, MAX_SUBSCRIBE_ATTEMPTS))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn note_attempt(&self, subscription_id: &str, now: f64) -> Result<()> {
        self.apply(subscription_id, move |storage, id| {
            storage.record_subscribe_attempt(id, now)
        })
        .await
    }

    async fn resolve_secret(&self, subscription: &SubscriptionRecord) -> Result<Option<String>> {
        if !self.sign_notifications {
            return Ok(None);
        }
        if let Some(secret) = subscription
            .websub_secret
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(Some(secret.to_string()));
        }
        let secret = uuid::Uuid::new_v4().simple().to_string();
        let stored = secret.clone();
        self.apply(&subscription.subscription_id, move |storage, id| {
            storage.set_websub_secret(id, &stored)
        })
        .await?;
        Ok(Some(secret))
    }

    async fn apply<F>(&self, subscription_id: &str, op: F) -> Result<()>
    where
        F: FnOnce(&dyn StorageBackend, &str) -> Result<()> + Send + 'static,
    {
        let storage = self.storage.clone();
        let subscription_id = subscription_id.to_string();
        tokio::task::spawn_blocking(move || op(storage.as_ref(), &subscription_id))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_url_carries_the_channel() {
        assert_eq!(
            channel_feed_url("CH1"),
            "https://www.youtube.com/xml/feeds/videos.xml?channel_id=CH1"
        );
    }
}
