// Subscription bootstrap: refills a user's channel list from the platform,
// creates the managed playlist on first run, and nudges the hub manager so
// new channels get push coverage without waiting for the next tick.
use crate::platform::Platform;
use crate::services::now_ts;
use crate::services::websub::WebSubManager;
use crate::storage::{StorageBackend, SubscriptionRecord};
use crate::vault::TokenVault;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PLAYLIST_NAME: &str = "Auto Watch Later";
const PLAYLIST_DESCRIPTION: &str = "New uploads from your subscriptions, added automatically.";

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub playlist_id: String,
    pub total_channels: usize,
    pub added_channels: usize,
    pub removed_channels: usize,
}

pub async fn sync_user_subscriptions(
    storage: Arc<dyn StorageBackend>,
    vault: Arc<TokenVault>,
    platform: Arc<dyn Platform>,
    websub: Arc<WebSubManager>,
    user_id: &str,
) -> Result<SyncOutcome> {
    let now = now_ts();
    let user = {
        let storage = storage.clone();
        let user_id = user_id.trim().to_string();
        tokio::task::spawn_blocking(move || storage.get_user(&user_id))
            .await
            .map_err(|err| anyhow!(err.to_string()))??
    };
    let Some(user) = user else {
        return Err(anyhow!("user not found"));
    };
    if user.automation_disabled {
        return Err(anyhow!("automation is disabled for this user"));
    }
    let access_token = match user.access_token.as_deref() {
        Some(opaque) if !opaque.trim().is_empty() => match vault.decrypt(opaque) {
            Ok(token) => token,
            Err(err) => {
                let storage = storage.clone();
                let owner = user.user_id.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    storage.set_automation_disabled(&owner, true, now)
                })
                .await;
                return Err(anyhow!("access token decrypt failed: {err}"));
            }
        },
        _ => return Err(anyhow!("user has no access token")),
    };

    let playlist_id = match user
        .playlist_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(existing) => existing.to_string(),
        None => {
            let created = platform
                .create_playlist(&access_token, PLAYLIST_NAME, PLAYLIST_DESCRIPTION)
                .await
                .map_err(|err| anyhow!("playlist create failed: {err}"))?;
            let storage = storage.clone();
            let owner = user.user_id.clone();
            let playlist = created.clone();
            tokio::task::spawn_blocking(move || storage.set_user_playlist(&owner, &playlist, now))
                .await
                .map_err(|err| anyhow!(err.to_string()))??;
            info!("created managed playlist {created} for {}", user.user_id);
            created
        }
    };

    let listings = platform
        .list_subscriptions(&access_token)
        .await
        .map_err(|err| anyhow!("subscription listing failed: {err}"))?;

    let existing = {
        let storage = storage.clone();
        let owner = user.user_id.clone();
        tokio::task::spawn_blocking(move || storage.list_user_subscriptions(&owner))
            .await
            .map_err(|err| anyhow!(err.to_string()))??
    };

    let listed_channels: HashSet<String> = listings
        .iter()
        .map(|listing| listing.channel_id.clone())
        .collect();
    let mut added = 0;
    for listing in &listings {
        let record = match existing
            .iter()
            .find(|sub| sub.channel_id == listing.channel_id)
        {
            // Known channel: refresh the title, keep the opt-in and push/poll state.
            Some(known) => {
                let mut record = known.clone();
                record.channel_title = listing.title.clone();
                record
            }
            None => {
                added += 1;
                SubscriptionRecord::new(&user.user_id, &listing.channel_id, &listing.title, now)
            }
        };
        let storage = storage.clone();
        tokio::task::spawn_blocking(move || storage.upsert_subscription(&record))
            .await
            .map_err(|err| anyhow!(err.to_string()))??;
    }

    let mut removed = 0;
    for stale in existing
        .iter()
        .filter(|sub| !listed_channels.contains(&sub.channel_id))
    {
        if stale.websub_subscribed {
            if let Err(err) = websub.retire(stale).await {
                warn!(
                    "lease retirement failed for channel {}: {err}",
                    stale.channel_id
                );
            }
        }
        let storage = storage.clone();
        let owner = user.user_id.clone();
        let channel = stale.channel_id.clone();
        tokio::task::spawn_blocking(move || storage.delete_subscription(&owner, &channel))
            .await
            .map_err(|err| anyhow!(err.to_string()))??;
        removed += 1;
    }

    // Subscribe the newcomers right away rather than on the next timer tick.
    if let Err(err) = websub.tick(now, &CancellationToken::new()).await {
        warn!("hub subscribe pass after sync failed: {err}");
    }

    Ok(SyncOutcome {
        playlist_id,
        total_channels: listings.len(),
        added_channels: added,
        removed_channels: removed,
    })
}
