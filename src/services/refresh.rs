// Access-token refresh loop. Users whose refresh fails are switched off
// until they re-authenticate; their refresh token is never discarded.
use crate::platform::Platform;
use crate::services::now_ts;
use crate::storage::{StorageBackend, UserRecord};
use crate::vault::TokenVault;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const REFRESH_INTERVAL_S: u64 = 15 * 60;
const EXPIRY_BUFFER_S: f64 = 30.0 * 60.0;

pub struct TokenRefresher {
    storage: Arc<dyn StorageBackend>,
    vault: Arc<TokenVault>,
    platform: Arc<dyn Platform>,
}

impl TokenRefresher {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        vault: Arc<TokenVault>,
        platform: Arc<dyn Platform>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            vault,
            platform,
        })
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let refresher = Arc::clone(self);
        tokio::spawn(async move {
            refresher.run_loop(shutdown).await;
        });
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.tick(now_ts(), &shutdown).await {
                Ok(refreshed) if refreshed > 0 => info!("refreshed {refreshed} access tokens"),
                Ok(_) => {}
                Err(err) => warn!("token refresh tick failed: {err}"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(Duration::from_secs(REFRESH_INTERVAL_S)) => {}
            }
        }
    }

    /// Refresh is due when the expiry falls inside the buffer, or when the
    /// expiry was never recorded but a refresh token exists.
    pub fn needs_refresh(user: &UserRecord, now: f64) -> bool {
        match user.token_expires_at {
            Some(expires_at) => expires_at <= now + EXPIRY_BUFFER_S,
            None => user.has_refresh_token(),
        }
    }

    pub async fn tick(&self, now: f64, shutdown: &CancellationToken) -> Result<usize> {
        let storage = self.storage.clone();
        let users = tokio::task::spawn_blocking(move || storage.list_refreshable_users())
            .await
            .map_err(|err| anyhow!(err.to_string()))??;
        let mut refreshed = 0;
        for user in users {
            if shutdown.is_cancelled() {
                break;
            }
            if !Self::needs_refresh(&user, now) {
                continue;
            }
            match self.refresh_user(&user, now).await {
                Ok(()) => refreshed += 1,
                Err(err) => {
                    warn!(
                        "token refresh failed for {}, disabling automation: {err}",
                        user.user_id
                    );
                    self.disable_user(&user.user_id, now).await;
                }
            }
        }
        Ok(refreshed)
    }

    async fn refresh_user(&self, user: &UserRecord, now: f64) -> Result<()> {
        let opaque = user.refresh_token.clone().unwrap_or_default();
        let refresh_token = self.vault.decrypt(&opaque)?;
        if refresh_token.trim().is_empty() {
            return Err(anyhow!("refresh token is empty"));
        }
        let grant = self
            .platform
            .refresh_access_token(&refresh_token)
            .await
            .map_err(|err| anyhow!(err.to_string()))?;
        let access_opaque = self.vault.encrypt(&grant.access_token)?;
        let rotated_opaque = match grant.refresh_token.as_deref() {
            Some(token) => Some(self.vault.encrypt(token)?),
            None => None,
        };
        let expires_at = now + grant.expires_in.max(0) as f64;
        let storage = self.storage.clone();
        let user_id = user.user_id.clone();
        tokio::task::spawn_blocking(move || {
            storage.update_user_tokens(
                &user_id,
                &access_opaque,
                rotated_opaque.as_deref(),
                expires_at,
                now,
            )
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))??;
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with(expires_at: Option<f64>, refresh_token: Option<&str>) -> UserRecord {
        UserRecord {
            user_id: "u1".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            token_expires_at: expires_at,
            ..UserRecord::default()
        }
    }

    #[test]
    fn refresh_due_inside_buffer() {
        let now = 1_000_000.0;
        assert!(TokenRefresher::needs_refresh(
            &user_with(Some(now + EXPIRY_BUFFER_S), Some("enc")),
            now
        ));
        assert!(TokenRefresher::needs_refresh(
            &user_with(Some(now - 10.0), Some("enc")),
            now
        ));
        assert!(!TokenRefresher::needs_refresh(
            &user_with(Some(now + EXPIRY_BUFFER_S + 1.0), Some("enc")),
            now
        ));
    }

    #[test]
    fn unknown_expiry_refreshes_only_with_refresh_token() {
        let now = 1_000_000.0;
        assert!(TokenRefresher::needs_refresh(
            &user_with(None, Some("enc")),
            now
        ));
        assert!(!TokenRefresher::needs_refresh(&user_with(None, None), now));
        assert!(!TokenRefresher::needs_refresh(
            &user_with(None, Some("  ")),
            now
        ));
    }
}
