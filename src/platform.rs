// Authenticated client for the video platform: OAuth token refresh, the
// subscription/playlist/search data API, and per-call quota accounting.
use crate::storage::StorageBackend;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SERVICE_NAME: &str = "youtube";
const INSERT_RETRY_ATTEMPTS: i64 = 3;

// Data API v3 quota costs per call.
const COST_LIST: i64 = 1;
const COST_SEARCH: i64 = 100;
const COST_WRITE: i64 = 50;

#[derive(Debug)]
pub enum ApiError {
    Transient(String),
    Unauthorized(String),
    QuotaExceeded(String),
    NotFound(String),
    Malformed(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(message) => write!(f, "transient: {message}"),
            Self::Unauthorized(message) => write!(f, "unauthorized: {message}"),
            Self::QuotaExceeded(message) => write!(f, "quota exceeded: {message}"),
            Self::NotFound(message) => write!(f, "not found: {message}"),
            Self::Malformed(message) => write!(f, "malformed: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChannelListing {
    pub channel_id: String,
    pub title: String,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredVideo {
    pub video_id: String,
    pub title: String,
    pub published_at: f64,
}

/// Seam between the pipeline and the platform's HTTP surface; tests plug in
/// a recording mock.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn refresh_access_token(&self, refresh_token: &str) -> ApiResult<TokenGrant>;
    async fn list_subscriptions(&self, access_token: &str) -> ApiResult<Vec<ChannelListing>>;
    async fn create_playlist(
        &self,
        access_token: &str,
        name: &str,
        description: &str,
    ) -> ApiResult<String>;
    /// Returns the number of attempts used. Transient failures are retried
    /// with exponential backoff inside the call; everything else propagates.
    async fn insert_playlist_item(
        &self,
        access_token: &str,
        playlist_id: &str,
        video_id: &str,
    ) -> ApiResult<i64>;
    /// Recent uploads on a channel since the given time, oldest first.
    async fn search_channel_recent(
        &self,
        access_token: &str,
        channel_id: &str,
        since: f64,
    ) -> ApiResult<Vec<DiscoveredVideo>>;
}

pub struct YouTubeApi {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    oauth_url: String,
    storage: Arc<dyn StorageBackend>,
}

impl YouTubeApi {
    pub fn new(
        http: reqwest::Client,
        client_id: String,
        client_secret: String,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            api_base: API_BASE.to_string(),
            oauth_url: OAUTH_TOKEN_URL.to_string(),
            storage,
        }
    }

    pub fn with_endpoints(mut self, api_base: String, oauth_url: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.oauth_url = oauth_url;
        self
    }

    fn note_usage(&self, requests: i64, cost_units: i64) {
        let storage = self.storage.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(err) = storage.record_api_usage(SERVICE_NAME, requests, cost_units) {
                warn!("quota usage write failed: {err}");
            }
        });
    }

    async fn read_json(response: reqwest::Response) -> ApiResult<Value> {
        if response.status().is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|err| ApiError::Malformed(err.to_string()));
        }
        Err(classify_status(response).await)
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_decode() {
        ApiError::Malformed(err.to_string())
    } else {
        ApiError::Transient(err.to_string())
    }
}

async fn classify_status(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{status} {body}");
    match status.as_u16() {
        401 => ApiError::Unauthorized(message),
        403 => {
            if body.contains("quota") || body.contains("rateLimit") {
                ApiError::QuotaExceeded(message)
            } else {
                ApiError::Unauthorized(message)
            }
        }
        429 => ApiError::QuotaExceeded(message),
        404 | 410 => ApiError::NotFound(message),
        code if code >= 500 => ApiError::Transient(message),
        _ => ApiError::Malformed(message),
    }
}

fn json_str(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn parse_published_at(raw: &str) -> f64 {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.timestamp_millis() as f64 / 1000.0)
        .unwrap_or(0.0)
}

fn to_rfc3339(ts: f64) -> String {
    Utc.timestamp_millis_opt((ts * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[async_trait]
impl Platform for YouTubeApi {
    async fn refresh_access_token(&self, refresh_token: &str) -> ApiResult<TokenGrant> {
        let response = self
            .http
            .post(&self.oauth_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            // The token endpoint answers 400 invalid_grant for revoked consent.
            let body = response.text().await.unwrap_or_default();
            let message = format!("{status} {body}");
            return Err(match status.as_u16() {
                400 | 401 | 403 => ApiError::Unauthorized(message),
                code if code >= 500 => ApiError::Transient(message),
                _ => ApiError::Malformed(message),
            });
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|err| ApiError::Malformed(err.to_string()))?;
        let access_token = json_str(&body, "/access_token")
            .ok_or_else(|| ApiError::Malformed("token response missing access_token".into()))?;
        let expires_in = body
            .pointer("/expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600);
        Ok(TokenGrant {
            access_token,
            expires_in,
            refresh_token: json_str(&body, "/refresh_token"),
        })
    }

    async fn list_subscriptions(&self, access_token: &str) -> ApiResult<Vec<ChannelListing>> {
        let mut output = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("{}/subscriptions", self.api_base))
                .bearer_auth(access_token)
                .query(&[
                    ("part", "snippet"),
                    ("mine", "true"),
                    ("maxResults", "50"),
                ]);
            if let Some(token) = page_token.as_deref() {
                request = request.query(&[("pageToken", token)]);
            }
            let response = request.send().await.map_err(transport_error)?;
            self.note_usage(1, COST_LIST);
            let body = Self::read_json(response).await?;
            let items = body
                .pointer("/items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in &items {
                let Some(channel_id) = json_str(item, "/snippet/resourceId/channelId") else {
                    continue;
                };
                output.push(ChannelListing {
                    channel_id,
                    title: json_str(item, "/snippet/title").unwrap_or_default(),
                    thumbnail: json_str(item, "/snippet/thumbnails/default/url"),
                });
            }
            page_token = json_str(&body, "/nextPageToken");
            if page_token.is_none() {
                return Ok(output);
            }
        }
    }

    async fn create_playlist(
        &self,
        access_token: &str,
        name: &str,
        description: &str,
    ) -> ApiResult<String> {
        let payload = json!({
            "snippet": { "title": name, "description": description },
            "status": { "privacyStatus": "private" },
        });
        let response = self
            .http
            .post(format!("{}/playlists", self.api_base))
            .bearer_auth(access_token)
            .query(&[("part", "snippet,status")])
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        self.note_usage(1, COST_WRITE);
        let body = Self::read_json(response).await?;
        json_str(&body, "/id")
            .ok_or_else(|| ApiError::Malformed("playlist response missing id".into()))
    }

    async fn insert_playlist_item(
        &self,
        access_token: &str,
        playlist_id: &str,
        video_id: &str,
    ) -> ApiResult<i64> {
        let payload = json!({
            "snippet": {
                "playlistId": playlist_id,
                "resourceId": { "kind": "youtube#video", "videoId": video_id },
            },
        });
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .http
                .post(format!("{}/playlistItems", self.api_base))
                .bearer_auth(access_token)
                .query(&[("part", "snippet")])
                .json(&payload)
                .send()
                .await
                .map_err(transport_error);
            self.note_usage(1, COST_WRITE);
            let err = match result {
                Ok(response) if response.status().is_success() => return Ok(attempt),
                Ok(response) => classify_status(response).await,
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= INSERT_RETRY_ATTEMPTS {
                return Err(err);
            }
            sleep(Duration::from_secs(1u64 << attempt)).await;
        }
    }

    async fn search_channel_recent(
        &self,
        access_token: &str,
        channel_id: &str,
        since: f64,
    ) -> ApiResult<Vec<DiscoveredVideo>> {
        let published_after = to_rfc3339(since);
        let response = self
            .http
            .get(format!("{}/search", self.api_base))
            .bearer_auth(access_token)
            .query(&[
                ("part", "snippet"),
                ("channelId", channel_id),
                ("type", "video"),
                ("order", "date"),
                ("maxResults", "10"),
                ("publishedAfter", published_after.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        self.note_usage(1, COST_SEARCH);
        let body = Self::read_json(response).await?;
        let items = body
            .pointer("/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut videos = Vec::new();
        for item in &items {
            let Some(video_id) = json_str(item, "/id/videoId") else {
                continue;
            };
            videos.push(DiscoveredVideo {
                video_id,
                title: json_str(item, "/snippet/title").unwrap_or_default(),
                published_at: json_str(item, "/snippet/publishedAt")
                    .map(|raw| parse_published_at(&raw))
                    .unwrap_or(0.0),
            });
        }
        // The API answers newest first; the pipeline appends oldest first.
        videos.sort_by(|left, right| {
            left.published_at
                .partial_cmp(&right.published_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(videos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_at_round_trip() {
        let ts = parse_published_at("2024-05-01T12:00:00Z");
        assert!(ts > 0.0);
        assert_eq!(to_rfc3339(ts), "2024-05-01T12:00:00Z");
        assert_eq!(parse_published_at("garbage"), 0.0);
    }

    #[test]
    fn error_classes_report_themselves() {
        assert!(ApiError::Transient("x".into()).is_transient());
        assert!(ApiError::Unauthorized("x".into()).is_unauthorized());
        assert!(ApiError::QuotaExceeded("x".into()).is_quota_exceeded());
        assert!(ApiError::NotFound("x".into()).is_not_found());
        assert_eq!(
            ApiError::QuotaExceeded("daily limit".into()).to_string(),
            "quota exceeded: daily limit"
        );
    }
}
