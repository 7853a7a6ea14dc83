//! Authenticated API gateway with request de-duplication, response
//! caching and a single forced-refresh retry on 401

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Method, StatusCode};
use tokio::sync::Mutex;

use crate::auth::CredentialBroker;
use crate::cache::{CacheKey, CachedBody, ResponseCache, SharedResponse};
use crate::error::{Result, SpotifyError};
use crate::models::{Device, DeviceList, PlayerResponse};

const API_BASE_URL: &str = "https://api.spotify.com/v1";

type SharedToken = Shared<BoxFuture<'static, std::result::Result<String, Arc<SpotifyError>>>>;

/// Per-request knobs. `force_refresh` bypasses the read side of the
/// cache; the result is still recorded for later callers.
#[derive(Clone, Copy, Debug)]
pub struct RequestOptions {
    pub force_refresh: bool,
    pub cache_time: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            cache_time: Duration::from_millis(10_000),
        }
    }
}

/// All API traffic funnels through here. Identical GETs inside the TTL
/// window share one network call; token acquisition is single-flight
/// across every concurrent request.
#[derive(Clone)]
pub struct RequestGateway {
    http: reqwest::Client,
    auth: CredentialBroker,
    cache: Arc<ResponseCache>,
    token_slot: Arc<Mutex<Option<SharedToken>>>,
    base_url: String,
}

impl RequestGateway {
    pub fn new(auth: CredentialBroker) -> Self {
        Self::with_base_url(auth, API_BASE_URL)
    }

    pub fn with_base_url(auth: CredentialBroker, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
            cache: Arc::new(ResponseCache::new()),
            token_slot: Arc::new(Mutex::new(None)),
            base_url: base_url.into(),
        }
    }

    pub fn auth(&self) -> &CredentialBroker {
        &self.auth
    }

    /// Issue (or join) a request. GETs are keyed into the cache before
    /// the first await, so racing callers always find the in-flight
    /// future rather than issuing their own.
    pub async fn request(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<CachedBody> {
        let key = CacheKey::new(&method, &url, body.as_ref());
        let cacheable = method == Method::GET;

        if cacheable {
            if let Some(pending) = self.cache.get(&key, options.cache_time) {
                // a forced read skips resolved entries but still joins an
                // in-flight call, keeping one network call per key
                if !options.force_refresh || pending.peek().is_none() {
                    tracing::debug!(%url, "joining cached request");
                    return Ok(pending.await?);
                }
            }
        }

        let gateway = self.clone();
        let evict_key = key.clone();
        let response: SharedResponse = async move {
            let result = gateway.execute(&method, &url, body.as_ref()).await;
            if result.is_err() {
                gateway.cache.evict(&evict_key);
            }
            result.map_err(Arc::new)
        }
        .boxed()
        .shared();

        if cacheable {
            self.cache.insert(key, response.clone());
        }
        Ok(response.await?)
    }

    async fn execute(
        &self,
        method: &Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<CachedBody> {
        let token = self.acquire_token(false).await?;
        let mut response = self.send(method, url, body, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!(%url, "got 401, forcing a token refresh and retrying once");
            let token = self.acquire_token(true).await?;
            response = self.send(method, url, body, &token).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(SpotifyError::Request {
                    status: 401,
                    retried: true,
                });
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(SpotifyError::from_status(status.as_u16(), false));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let text = response.text().await?;
        if text.is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(&text)?;
        Ok(Some(Arc::new(value)))
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Single-flight token acquisition. Concurrent callers all await one
    /// `ensure_session`; the slot is cleared only by a caller whose
    /// awaited future is still the one occupying it, so a forced refresh
    /// started in the meantime is never discarded.
    async fn acquire_token(&self, force: bool) -> std::result::Result<String, Arc<SpotifyError>> {
        let pending = {
            let mut slot = self.token_slot.lock().await;
            if force {
                *slot = None;
            }
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let auth = self.auth.clone();
                    let fut: SharedToken =
                        async move { auth.ensure_session(force).await.map_err(Arc::new) }
                            .boxed()
                            .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let result = pending.clone().await;

        let mut slot = self.token_slot.lock().await;
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
            *slot = None;
        }
        result
    }

    /// `GET /me/player`. `None` means nothing is playing (204).
    pub async fn get_current_playback(&self) -> Result<Option<PlayerResponse>> {
        let body = self
            .request(
                Method::GET,
                format!("{}/me/player?additional_types=episode", self.base_url),
                None,
                RequestOptions {
                    force_refresh: true,
                    ..Default::default()
                },
            )
            .await?;
        match body {
            Some(value) => Ok(Some(serde_json::from_value((*value).clone())?)),
            None => Ok(None),
        }
    }

    pub async fn get_devices(&self) -> Result<Vec<Device>> {
        let body = self
            .request(
                Method::GET,
                format!("{}/me/player/devices", self.base_url),
                None,
                RequestOptions::default(),
            )
            .await?;
        match body {
            Some(value) => {
                let list: DeviceList = serde_json::from_value((*value).clone())?;
                Ok(list.devices)
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn transfer_playback(&self, device_id: &str) -> Result<()> {
        self.request(
            Method::PUT,
            format!("{}/me/player", self.base_url),
            Some(serde_json::json!({ "device_ids": [device_id], "play": true })),
            RequestOptions::default(),
        )
        .await?;
        Ok(())
    }

    pub async fn check_liked(&self, track_id: &str) -> Result<bool> {
        let body = self
            .request(
                Method::GET,
                format!("{}/me/tracks/contains?ids={}", self.base_url, track_id),
                None,
                RequestOptions::default(),
            )
            .await?;
        match body {
            Some(value) => {
                let flags: Vec<bool> = serde_json::from_value((*value).clone())?;
                Ok(flags.first().copied().unwrap_or(false))
            }
            None => Ok(false),
        }
    }

    pub async fn set_liked(&self, track_id: &str, liked: bool) -> Result<()> {
        let method = if liked { Method::PUT } else { Method::DELETE };
        self.request(
            method,
            format!("{}/me/tracks?ids={}", self.base_url, track_id),
            None,
            RequestOptions::default(),
        )
        .await?;
        Ok(())
    }
}
