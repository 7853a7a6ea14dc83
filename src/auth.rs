//! OAuth2 credential lifecycle: authorization-code login, token exchange
//! and single-flight refresh against the Spotify accounts service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Result, SpotifyError};
use crate::events::{EventSink, StoreEvent};
use crate::models::TokenResponse;

pub const SCOPES: &str =
    "user-read-currently-playing user-library-read user-read-playback-state playlist-read-collaborative playlist-read-private user-library-modify user-modify-playback-state playlist-modify-public playlist-modify-private";

const OAUTH_STATE: &str = "spotify-sync-oauth-state";

/// How long to wait after the last credential edit before auto-login
const LOGIN_DEBOUNCE: Duration = Duration::from_millis(2000);

/// The consent flow happens in an external browser, so there is no local
/// signal for its completion; the login guard is released by this timer.
const LOGIN_UNLOCK_DELAY: Duration = Duration::from_millis(5000);

/// The two opaque strings that survive restarts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Durable storage collaborator for the token pair
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, tokens: &StoredTokens) -> anyhow::Result<()>;
    async fn load(&self) -> anyhow::Result<Option<StoredTokens>>;
}

/// Hands the authorization URL to whatever can show it to the user
pub trait UrlOpener: Send + Sync {
    fn open_url(&self, url: &str) -> anyhow::Result<()>;
}

/// JSON-file token store, kept next to the other cache files.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, tokens: &StoredTokens) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string(tokens)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Option<StoredTokens>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Accounts-service endpoints, overridable for tests
#[derive(Clone)]
pub struct AuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: "https://accounts.spotify.com/authorize".to_string(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
        }
    }
}

#[derive(Default)]
struct Credentials {
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    is_refreshing: bool,
    is_logging_in: bool,
    has_received_info: bool,
}

impl Credentials {
    fn is_complete(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.redirect_uri.is_some()
    }
}

enum RefreshAction {
    Refresh {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    Login,
    AlreadyRunning,
}

/// Owns the OAuth2 credential state. Tokens are only ever overwritten,
/// never destroyed outside of a 400-class refresh failure, and every
/// successful exchange persists them through the [`TokenStore`].
#[derive(Clone)]
pub struct CredentialBroker {
    http: reqwest::Client,
    state: Arc<Mutex<Credentials>>,
    debounce: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    store: Arc<dyn TokenStore>,
    opener: Arc<dyn UrlOpener>,
    events: EventSink,
    endpoints: AuthEndpoints,
}

impl CredentialBroker {
    pub fn new(store: Arc<dyn TokenStore>, opener: Arc<dyn UrlOpener>, events: EventSink) -> Self {
        Self::with_endpoints(store, opener, events, AuthEndpoints::default())
    }

    pub fn with_endpoints(
        store: Arc<dyn TokenStore>,
        opener: Arc<dyn UrlOpener>,
        events: EventSink,
        endpoints: AuthEndpoints,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            state: Arc::new(Mutex::new(Credentials::default())),
            debounce: Arc::new(std::sync::Mutex::new(None)),
            store,
            opener,
            events,
            endpoints,
        }
    }

    /// Seed tokens from durable storage and, if the credentials are
    /// already complete, refresh right away.
    pub async fn bootstrap(&self) -> Result<()> {
        match self.store.load().await {
            Ok(Some(tokens)) => {
                tracing::info!("found stored auth tokens");
                let mut state = self.state.lock().await;
                state.access_token = Some(tokens.access_token);
                state.refresh_token = Some(tokens.refresh_token);
            }
            Ok(None) => tracing::debug!("no stored auth tokens"),
            Err(e) => tracing::warn!(error = %e, "failed to load stored tokens"),
        }

        let complete = self.state.lock().await.is_complete();
        if complete {
            if let Err(e) = self.refresh_access_token().await {
                tracing::warn!(error = %e, "startup token refresh failed");
            }
        }
        Ok(())
    }

    pub async fn set_client_id(&self, value: impl Into<String>) {
        {
            let mut state = self.state.lock().await;
            state.client_id = Some(value.into());
            state.has_received_info = true;
        }
        self.schedule_auth_check();
    }

    pub async fn set_client_secret(&self, value: impl Into<String>) {
        {
            let mut state = self.state.lock().await;
            state.client_secret = Some(value.into());
            state.has_received_info = true;
        }
        self.schedule_auth_check();
    }

    pub async fn set_redirect_uri(&self, value: impl Into<String>) {
        {
            let mut state = self.state.lock().await;
            state.redirect_uri = Some(value.into());
            state.has_received_info = true;
        }
        self.schedule_auth_check();
    }

    /// Debounced completeness check: every credential edit pushes the
    /// check (and a potential auto-login) back by the full window.
    fn schedule_auth_check(&self) {
        let broker = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(LOGIN_DEBOUNCE).await;
            broker.check_auth().await;
        });

        let mut pending = self.debounce.lock().unwrap();
        if let Some(previous) = pending.replace(task) {
            previous.abort();
        }
    }

    async fn check_auth(&self) {
        let should_login = {
            let state = self.state.lock().await;
            if !state.is_complete() {
                if state.has_received_info {
                    tracing::warn!(
                        missing_client_id = state.client_id.is_none(),
                        missing_client_secret = state.client_secret.is_none(),
                        missing_redirect_uri = state.redirect_uri.is_none(),
                        "auth credentials incomplete"
                    );
                } else {
                    tracing::debug!("waiting for auth credentials");
                }
                false
            } else if state.is_logging_in {
                tracing::debug!("already logging in, skipping auth check");
                false
            } else if state.access_token.is_some() {
                tracing::debug!("already authenticated");
                false
            } else {
                true
            }
        };

        if should_login {
            if let Err(e) = self.login().await {
                tracing::error!(error = %e, "auto-login failed");
            }
        }
    }

    /// Build the authorization URL and hand it to the opener. Guarded by
    /// `is_logging_in`; a second call while one is pending is a logged
    /// no-op. The guard is released by [`LOGIN_UNLOCK_DELAY`], not by the
    /// consent flow itself.
    pub async fn login(&self) -> Result<()> {
        let url = {
            let mut state = self.state.lock().await;
            if state.is_logging_in {
                tracing::debug!("already logging in, ignoring login request");
                return Ok(());
            }
            let client_id = state
                .client_id
                .clone()
                .ok_or_else(|| SpotifyError::Auth("missing client id".to_string()))?;
            let redirect_uri = state
                .redirect_uri
                .clone()
                .ok_or_else(|| SpotifyError::Auth("missing redirect uri".to_string()))?;
            state.is_logging_in = true;

            format!(
                "{}?response_type=code&client_id={}&scope={}&redirect_uri={}&state={}",
                self.endpoints.authorize_url,
                client_id,
                SCOPES.replace(' ', "%20"),
                redirect_uri,
                OAUTH_STATE,
            )
        };

        tracing::info!("opening authorization url");
        if let Err(e) = self.opener.open_url(&url) {
            self.state.lock().await.is_logging_in = false;
            return Err(SpotifyError::Auth(format!(
                "failed to open authorization url: {e}"
            )));
        }

        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(LOGIN_UNLOCK_DELAY).await;
            let mut state = broker.state.lock().await;
            if state.is_logging_in {
                tracing::debug!("releasing login guard");
                state.is_logging_in = false;
            }
        });

        Ok(())
    }

    /// Without a code: return the current access token if one exists.
    /// With a code: exchange it for a token pair, persist, and report.
    pub async fn get_access_token(&self, code: Option<&str>) -> Result<String> {
        let Some(code) = code else {
            return self
                .state
                .lock()
                .await
                .access_token
                .clone()
                .ok_or_else(|| {
                    SpotifyError::Auth("no access token and no authorization code".to_string())
                });
        };

        let (client_id, client_secret, redirect_uri) = {
            let mut state = self.state.lock().await;
            match (
                state.client_id.clone(),
                state.client_secret.clone(),
                state.redirect_uri.clone(),
            ) {
                (Some(id), Some(secret), Some(uri)) => (id, secret, uri),
                _ => {
                    state.is_logging_in = false;
                    return Err(SpotifyError::Auth(
                        "missing client credentials for token exchange".to_string(),
                    ));
                }
            }
        };

        let result = self
            .request_token(
                &[
                    ("code", code),
                    ("redirect_uri", &redirect_uri),
                    ("grant_type", "authorization_code"),
                ],
                &client_id,
                &client_secret,
            )
            .await;

        match result {
            Ok(tokens) => {
                let access_token = tokens.access_token.clone();
                self.store_tokens(tokens).await;
                self.state.lock().await.is_logging_in = false;
                tracing::info!("obtained access and refresh tokens");
                self.events.emit(StoreEvent::Auth { auth_status: true });
                Ok(access_token)
            }
            Err(e) => {
                self.state.lock().await.is_logging_in = false;
                tracing::error!(error = %e, "code exchange failed");
                self.events.emit(StoreEvent::Auth { auth_status: false });
                Err(e)
            }
        }
    }

    /// Single-flight refresh: a second caller while one is in flight is a
    /// no-op and must re-check token state afterward. Without a refresh
    /// token this delegates to [`login`](Self::login); a 400-class
    /// failure clears the tokens and re-initiates login.
    pub async fn refresh_access_token(&self) -> Result<()> {
        let action = {
            let mut state = self.state.lock().await;
            if state.client_id.is_none() || state.client_secret.is_none() {
                return Err(SpotifyError::Auth("missing client credentials".to_string()));
            }
            match state.refresh_token.clone() {
                None => RefreshAction::Login,
                Some(_) if state.is_refreshing => RefreshAction::AlreadyRunning,
                Some(refresh_token) => {
                    state.is_refreshing = true;
                    RefreshAction::Refresh {
                        client_id: state.client_id.clone().unwrap_or_default(),
                        client_secret: state.client_secret.clone().unwrap_or_default(),
                        refresh_token,
                    }
                }
            }
        };

        let (client_id, client_secret, refresh_token) = match action {
            RefreshAction::AlreadyRunning => {
                tracing::debug!("token refresh already in flight, skipping");
                return Ok(());
            }
            RefreshAction::Login => {
                tracing::info!("no refresh token, starting login instead");
                return self.login().await;
            }
            RefreshAction::Refresh {
                client_id,
                client_secret,
                refresh_token,
            } => (client_id, client_secret, refresh_token),
        };

        let result = self
            .request_token(
                &[
                    ("refresh_token", &refresh_token),
                    ("grant_type", "refresh_token"),
                ],
                &client_id,
                &client_secret,
            )
            .await;
        self.state.lock().await.is_refreshing = false;

        match result {
            Ok(tokens) => {
                self.store_tokens(tokens).await;
                tracing::info!("access token refreshed");
                self.events.emit(StoreEvent::Auth { auth_status: true });
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "token refresh failed");
                if matches!(e, SpotifyError::Request { status, .. } if (400..500).contains(&status))
                {
                    // Refresh token rejected: full re-auth is required
                    {
                        let mut state = self.state.lock().await;
                        state.access_token = None;
                        state.refresh_token = None;
                    }
                    self.events.emit(StoreEvent::Auth { auth_status: false });
                    if let Err(login_err) = self.login().await {
                        tracing::error!(error = %login_err, "re-login after failed refresh failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Acquisition entry point for the request gateway: hand back a
    /// usable token, refreshing or initiating login as needed.
    pub async fn ensure_session(&self, force: bool) -> Result<String> {
        if !force {
            if let Some(token) = self.state.lock().await.access_token.clone() {
                return Ok(token);
            }
        }

        let has_refresh_token = self.state.lock().await.refresh_token.is_some();
        if has_refresh_token {
            self.refresh_access_token().await?;
        } else {
            self.login().await?;
        }

        self.state
            .lock()
            .await
            .access_token
            .clone()
            .ok_or_else(|| SpotifyError::Auth("authorization pending, no access token".to_string()))
    }

    pub async fn has_access_token(&self) -> bool {
        self.state.lock().await.access_token.is_some()
    }

    async fn request_token(
        &self,
        params: &[(&str, &str)],
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenResponse> {
        let basic = BASE64.encode(format!("{client_id}:{client_secret}"));
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SpotifyError::from_status(status.as_u16(), false));
        }
        Ok(response.json::<TokenResponse>().await?)
    }

    /// Overwrite the in-memory tokens and persist the pair. Spotify only
    /// sometimes rotates the refresh token; keep the old one otherwise.
    async fn store_tokens(&self, tokens: TokenResponse) {
        let persisted = {
            let mut state = self.state.lock().await;
            state.access_token = Some(tokens.access_token);
            if tokens.refresh_token.is_some() {
                state.refresh_token = tokens.refresh_token;
            }
            match (&state.access_token, &state.refresh_token) {
                (Some(access), Some(refresh)) => Some(StoredTokens {
                    access_token: access.clone(),
                    refresh_token: refresh.clone(),
                }),
                _ => None,
            }
        };

        if let Some(tokens) = persisted {
            if let Err(e) = self.store.save(&tokens).await {
                tracing::warn!(error = %e, "failed to persist tokens");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_tokens_for_test(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) {
        let mut state = self.state.lock().await;
        state.access_token = access_token.map(str::to_string);
        state.refresh_token = refresh_token.map(str::to_string);
    }
}
