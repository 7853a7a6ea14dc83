//! Composition root wiring the broker, gateway, watcher and registry
//! together behind one handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::auth::{CredentialBroker, TokenStore, UrlOpener};
use crate::config::SessionConfig;
use crate::devices::DeviceRegistry;
use crate::error::{Result, SpotifyError};
use crate::events::{EventSink, StoreEvent};
use crate::gateway::RequestGateway;
use crate::models::{Device, PlaybackSnapshot};
use crate::watcher::PlaybackWatcher;

/// One fully-wired client core. Built once at startup; every collaborator
/// is passed its dependencies explicitly, so tests can assemble the same
/// graph with substitutes.
#[derive(Clone)]
pub struct SpotifySession {
    broker: CredentialBroker,
    devices: DeviceRegistry,
    watcher: PlaybackWatcher,
    events: EventSink,
    stop: Arc<AtomicBool>,
}

impl SpotifySession {
    pub fn new(
        store: Arc<dyn TokenStore>,
        opener: Arc<dyn UrlOpener>,
    ) -> (Self, UnboundedReceiver<StoreEvent>) {
        let (events, rx) = EventSink::channel();
        let broker = CredentialBroker::new(store, opener, events.clone());
        let gateway = RequestGateway::new(broker.clone());
        let devices = DeviceRegistry::new(gateway.clone(), events.clone());
        let stop = Arc::new(AtomicBool::new(false));
        let watcher = PlaybackWatcher::new(gateway, devices.clone(), events.clone(), stop.clone());

        (
            Self {
                broker,
                devices,
                watcher,
                events,
                stop,
            },
            rx,
        )
    }

    /// Apply startup configuration and seed tokens from storage.
    pub async fn configure(&self, config: &SessionConfig) -> Result<()> {
        if let Some(id) = &config.client_id {
            self.broker.set_client_id(id.clone()).await;
        }
        if let Some(secret) = &config.client_secret {
            self.broker.set_client_secret(secret.clone()).await;
        }
        if let Some(uri) = &config.redirect_uri {
            self.broker.set_redirect_uri(uri.clone()).await;
        }
        self.broker.bootstrap().await
    }

    pub async fn set_client_id(&self, value: impl Into<String>) {
        self.broker.set_client_id(value).await;
    }

    pub async fn set_client_secret(&self, value: impl Into<String>) {
        self.broker.set_client_secret(value).await;
    }

    pub async fn set_redirect_uri(&self, value: impl Into<String>) {
        self.broker.set_redirect_uri(value).await;
    }

    /// Complete the OAuth flow with the code delivered to the redirect.
    pub async fn handle_auth_code(&self, code: &str) -> Result<()> {
        self.broker.get_access_token(Some(code)).await?;
        Ok(())
    }

    /// Poll for the next track. A timed-out or stopped poll falls back
    /// to the last known snapshot, re-announced for late consumers.
    pub async fn get_current_song(&self) -> Result<Option<PlaybackSnapshot>> {
        match self.watcher.get_current_song().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if e.is_timeout() || matches!(e, SpotifyError::Stopped) => {
                tracing::warn!(error = %e, "poll ended without a change, reusing last snapshot");
                let last = self.watcher.last_snapshot().await;
                if let Some(snapshot) = &last {
                    self.events.emit(StoreEvent::Song(snapshot.clone()));
                }
                Ok(last)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        self.watcher.check_for_refresh().await
    }

    pub async fn like_song(&self) -> Result<()> {
        self.watcher.like_song().await
    }

    pub async fn get_devices(&self) -> Result<Vec<Device>> {
        self.devices.refresh_devices().await?;
        Ok(self.devices.known_devices().await)
    }

    pub async fn set_active_device(&self, device_id: &str) -> Result<()> {
        self.devices.transfer_playback(device_id).await
    }

    pub fn stop(&self) {
        tracing::info!("stopping session");
        self.stop.store(true, Ordering::SeqCst);
    }
}
