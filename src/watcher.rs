//! Adaptive playback polling
//!
//! A song change on the player side is detected by re-reading the player
//! state with a growing delay between reads. The loop gives up once the
//! delay hits its cap or the overall deadline passes, whichever is first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::devices::DeviceRegistry;
use crate::error::{Result, SpotifyError};
use crate::events::{EventSink, StoreEvent};
use crate::gateway::RequestGateway;
use crate::models::{PlaybackSnapshot, PlayerResponse, PlayingType};

/// How long an in-flight refresh check suppresses new ones before it is
/// considered wedged and abandoned
const REFRESH_GUARD: Duration = Duration::from_secs(5);

const LIKE_ICON_ID: &str = "like_song";

/// Backoff shape of the poll loop. The first read happens immediately;
/// each subsequent read waits `growth` times longer than the last.
#[derive(Clone, Copy, Debug)]
pub struct PollTiming {
    pub initial_delay_ms: f64,
    pub growth: f64,
    pub delay_cap_ms: f64,
    pub timeout: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500.0,
            growth: 1.3,
            delay_cap_ms: 1000.0,
            timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Clone)]
pub struct PlaybackWatcher {
    gateway: RequestGateway,
    devices: DeviceRegistry,
    events: EventSink,
    http: reqwest::Client,
    last_snapshot: Arc<Mutex<Option<PlaybackSnapshot>>>,
    refresh_started: Arc<Mutex<Option<Instant>>>,
    stop: Arc<AtomicBool>,
    timing: PollTiming,
}

impl PlaybackWatcher {
    pub fn new(
        gateway: RequestGateway,
        devices: DeviceRegistry,
        events: EventSink,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self::with_timing(gateway, devices, events, stop, PollTiming::default())
    }

    pub fn with_timing(
        gateway: RequestGateway,
        devices: DeviceRegistry,
        events: EventSink,
        stop: Arc<AtomicBool>,
        timing: PollTiming,
    ) -> Self {
        Self {
            gateway,
            devices,
            events,
            http: reqwest::Client::new(),
            last_snapshot: Arc::new(Mutex::new(None)),
            refresh_started: Arc::new(Mutex::new(None)),
            stop,
            timing,
        }
    }

    pub async fn last_snapshot(&self) -> Option<PlaybackSnapshot> {
        self.last_snapshot.lock().await.clone()
    }

    /// Poll until the playing track differs from the last one seen, then
    /// publish the new snapshot. `Ok(None)` means nothing representable
    /// is playing (player idle, ads, unknown content).
    pub async fn get_current_song(&self) -> Result<Option<PlaybackSnapshot>> {
        let previous_id = {
            let last = self.last_snapshot.lock().await;
            last.as_ref().and_then(|s| s.id.clone())
        };

        let playback = match self.poll_for_change(previous_id.as_deref()).await? {
            Some(playback) => playback,
            None => return Ok(None),
        };

        let liked = match (playback.currently_playing_type, playback.item_id()) {
            (PlayingType::Track, Some(id)) => self.gateway.check_liked(id).await?,
            _ => false,
        };

        let snapshot = PlaybackSnapshot::from_playback(&playback, liked)?;
        *self.last_snapshot.lock().await = Some(snapshot.clone());

        tracing::info!(track = %snapshot.track_name, artist = %snapshot.artist, "now playing");
        self.events.emit(StoreEvent::Song(snapshot.clone()));
        self.publish_thumbnail(snapshot.thumbnail_url.as_deref()).await;
        self.events.emit(StoreEvent::Icon {
            id: LIKE_ICON_ID.to_string(),
            state: if liked { "liked".to_string() } else { String::new() },
        });

        Ok(Some(snapshot))
    }

    /// The backoff loop. Reads start at `initial_delay_ms` spacing and
    /// grow by `growth` per iteration; the loop ends with a changed
    /// track, a timeout, or a stop request.
    async fn poll_for_change(&self, previous_id: Option<&str>) -> Result<Option<PlayerResponse>> {
        let started = Instant::now();
        let mut delay_ms = self.timing.initial_delay_ms;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(SpotifyError::Stopped);
            }

            let Some(playback) = self.gateway.get_current_playback().await? else {
                tracing::debug!("nothing playing");
                return Ok(None);
            };

            if let Some(device) = &playback.device {
                self.devices.ingest_from_playback(device).await;
            }

            match playback.currently_playing_type {
                PlayingType::Track => {
                    if playback.item_id() != previous_id {
                        return Ok(Some(playback));
                    }
                    tracing::debug!(delay_ms, "track unchanged, backing off");
                }
                PlayingType::Episode => {
                    // episode progress moves without an id change; one
                    // fresh read is the best state we will get
                    let refreshed = self.gateway.get_current_playback().await?;
                    return Ok(Some(refreshed.unwrap_or(playback)));
                }
                other => {
                    tracing::warn!(kind = ?other, "unsupported playing type");
                    return Ok(None);
                }
            }

            delay_ms *= self.timing.growth;
            tokio::time::sleep(Duration::from_micros((delay_ms * 1000.0) as u64)).await;

            if started.elapsed() >= self.timing.timeout || delay_ms >= self.timing.delay_cap_ms {
                return Err(SpotifyError::Timeout);
            }
        }
    }

    /// Cheap externally-triggered check: one playback read, and a full
    /// poll only if the track actually differs from the last snapshot.
    /// A check arriving while one is in flight is dropped; a completed
    /// check never blocks the next.
    pub async fn check_for_refresh(&self) -> Result<()> {
        {
            let mut started = self.refresh_started.lock().await;
            if let Some(at) = *started {
                if at.elapsed() < REFRESH_GUARD {
                    tracing::debug!("refresh check already in flight, skipping");
                    return Ok(());
                }
                tracing::warn!("abandoning a stale refresh check");
            }
            *started = Some(Instant::now());
        }

        let result = self.refresh_inner().await;
        *self.refresh_started.lock().await = None;
        result
    }

    async fn refresh_inner(&self) -> Result<()> {
        let Some(playback) = self.gateway.get_current_playback().await? else {
            return Ok(());
        };
        if let Some(device) = &playback.device {
            self.devices.ingest_from_playback(device).await;
        }

        let last_id = {
            let last = self.last_snapshot.lock().await;
            last.as_ref().and_then(|s| s.id.clone())
        };
        if playback.item_id() != last_id.as_deref() {
            tracing::debug!("track changed since last snapshot, running full poll");
            self.get_current_song().await?;
        }
        Ok(())
    }

    /// Toggle the liked state of the current track and report the icon.
    pub async fn like_song(&self) -> Result<()> {
        let snapshot = self.last_snapshot.lock().await.clone();
        let Some(snapshot) = snapshot else {
            tracing::debug!("no current song to like");
            return Ok(());
        };
        let Some(id) = snapshot.id.clone() else {
            return Ok(());
        };

        let target = !snapshot.liked;
        self.gateway.set_liked(&id, target).await?;
        tracing::info!(track = %snapshot.track_name, liked = target, "toggled liked state");

        {
            let mut last = self.last_snapshot.lock().await;
            if let Some(current) = last.as_mut() {
                if current.id.as_deref() == Some(id.as_str()) {
                    current.liked = target;
                }
            }
        }
        self.events.emit(StoreEvent::Icon {
            id: LIKE_ICON_ID.to_string(),
            state: if target { "liked".to_string() } else { String::new() },
        });
        Ok(())
    }

    async fn publish_thumbnail(&self, url: Option<&str>) {
        let Some(url) = url else { return };
        match self.fetch_thumbnail(url).await {
            Ok(encoded) => self.events.emit(StoreEvent::Thumbnail(encoded)),
            Err(e) => tracing::warn!(error = %e, "failed to fetch artwork"),
        }
    }

    // artwork lives on a CDN, not behind the API token
    async fn fetch_thumbnail(&self, url: &str) -> Result<String> {
        let bytes = self.http.get(url).send().await?.bytes().await?;
        Ok(BASE64.encode(&bytes))
    }

    #[cfg(test)]
    pub(crate) async fn seed_snapshot(&self, snapshot: PlaybackSnapshot) {
        *self.last_snapshot.lock().await = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{MemoryTokenStore, RecordingOpener};
    use crate::auth::{AuthEndpoints, CredentialBroker};
    use crate::models::RepeatState;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn watcher_for(
        server: &mockito::Server,
        timing: PollTiming,
    ) -> (PlaybackWatcher, UnboundedReceiver<StoreEvent>) {
        let (events, rx) = EventSink::channel();
        let broker = CredentialBroker::with_endpoints(
            Arc::new(MemoryTokenStore::default()),
            Arc::new(RecordingOpener::default()),
            events.clone(),
            AuthEndpoints {
                authorize_url: format!("{}/authorize", server.url()),
                token_url: format!("{}/token", server.url()),
            },
        );
        broker.set_tokens_for_test(Some("tok"), None).await;
        let gateway = RequestGateway::with_base_url(broker, server.url());
        let devices = DeviceRegistry::new(gateway.clone(), events.clone());
        let watcher = PlaybackWatcher::with_timing(
            gateway,
            devices,
            events,
            Arc::new(AtomicBool::new(false)),
            timing,
        );
        (watcher, rx)
    }

    fn tight_timing() -> PollTiming {
        PollTiming {
            initial_delay_ms: 5.0,
            growth: 1.3,
            delay_cap_ms: 10.0,
            timeout: Duration::from_millis(500),
        }
    }

    fn track_body(id: &str) -> String {
        serde_json::json!({
            "device": {"id": "dev1", "name": "Kitchen", "is_active": true, "volume_percent": 40},
            "is_playing": true,
            "currently_playing_type": "track",
            "progress_ms": 100,
            "repeat_state": "off",
            "item": {
                "id": id, "name": format!("Song {id}"), "duration_ms": 1000,
                "album": {"name": "Album", "artists": [{"name": "Artist"}], "images": []}
            }
        })
        .to_string()
    }

    fn seeded(id: &str) -> PlaybackSnapshot {
        PlaybackSnapshot {
            id: Some(id.to_string()),
            track_name: format!("Song {id}"),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            playlist: "Not Found".to_string(),
            playlist_id: String::new(),
            is_playing: true,
            shuffle_state: false,
            repeat_state: RepeatState::Off,
            progress_ms: 0,
            duration_ms: 1000,
            volume: 40,
            device_name: Some("Kitchen".to_string()),
            device_id: Some("dev1".to_string()),
            liked: false,
            thumbnail_url: None,
        }
    }

    #[tokio::test]
    async fn unchanged_track_times_out_after_backoff_runs_dry() {
        let mut server = mockito::Server::new_async().await;
        // delays 6.5 and 8.45 stay under the cap, the third crosses it
        let api = server
            .mock("GET", mockito::Matcher::Regex("^/me/player".into()))
            .with_status(200)
            .with_body(track_body("t1"))
            .expect(3)
            .create_async()
            .await;

        let (watcher, _rx) = watcher_for(&server, tight_timing()).await;
        watcher.seed_snapshot(seeded("t1")).await;

        let err = watcher.get_current_song().await.unwrap_err();
        assert!(err.is_timeout());
        api.assert_async().await;
    }

    #[tokio::test]
    async fn changed_track_resolves_before_the_deadline() {
        let mut server = mockito::Server::new_async().await;
        let reads = Arc::new(AtomicUsize::new(0));
        let reads_in_mock = reads.clone();
        server
            .mock("GET", mockito::Matcher::Regex("^/me/player".into()))
            .with_status(200)
            .with_body_from_request(move |_| {
                let n = reads_in_mock.fetch_add(1, Ordering::SeqCst);
                let id = if n == 0 { "t1" } else { "t2" };
                track_body(id).into_bytes()
            })
            .expect(2)
            .create_async()
            .await;
        server
            .mock("GET", "/me/tracks/contains?ids=t2")
            .with_status(200)
            .with_body("[true]")
            .expect(1)
            .create_async()
            .await;

        let (watcher, mut rx) = watcher_for(&server, tight_timing()).await;
        watcher.seed_snapshot(seeded("t1")).await;

        let snapshot = watcher.get_current_song().await.unwrap().unwrap();
        assert_eq!(snapshot.id.as_deref(), Some("t2"));
        assert!(snapshot.liked);

        let mut saw_song = false;
        let mut saw_liked_icon = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                StoreEvent::Song(s) => saw_song = s.id.as_deref() == Some("t2"),
                StoreEvent::Icon { id, state } => {
                    saw_liked_icon = id == "like_song" && state == "liked"
                }
                _ => {}
            }
        }
        assert!(saw_song);
        assert!(saw_liked_icon);
    }

    #[tokio::test]
    async fn ads_yield_nothing_without_retrying() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", mockito::Matcher::Regex("^/me/player".into()))
            .with_status(200)
            .with_body(r#"{"currently_playing_type": "ad", "is_playing": true}"#)
            .expect(1)
            .create_async()
            .await;

        let (watcher, _rx) = watcher_for(&server, tight_timing()).await;
        assert!(watcher.get_current_song().await.unwrap().is_none());
        api.assert_async().await;
    }

    #[tokio::test]
    async fn idle_player_yields_nothing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex("^/me/player".into()))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let (watcher, _rx) = watcher_for(&server, tight_timing()).await;
        assert!(watcher.get_current_song().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn episodes_take_one_fresh_read_instead_of_backing_off() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "is_playing": true,
            "currently_playing_type": "episode",
            "item": {
                "id": "ep1", "name": "Episode", "duration_ms": 100000,
                "show": {"name": "Show", "publisher": "Host", "images": []}
            }
        })
        .to_string();
        let api = server
            .mock("GET", mockito::Matcher::Regex("^/me/player".into()))
            .with_status(200)
            .with_body(body)
            .expect(2)
            .create_async()
            .await;

        let (watcher, _rx) = watcher_for(&server, tight_timing()).await;
        watcher.seed_snapshot(seeded("ep1")).await;

        let snapshot = watcher.get_current_song().await.unwrap().unwrap();
        assert_eq!(snapshot.album, "Show");
        api.assert_async().await;
    }

    #[tokio::test]
    async fn completed_refresh_check_does_not_block_the_next_one() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", mockito::Matcher::Regex("^/me/player".into()))
            .with_status(200)
            .with_body(track_body("t1"))
            .expect(2)
            .create_async()
            .await;

        let (watcher, _rx) = watcher_for(&server, tight_timing()).await;
        watcher.seed_snapshot(seeded("t1")).await;

        watcher.check_for_refresh().await.unwrap();
        watcher.check_for_refresh().await.unwrap();
        api.assert_async().await;
    }

    #[tokio::test]
    async fn overlapping_refresh_check_is_dropped() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", mockito::Matcher::Regex("^/me/player".into()))
            .expect(0)
            .create_async()
            .await;

        let (watcher, _rx) = watcher_for(&server, tight_timing()).await;
        *watcher.refresh_started.lock().await = Some(Instant::now());

        watcher.check_for_refresh().await.unwrap();
        api.assert_async().await;
    }

    #[tokio::test]
    async fn stop_flag_aborts_the_poll() {
        let server = mockito::Server::new_async().await;
        let (watcher, _rx) = watcher_for(&server, tight_timing()).await;
        watcher.stop.store(true, Ordering::SeqCst);

        let err = watcher.get_current_song().await.unwrap_err();
        assert!(matches!(err, SpotifyError::Stopped));
    }
}
