//! Wire types for the Spotify player endpoints and the normalized
//! playback snapshot handed to consumers

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpotifyError};

/// A playback device as reported by the API. Structural equality on this
/// type is what gates device-list update events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    pub volume_percent: Option<u8>,
    #[serde(default)]
    pub supports_volume: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// What kind of content the player reports as currently playing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayingType {
    Track,
    Episode,
    Ad,
    #[serde(other)]
    #[default]
    Unknown,
}

/// Repeat state on the wire ("context" means repeat-all)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiRepeatState {
    #[default]
    Off,
    Track,
    Context,
}

/// Normalized repeat state exposed in snapshots
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatState {
    Off,
    Track,
    All,
}

impl From<ApiRepeatState> for RepeatState {
    fn from(state: ApiRepeatState) -> Self {
        match state {
            ApiRepeatState::Off => RepeatState::Off,
            ApiRepeatState::Track => RepeatState::Track,
            ApiRepeatState::Context => RepeatState::All,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Image {
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ArtistRef {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AlbumRef {
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShowRef {
    pub name: String,
    pub publisher: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// The playing item; `album` is present for tracks, `show` for episodes
#[derive(Clone, Debug, Deserialize)]
pub struct PlayableItem {
    pub id: Option<String>,
    pub name: String,
    pub duration_ms: Option<u64>,
    pub album: Option<AlbumRef>,
    pub show: Option<ShowRef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Context {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
}

/// Raw response from `GET /me/player`
#[derive(Clone, Debug, Deserialize)]
pub struct PlayerResponse {
    pub device: Option<Device>,
    #[serde(default)]
    pub shuffle_state: bool,
    #[serde(default)]
    pub repeat_state: ApiRepeatState,
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub currently_playing_type: PlayingType,
    pub item: Option<PlayableItem>,
    pub context: Option<Context>,
}

impl PlayerResponse {
    /// Id of the playing item, if the API reported one
    pub fn item_id(&self) -> Option<&str> {
        self.item.as_ref().and_then(|item| item.id.as_deref())
    }
}

/// Body of a successful token-endpoint exchange or refresh. Spotify may
/// rotate the refresh token; absence means keep the old one.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Point-in-time projection of the current playback state. Rebuilt on
/// every successful watcher cycle; carries no persisted identity.
#[derive(Clone, Debug, Serialize)]
pub struct PlaybackSnapshot {
    pub id: Option<String>,
    pub track_name: String,
    pub artist: String,
    pub album: String,
    pub playlist: String,
    pub playlist_id: String,
    pub is_playing: bool,
    pub shuffle_state: bool,
    pub repeat_state: RepeatState,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub volume: u8,
    pub device_name: Option<String>,
    pub device_id: Option<String>,
    pub liked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl PlaybackSnapshot {
    /// Normalize a raw player read into a snapshot. Only tracks and
    /// episodes are representable; anything else is unsupported content.
    pub fn from_playback(playback: &PlayerResponse, liked: bool) -> Result<Self> {
        let item = playback.item.as_ref().ok_or_else(|| {
            SpotifyError::UnsupportedContent("no item in playback response".to_string())
        })?;

        let (artist, album, thumbnail_url) = match playback.currently_playing_type {
            PlayingType::Track => {
                let album_ref = item.album.as_ref();
                (
                    album_ref
                        .and_then(|a| a.artists.first())
                        .map(|a| a.name.clone())
                        .unwrap_or_else(|| "Not Found".to_string()),
                    album_ref
                        .map(|a| a.name.clone())
                        .unwrap_or_else(|| "Not Found".to_string()),
                    album_ref.and_then(|a| a.images.first()).map(|i| i.url.clone()),
                )
            }
            PlayingType::Episode => {
                let show = item.show.as_ref();
                (
                    show.and_then(|s| s.publisher.clone())
                        .unwrap_or_else(|| "Author".to_string()),
                    show.map(|s| s.name.clone())
                        .unwrap_or_else(|| "Podcast".to_string()),
                    show.and_then(|s| s.images.first()).map(|i| i.url.clone()),
                )
            }
            other => {
                return Err(SpotifyError::UnsupportedContent(format!("{other:?}")));
            }
        };

        let device = playback.device.as_ref();

        Ok(Self {
            id: item.id.clone(),
            track_name: item.name.clone(),
            artist,
            album,
            playlist: playback
                .context
                .as_ref()
                .map(|c| c.kind.clone())
                .unwrap_or_else(|| "Not Found".to_string()),
            playlist_id: playback
                .context
                .as_ref()
                .map(|c| c.uri.clone())
                .unwrap_or_default(),
            is_playing: playback.is_playing,
            shuffle_state: playback.shuffle_state,
            repeat_state: playback.repeat_state.into(),
            progress_ms: playback.progress_ms.unwrap_or(0),
            duration_ms: item.duration_ms.unwrap_or(0),
            volume: device.and_then(|d| d.volume_percent).unwrap_or(50),
            device_name: device.map(|d| d.name.clone()),
            device_id: device.and_then(|d| d.id.clone()),
            liked,
            thumbnail_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_playback() -> PlayerResponse {
        serde_json::from_value(serde_json::json!({
            "device": {
                "id": "dev1", "name": "Kitchen", "is_active": true,
                "volume_percent": 35, "supports_volume": true
            },
            "shuffle_state": true,
            "repeat_state": "context",
            "progress_ms": 1500,
            "is_playing": true,
            "currently_playing_type": "track",
            "item": {
                "id": "track1", "name": "Song", "duration_ms": 200000,
                "album": {
                    "name": "Album",
                    "artists": [{"name": "Artist"}],
                    "images": [{"url": "https://img/cover.jpg"}]
                }
            },
            "context": {"type": "playlist", "uri": "spotify:playlist:abc"}
        }))
        .unwrap()
    }

    #[test]
    fn normalizes_track_playback() {
        let snapshot = PlaybackSnapshot::from_playback(&track_playback(), true).unwrap();
        assert_eq!(snapshot.id.as_deref(), Some("track1"));
        assert_eq!(snapshot.artist, "Artist");
        assert_eq!(snapshot.album, "Album");
        assert_eq!(snapshot.repeat_state, RepeatState::All);
        assert_eq!(snapshot.playlist, "playlist");
        assert_eq!(snapshot.volume, 35);
        assert!(snapshot.liked);
        assert_eq!(snapshot.thumbnail_url.as_deref(), Some("https://img/cover.jpg"));
    }

    #[test]
    fn normalizes_episode_playback() {
        let playback: PlayerResponse = serde_json::from_value(serde_json::json!({
            "device": {"id": "dev1", "name": "Kitchen"},
            "currently_playing_type": "episode",
            "is_playing": true,
            "item": {
                "id": "ep1", "name": "Episode 12", "duration_ms": 3600000,
                "show": {"name": "A Show", "publisher": "Someone", "images": []}
            }
        }))
        .unwrap();

        let snapshot = PlaybackSnapshot::from_playback(&playback, false).unwrap();
        assert_eq!(snapshot.album, "A Show");
        assert_eq!(snapshot.artist, "Someone");
        assert_eq!(snapshot.volume, 50);
        assert!(snapshot.thumbnail_url.is_none());
    }

    #[test]
    fn rejects_ad_playback() {
        let playback: PlayerResponse = serde_json::from_value(serde_json::json!({
            "currently_playing_type": "ad",
            "item": {"id": "x", "name": "ad"}
        }))
        .unwrap();

        let err = PlaybackSnapshot::from_playback(&playback, false).unwrap_err();
        assert!(matches!(err, SpotifyError::UnsupportedContent(_)));
    }
}
