//! Resilient client core for the Spotify Web API
//!
//! Four cooperating pieces: [`auth::CredentialBroker`] owns the OAuth2
//! token lifecycle, [`gateway::RequestGateway`] de-duplicates and caches
//! API traffic, [`watcher::PlaybackWatcher`] detects track changes with
//! an adaptive backoff, and [`devices::DeviceRegistry`] reconciles the
//! known playback devices. [`session::SpotifySession`] wires them up.

pub mod auth;
pub mod cache;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod session;
pub mod watcher;

pub use config::SessionConfig;
pub use error::{Result, SpotifyError};
pub use events::{EventSink, StoreEvent};
pub use models::{Device, PlaybackSnapshot};
pub use session::SpotifySession;
