//! Headless demo host: wires a session from the environment, drains its
//! events to the log and checks for playback changes periodically.

use std::sync::Arc;
use std::time::Duration;

use spotify_sync::auth::{FileTokenStore, UrlOpener};
use spotify_sync::{logging, SessionConfig, SpotifySession};

const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Headless stand-in for a browser: prints the authorization URL so the
/// user can open it themselves.
struct StdoutOpener;

impl UrlOpener for StdoutOpener {
    fn open_url(&self, url: &str) -> anyhow::Result<()> {
        println!("Open this URL to authorize: {url}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init();

    let config = SessionConfig::from_env();
    let store = Arc::new(FileTokenStore::new(config.token_file.clone()));
    let (session, mut events) = SpotifySession::new(store, Arc::new(StdoutOpener));
    session.configure(&config).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(?event, "store event");
        }
    });

    tracing::info!("session started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                if let Err(e) = session.refresh().await {
                    tracing::warn!(error = %e, "refresh check failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                session.stop();
                break;
            }
        }
    }

    Ok(())
}
