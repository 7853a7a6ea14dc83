//! Startup configuration

use std::path::PathBuf;

use serde::Deserialize;

const CLIENT_ID_VAR: &str = "SPOTIFY_CLIENT_ID";
const CLIENT_SECRET_VAR: &str = "SPOTIFY_CLIENT_SECRET";
const REDIRECT_URI_VAR: &str = "SPOTIFY_REDIRECT_URI";
const TOKEN_FILE_VAR: &str = "SPOTIFY_TOKEN_FILE";

/// Credentials and paths the session is started with. All credential
/// fields are optional; they can also arrive later through the setters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub token_file: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            token_file: PathBuf::from(".cache/spotify-tokens.json"),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            client_id: std::env::var(CLIENT_ID_VAR).ok(),
            client_secret: std::env::var(CLIENT_SECRET_VAR).ok(),
            redirect_uri: std::env::var(REDIRECT_URI_VAR).ok(),
            token_file: std::env::var(TOKEN_FILE_VAR)
                .map(PathBuf::from)
                .unwrap_or(defaults.token_file),
        }
    }
}
