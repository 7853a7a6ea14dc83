//! Error taxonomy for the sync core

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpotifyError>;

/// Errors surfaced by the credential broker, request gateway and watcher.
#[derive(Error, Debug)]
pub enum SpotifyError {
    /// Missing or invalid credentials, failed code exchange or refresh
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Non-2xx from the Spotify API. `retried` is true when the 401
    /// forced-refresh retry was already spent.
    #[error("request failed with status {status} (retried: {retried})")]
    Request { status: u16, retried: bool },

    /// Poll loop exhausted without detecting a track change
    #[error("timeout reached without a track change")]
    Timeout,

    /// Currently-playing item is neither a track nor an episode
    #[error("playing content type {0:?} is not supported")]
    UnsupportedContent(String),

    /// Process-wide stop signal observed inside the poll loop
    #[error("stop requested")]
    Stopped,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure observed through a shared in-flight call. Followers of a
    /// de-duplicated request all see the same underlying error.
    #[error(transparent)]
    Shared(Arc<SpotifyError>),
}

impl SpotifyError {
    pub fn from_status(status: u16, retried: bool) -> Self {
        Self::Request { status, retried }
    }

    /// True for errors that a fresh token could plausibly fix
    pub fn is_auth_error(&self) -> bool {
        match self {
            SpotifyError::Auth(_) => true,
            SpotifyError::Request { status: 401, .. } => true,
            SpotifyError::Shared(inner) => inner.is_auth_error(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SpotifyError::Timeout)
            || matches!(self, SpotifyError::Shared(inner) if inner.is_timeout())
    }
}

/// Flatten a shared error back to its inner shape wherever possible, so
/// callers can match on `Request`, `Timeout` and friends regardless of
/// whether the call was de-duplicated. Only variants carrying
/// non-cloneable sources stay wrapped.
impl From<Arc<SpotifyError>> for SpotifyError {
    fn from(inner: Arc<SpotifyError>) -> Self {
        let shared = match Arc::try_unwrap(inner) {
            Ok(error) => return error,
            Err(shared) => shared,
        };
        let flattened = match &*shared {
            SpotifyError::Auth(msg) => Some(SpotifyError::Auth(msg.clone())),
            SpotifyError::Request { status, retried } => Some(SpotifyError::Request {
                status: *status,
                retried: *retried,
            }),
            SpotifyError::Timeout => Some(SpotifyError::Timeout),
            SpotifyError::UnsupportedContent(kind) => {
                Some(SpotifyError::UnsupportedContent(kind.clone()))
            }
            SpotifyError::Stopped => Some(SpotifyError::Stopped),
            _ => None,
        };
        flattened.unwrap_or(SpotifyError::Shared(shared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn shared_errors_flatten_to_their_inner_shape() {
        // extra strong count forces the non-unique path
        let arc = Arc::new(SpotifyError::Request {
            status: 401,
            retried: true,
        });
        let _keep = arc.clone();

        let err = SpotifyError::from(arc);
        assert!(matches!(
            err,
            SpotifyError::Request {
                status: 401,
                retried: true
            }
        ));
    }

    #[test]
    fn source_carrying_errors_stay_wrapped() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let arc = Arc::new(SpotifyError::Json(json_err));
        let _keep = arc.clone();

        let err = SpotifyError::from(arc);
        assert!(matches!(err, SpotifyError::Shared(_)));
        assert!(err.source().is_some());
    }
}
