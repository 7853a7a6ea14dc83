//! Outbound domain events consumed by the presentation layer

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::{Device, PlaybackSnapshot};

/// Everything the core reports to the (out-of-scope) presentation layer.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Fresh normalized snapshot of what is playing
    Song(PlaybackSnapshot),
    /// Base64-encoded artwork for the current item
    Thumbnail(String),
    /// The active device changed identity
    Device(Device),
    /// The known device list changed structurally
    DeviceList(Vec<Device>),
    /// UI icon state, e.g. the like button
    Icon { id: String, state: String },
    /// Authentication status flipped
    Auth { auth_status: bool },
}

/// Cloneable sender handed to each store. A closed receiver is logged,
/// never an error: the core outlives any single consumer.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: StoreEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event receiver dropped, discarding event");
        }
    }
}
