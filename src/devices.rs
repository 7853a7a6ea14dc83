//! Device reconciliation
//!
//! The device list only emits when it changes structurally, and the
//! active device only emits when its identity changes, so consumers can
//! treat every event as meaningful.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::events::{EventSink, StoreEvent};
use crate::gateway::RequestGateway;
use crate::models::Device;

#[derive(Clone)]
pub struct DeviceRegistry {
    gateway: RequestGateway,
    devices: Arc<Mutex<Vec<Device>>>,
    current: Arc<Mutex<Option<Device>>>,
    events: EventSink,
}

impl DeviceRegistry {
    pub fn new(gateway: RequestGateway, events: EventSink) -> Self {
        Self {
            gateway,
            devices: Arc::new(Mutex::new(Vec::new())),
            current: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Fold the device reported inside a playback read into the registry.
    pub async fn ingest_from_playback(&self, device: &Device) {
        self.update_current(device).await;
        self.add_or_update(device).await;
    }

    /// Merge a full listing into the known devices. Each incoming entry
    /// is inserted or compared in place; devices the listing omits stay
    /// known. At most one `DeviceList` event, regardless of how many
    /// entries changed.
    pub async fn ingest_device_list(&self, incoming: Vec<Device>) {
        {
            let mut devices = self.devices.lock().await;
            let mut changed = false;
            for device in &incoming {
                changed |= Self::merge_device(&mut devices, device);
            }
            if changed {
                tracing::debug!(count = devices.len(), "device list changed");
                self.events.emit(StoreEvent::DeviceList(devices.clone()));
            }
        }
        if let Some(active) = incoming.iter().find(|d| d.is_active) {
            self.update_current(active).await;
        }
    }

    pub async fn refresh_devices(&self) -> Result<()> {
        let devices = self.gateway.get_devices().await?;
        self.ingest_device_list(devices).await;
        Ok(())
    }

    /// Move playback to another device, then re-list to pick up the new
    /// active flags.
    pub async fn transfer_playback(&self, device_id: &str) -> Result<()> {
        tracing::info!(device_id, "transferring playback");
        self.gateway.transfer_playback(device_id).await?;
        self.refresh_devices().await
    }

    pub async fn active_device(&self) -> Option<Device> {
        self.current.lock().await.clone()
    }

    pub async fn known_devices(&self) -> Vec<Device> {
        self.devices.lock().await.clone()
    }

    /// Track the active device. Only an identity change stores and
    /// emits; field churn on the same device is ignored here (the list
    /// side picks it up).
    async fn update_current(&self, device: &Device) {
        let mut current = self.current.lock().await;
        let changed = current.as_ref().map(|d| d.id != device.id).unwrap_or(true);
        if changed {
            *current = Some(device.clone());
            tracing::info!(name = %device.name, "active device changed");
            self.events.emit(StoreEvent::Device(device.clone()));
        }
    }

    async fn add_or_update(&self, device: &Device) {
        let mut devices = self.devices.lock().await;
        if Self::merge_device(&mut devices, device) {
            self.events.emit(StoreEvent::DeviceList(devices.clone()));
        }
    }

    /// Insert-or-compare by id. Returns whether the collection changed.
    fn merge_device(devices: &mut Vec<Device>, device: &Device) -> bool {
        match devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) if *existing == *device => false,
            Some(existing) => {
                *existing = device.clone();
                true
            }
            None => {
                devices.push(device.clone());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{MemoryTokenStore, RecordingOpener};
    use crate::auth::CredentialBroker;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> (DeviceRegistry, UnboundedReceiver<StoreEvent>) {
        let (events, rx) = EventSink::channel();
        let broker = CredentialBroker::new(
            Arc::new(MemoryTokenStore::default()),
            Arc::new(RecordingOpener::default()),
            events.clone(),
        );
        let gateway = RequestGateway::with_base_url(broker, "http://unused.invalid");
        (DeviceRegistry::new(gateway, events), rx)
    }

    fn device(id: &str, active: bool, volume: u8) -> Device {
        Device {
            id: Some(id.to_string()),
            name: format!("device-{id}"),
            is_active: active,
            volume_percent: Some(volume),
            supports_volume: true,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<StoreEvent>) -> (usize, usize) {
        let mut device_events = 0;
        let mut list_events = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                StoreEvent::Device(_) => device_events += 1,
                StoreEvent::DeviceList(_) => list_events += 1,
                _ => {}
            }
        }
        (device_events, list_events)
    }

    #[tokio::test]
    async fn identical_ingests_emit_once() {
        let (registry, mut rx) = registry();
        let kitchen = device("a", true, 40);

        registry.ingest_from_playback(&kitchen).await;
        registry.ingest_from_playback(&kitchen).await;

        let (device_events, list_events) = drain(&mut rx);
        assert_eq!(device_events, 1);
        assert_eq!(list_events, 1);
    }

    #[tokio::test]
    async fn switching_active_device_emits_each_switch() {
        let (registry, mut rx) = registry();

        registry.ingest_from_playback(&device("a", true, 40)).await;
        registry.ingest_from_playback(&device("b", true, 40)).await;
        registry.ingest_from_playback(&device("a", true, 40)).await;

        let (device_events, _) = drain(&mut rx);
        assert_eq!(device_events, 3);
    }

    #[tokio::test]
    async fn volume_change_updates_the_list_but_not_the_active_device() {
        let (registry, mut rx) = registry();

        registry.ingest_from_playback(&device("a", true, 40)).await;
        drain(&mut rx);

        registry.ingest_from_playback(&device("a", true, 55)).await;
        let (device_events, list_events) = drain(&mut rx);
        assert_eq!(device_events, 0);
        assert_eq!(list_events, 1);

        // same identity, so the stored active device is left alone
        let current = registry.active_device().await.unwrap();
        assert_eq!(current.volume_percent, Some(40));
        let listed = registry.known_devices().await;
        assert_eq!(listed[0].volume_percent, Some(55));
    }

    #[tokio::test]
    async fn listing_that_omits_a_known_device_keeps_it_and_stays_silent() {
        let (registry, mut rx) = registry();
        registry
            .ingest_device_list(vec![device("a", true, 40), device("b", false, 10)])
            .await;
        drain(&mut rx);

        registry.ingest_device_list(vec![device("a", true, 40)]).await;

        let (device_events, list_events) = drain(&mut rx);
        assert_eq!(device_events, 0);
        assert_eq!(list_events, 0);
        assert_eq!(registry.known_devices().await.len(), 2);
    }

    #[tokio::test]
    async fn unchanged_full_listing_is_silent() {
        let (registry, mut rx) = registry();
        let listing = vec![device("a", true, 40), device("b", false, 10)];

        registry.ingest_device_list(listing.clone()).await;
        drain(&mut rx);

        registry.ingest_device_list(listing).await;
        let (device_events, list_events) = drain(&mut rx);
        assert_eq!(device_events, 0);
        assert_eq!(list_events, 0);
    }
}
