//! The capability set the `DeviceSession` depends on (§6). Implemented by
//! the host application against whatever GATT stack it has; this crate
//! never talks to a real radio.

use tokio::sync::mpsc;

use crate::error::KjError;

/// A paired/known device identity, persisted by the host across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
}

/// An advertisement observed while watching for a previously paired device.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub rssi: i16,
}

/// Events the transport pushes to the session asynchronously, once
/// connected: notification bytes and unsolicited disconnects.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    CharacteristicValueChanged(Vec<u8>),
    GattServerDisconnected,
}

/// A live, connected handle: GATT server + the protocol's service and
/// characteristic, plus the channel the transport uses to deliver events.
pub struct ConnectedHandle {
    pub characteristic: Box<dyn Characteristic>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// A GATT characteristic, already resolved to the protocol's service and
/// characteristic UUIDs.
#[async_trait::async_trait]
pub trait Characteristic: Send {
    async fn start_notifications(&mut self) -> Result<(), KjError>;
    async fn stop_notifications(&mut self) -> Result<(), KjError>;
    async fn write_with_response(&mut self, bytes: &[u8]) -> Result<(), KjError>;
    async fn write_without_response(&mut self, bytes: &[u8]) -> Result<(), KjError>;
}

/// The host-provided capability set a `DeviceSession` operates over.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Devices the host already knows about (previously paired).
    async fn list_known_devices(&self) -> Result<Vec<DeviceIdentity>, KjError>;

    /// Prompt the user to pick a device advertising the given service UUID.
    async fn request_device(&self, service_uuid: &str) -> Result<DeviceIdentity, KjError>;

    /// Start watching for an advertisement from `id`. The returned
    /// `AdvertisementWatch::wait` resolves to `Some` on the first
    /// advertisement seen, or `None` if the transport gives up first;
    /// dropping the watch without awaiting it stops the scan.
    async fn watch_advertisement(&self, id: &str) -> Result<AdvertisementWatch, KjError>;

    /// Connect GATT, resolve the protocol's service and characteristic, and
    /// subscribe to notifications, returning the live handle.
    async fn connect(
        &self,
        device: &DeviceIdentity,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<ConnectedHandle, KjError>;

    /// Tear down the GATT connection to `device`. Idempotent.
    async fn disconnect(&self, device: &DeviceIdentity) -> Result<(), KjError>;

    /// Whether this transport supports reconnect-to-previous at all. The
    /// §6 platform quirk is expressed as a capability probe, not a
    /// platform-name string match.
    fn supports_previous_device_reconnect(&self) -> bool {
        true
    }

    /// Request the host reload/restart itself. Last-resort escalation for
    /// `DisconnectWhileDisconnecting` (§7).
    async fn request_host_reload(&self);
}

/// A cancellable advertisement watch. Resolving `wait()` or dropping the
/// watch both release the underlying watcher.
pub struct AdvertisementWatch {
    receiver: mpsc::Receiver<Advertisement>,
}

impl AdvertisementWatch {
    pub fn new(receiver: mpsc::Receiver<Advertisement>) -> Self {
        Self { receiver }
    }

    /// Resolve on the first advertisement, or `None` if the channel closes
    /// (the transport gave up) before one arrives.
    pub async fn wait(mut self) -> Option<Advertisement> {
        self.receiver.recv().await
    }
}
