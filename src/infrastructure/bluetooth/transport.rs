//! Transport Abstraction
//!
//! Capability traits that both native BLE stacks implement: the
//! callback-oriented WinRT stack and the BlueZ daemon reached over D-Bus.
//! All UUID normalization and property-flag translation stays inside the
//! backend implementations; session logic only sees these traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::domain::models::{ConnectionState, PeripheralInfo};
use crate::error::{ResourceError, TransportError};

/// Raw notification payloads from one characteristic subscription.
pub type NotificationStream = mpsc::Receiver<Vec<u8>>;

/// Capability set of a characteristic, translated from backend flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// Name/signal filter applied uniformly during discovery by every backend.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Case-insensitive substrings; an empty list accepts any name.
    pub name_contains: Vec<String>,
    /// Minimum signal strength in dBm.
    pub min_rssi: Option<i16>,
}

impl DiscoveryFilter {
    pub fn matches(&self, name: Option<&str>, rssi: Option<i16>) -> bool {
        let name_ok = if self.name_contains.is_empty() {
            true
        } else {
            match name {
                Some(name) => {
                    let lower = name.to_lowercase();
                    self.name_contains
                        .iter()
                        .any(|fragment| lower.contains(&fragment.to_lowercase()))
                }
                None => false,
            }
        };
        let rssi_ok = match self.min_rssi {
            Some(threshold) => matches!(rssi, Some(rssi) if rssi >= threshold),
            None => true,
        };
        name_ok && rssi_ok
    }
}

/// Canonicalize a UUID string so both backends compare equal: strip
/// separator punctuation and parse the remaining 32 hex digits.
pub fn normalize_uuid(raw: &str) -> Result<Uuid, TransportError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase();
    if cleaned.len() != 32 {
        return Err(TransportError::InvalidUuid(raw.to_string()));
    }
    Uuid::parse_str(&cleaned).map_err(|_| TransportError::InvalidUuid(raw.to_string()))
}

/// The local radio.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Begin discovery with the given filter. Time-boxing is applied by the
    /// bridge service, not here.
    async fn start_scan(&self, filter: DiscoveryFilter) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Devices that passed the filter so far.
    async fn discovered_devices(&self) -> Result<Vec<PeripheralInfo>, TransportError>;

    async fn peripheral(&self, id: &str) -> Result<Arc<dyn Peripheral>, ResourceError>;

    /// Drop the in-memory handle for a device.
    async fn forget_peripheral(&self, id: &str) -> Result<(), TransportError>;

    /// Disconnect if connected, then remove the device from the OS-level
    /// Bluetooth registry. Both native stacks cache stale GATT data that
    /// otherwise causes repeated reconnection failures.
    async fn clear_device_cache(&self, address: &str) -> Result<(), TransportError>;
}

/// A remote device handle.
#[async_trait]
pub trait Peripheral: Send + Sync {
    fn id(&self) -> String;
    fn address(&self) -> String;
    async fn name(&self) -> Option<String>;
    async fn rssi(&self) -> Option<i16>;
    async fn connection_state(&self) -> ConnectionState;

    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn discover_services(&self) -> Result<Vec<Arc<dyn Service>>, TransportError>;

    /// Link-down notifications. Subscribe before doing further I/O so an
    /// async disconnect during discovery is observed.
    fn subscribe_disconnects(&self) -> broadcast::Receiver<()>;
}

#[async_trait]
pub trait Service: Send + Sync {
    fn uuid(&self) -> Uuid;
    async fn discover_characteristics(&self)
        -> Result<Vec<Arc<dyn Characteristic>>, TransportError>;
}

#[async_trait]
pub trait Characteristic: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn properties(&self) -> CharacteristicProps;

    async fn read(&self) -> Result<Vec<u8>, TransportError>;
    async fn write(&self, data: &[u8], needs_ack: bool) -> Result<(), TransportError>;

    async fn subscribe(&self) -> Result<NotificationStream, TransportError>;
    async fn unsubscribe(&self) -> Result<(), TransportError>;
}
