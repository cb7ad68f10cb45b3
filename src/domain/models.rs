use serde::{Deserialize, Serialize};

/// Unit quaternion decoded from a streaming packet.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub fn norm(&self) -> f32 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// One motion sample delivered to the host, timestamps already aligned to
/// the shared reference clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub quaternion: Quaternion,
}

/// Link-level state reported by the transport for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Session lifecycle. `Disposed` is terminal: a superseded session must
/// never touch characteristics again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Connected,
    Streaming,
    Disconnecting,
    Error,
    Disposed,
}

/// Clock-alignment progress for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    /// Device RTC written to the shared fleet reference instant.
    RtcInitialized,
    /// Offset estimated; applied in software to streamed timestamps.
    OffsetComputed,
    /// Offset written to the hardware register; timestamps arrive corrected.
    FullySynced,
}

/// A peripheral seen during discovery.
#[derive(Debug, Clone)]
pub struct PeripheralInfo {
    /// Platform-assigned identifier.
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    pub state: ConnectionState,
}

/// Semantic role assigned to a physical device by the external registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub semantic_id: String,
    pub joint: String,
    pub position: String,
}

/// External device-identity collaborator. Consulted after connect to map an
/// advertised name onto a logical role; persistence belongs to the
/// implementor, not to this crate.
pub trait IdentityRegistry: Send + Sync {
    fn assign_identity(&self, device_name: &str) -> Option<DeviceIdentity>;
}

/// Event kinds on the host channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Discovered,
    Connected,
    Disconnected,
    Error,
    BatteryUpdate,
    StreamingStarted,
    StreamingStopped,
    /// Unexpected link loss; an external reconnection policy decides what
    /// happens next.
    AutoReconnect,
}

/// Typed event channel from sessions to the host.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Motion {
        device_id: String,
        sample: MotionSample,
    },
    Device {
        device_id: String,
        kind: DeviceEventKind,
        detail: Option<String>,
    },
}

/// Result of one connect request processed by the orchestrator.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub device_id: String,
    pub name: Option<String>,
    /// Battery percent from the initial read; `None` when the soft read
    /// failed.
    pub battery: Option<u8>,
    pub identity: Option<DeviceIdentity>,
}
