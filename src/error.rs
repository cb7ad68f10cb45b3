//! Error taxonomy for the bridge.
//!
//! Each layer has its own enum; [`BridgeError`] unifies them at the public
//! API surface. Library code propagates with `?`; panics are reserved for
//! tests.

use thiserror::Error;

/// Native BLE stack failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("connection to {address} timed out after {timeout_ms} ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    #[error("connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("service discovery failed for {address}: {reason}")]
    DiscoveryFailed { address: String, reason: String },

    #[error("characteristic read failed: {0}")]
    ReadFailed(String),

    #[error("characteristic write failed: {0}")]
    WriteFailed(String),

    #[error("notification subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("no reply within {0} ms")]
    ReplyTimeout(u64),

    #[error("invalid UUID {0:?}")]
    InvalidUuid(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Malformed or mismatched device replies and packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("reply echoed command {got:#04x}, expected {expected:#04x}")]
    CommandMismatch { expected: u8, got: u8 },

    #[error("malformed reply: {len} bytes, expected {expected}")]
    MalformedReply { len: usize, expected: usize },

    #[error("device reported error code {0:#04x}")]
    DeviceNack(u8),

    #[error("packet size {len} does not match active mode (expected {expected})")]
    PacketSizeMismatch { len: usize, expected: usize },

    #[error("unknown packet kind {0:#04x}")]
    UnknownPacketKind(u8),
}

/// Time-synchronization failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("clock offset {0} ms does not fit the device offset register")]
    OffsetOutOfRange(i64),

    #[error("no usable round-trip samples collected")]
    NoSamples,

    #[error("device rejected the offset register write with code {code:#04x}")]
    OffsetRegisterRejected { code: u8 },
}

/// Coordination violations.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("connect already in progress for {device_id}")]
    ConnectInProgress { device_id: String },

    #[error("session for {device_id} was disposed")]
    SessionDisposed { device_id: String },

    #[error("radio busy: a connection attempt is in flight")]
    RadioBusy,
}

/// Missing devices or GATT objects.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("characteristics unavailable on {device_id}")]
    CharacteristicsUnavailable { device_id: String },
}

/// Top-level error for the public API.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl BridgeError {
    /// True when the operation failed because its session was retired.
    pub fn is_disposed(&self) -> bool {
        matches!(
            self,
            BridgeError::Concurrency(ConcurrencyError::SessionDisposed { .. })
        )
    }
}
