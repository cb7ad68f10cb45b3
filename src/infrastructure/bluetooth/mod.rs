//! Bluetooth Module
//!
//! Provides BLE communication with fleets of wearable motion sensors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     BridgeService                        │
//! │    (Main coordinator - public API for host software)     │
//! └─────────┬───────────────┬───────────────┬───────────────┘
//!           │               │               │
//!           ▼               ▼               ▼
//! ┌──────────────┐  ┌───────────────┐  ┌───────────────┐
//! │ Orchestrator │  │ DeviceSession │  │   Time Sync   │
//! │              │  │               │  │               │
//! │ - FIFO queue │  │ - lifecycle   │  │ - RTT rounds  │
//! │ - one radio  │  │ - streaming   │  │ - median      │
//! │   op at a    │  │ - battery     │  │   offset      │
//! │   time       │  │ - disposal    │  │ - register    │
//! └──────┬───────┘  └───────┬───────┘  └───────┬───────┘
//!        │                  │                  │
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!          ┌───────────────────────────────────┐
//!          │        transport traits           │
//!          │  (Adapter / Peripheral / Service  │
//!          │        / Characteristic)          │
//!          └─────┬──────────┬──────────┬───────┘
//!                │          │          │
//!                ▼          ▼          ▼
//!            ┌───────┐  ┌───────┐  ┌───────┐
//!            │ bluez │  │ winrt │  │ mock  │
//!            └───────┘  └───────┘  └───────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Sensor wire protocol: UUIDs, commands, packet parsing
//! - [`transport`] - Backend-neutral capability traits
//! - [`session`] - Per-device lifecycle state machine
//! - [`orchestrator`] - Serialized FIFO connection queue
//! - [`timesync`] - RTT-based clock alignment
//! - [`service`] - Main service coordinator
//! - [`mock`] - Scripted in-process backend for tests

pub mod mock;
pub mod orchestrator;
pub mod protocol;
pub mod service;
pub mod session;
pub mod timesync;
pub mod transport;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez;
#[cfg(all(feature = "winrt", target_os = "windows"))]
pub mod winrt;

// Re-export main service for convenience
pub use service::BridgeService;
