//! motionlink - BLE bridge for fleets of wearable motion sensors.
//!
//! Discovers sensors, maintains one supervised session per device, streams
//! quaternion motion data at up to 100 Hz, and aligns every device clock to
//! the host so samples from different sensors are mutually comparable.
//!
//! Typical use:
//!
//! ```no_run
//! # async fn demo() -> Result<(), motionlink::error::BridgeError> {
//! use std::sync::Arc;
//! use motionlink::domain::settings::BridgeSettings;
//! use motionlink::infrastructure::bluetooth::BridgeService;
//! # let adapter: Arc<dyn motionlink::infrastructure::bluetooth::transport::Adapter> = todo!();
//!
//! let (service, mut events) = BridgeService::new(adapter, BridgeSettings::default());
//! service.start_scan().await?;
//! // ... pick a device_id from Discovered events ...
//! let outcome = service.connect("AA:BB:CC:DD:EE:FF").await?;
//! service.sync_device(&outcome.device_id).await?;
//! service.start_streaming(&outcome.device_id).await?;
//! while let Some(event) = events.recv().await {
//!     // Motion samples and device lifecycle events arrive here.
//! }
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{BridgeEvent, ConnectOutcome, DeviceEventKind, MotionSample, Quaternion};
pub use error::BridgeError;
pub use infrastructure::bluetooth::BridgeService;
