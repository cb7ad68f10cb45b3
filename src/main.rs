//! Demo bridge: scan for sensors, connect whatever is found, synchronize
//! clocks, and stream motion data to the log until interrupted.

use std::sync::Arc;

use tracing::{info, warn};

use motionlink::domain::models::{BridgeEvent, DeviceEventKind};
use motionlink::domain::settings::{BridgeSettings, SettingsService};
use motionlink::infrastructure::bluetooth::transport::Adapter;
use motionlink::infrastructure::bluetooth::BridgeService;
use motionlink::infrastructure::logging::init_logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?.get().clone();
    let _logging = init_logger(&settings.log_settings)?;
    info!("starting motionlink bridge");

    let adapter = native_adapter().await?;
    run(adapter, settings).await
}

#[cfg(all(feature = "bluez", target_os = "linux"))]
async fn native_adapter() -> anyhow::Result<Arc<dyn Adapter>> {
    use motionlink::infrastructure::bluetooth::bluez::BluezAdapter;
    Ok(Arc::new(BluezAdapter::new().await?))
}

#[cfg(all(feature = "winrt", target_os = "windows"))]
async fn native_adapter() -> anyhow::Result<Arc<dyn Adapter>> {
    use motionlink::infrastructure::bluetooth::winrt::WinRtAdapter;
    Ok(Arc::new(WinRtAdapter::new()))
}

#[cfg(not(any(
    all(feature = "bluez", target_os = "linux"),
    all(feature = "winrt", target_os = "windows")
)))]
async fn native_adapter() -> anyhow::Result<Arc<dyn Adapter>> {
    anyhow::bail!("no native backend in this build; enable the `bluez` or `winrt` feature")
}

async fn run(adapter: Arc<dyn Adapter>, settings: BridgeSettings) -> anyhow::Result<()> {
    let (service, mut events) = BridgeService::new(adapter, settings);
    let service = Arc::new(service);
    service.start_scan().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                for session in service.active_sessions() {
                    let device_id = session.device_id().to_string();
                    if let Err(err) = service.disconnect(&device_id).await {
                        warn!(device = %device_id, %err, "disconnect on shutdown failed");
                    }
                }
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                handle_event(&service, event).await;
            }
        }
    }
}

async fn handle_event(service: &Arc<BridgeService>, event: BridgeEvent) {
    match event {
        BridgeEvent::Device {
            device_id,
            kind: DeviceEventKind::Discovered,
            detail,
        } => {
            info!(device = %device_id, ?detail, "discovered");
            // Connections queue FIFO; fire and forget from the event loop.
            let service = Arc::clone(service);
            tokio::spawn(async move {
                match service.connect(&device_id).await {
                    Ok(outcome) => {
                        info!(
                            device = %outcome.device_id,
                            name = ?outcome.name,
                            battery = ?outcome.battery,
                            identity = ?outcome.identity,
                            "connected"
                        );
                        if let Err(err) = service.sync_device(&outcome.device_id).await {
                            warn!(device = %outcome.device_id, %err, "time sync failed");
                        }
                        if let Err(err) = service.start_streaming(&outcome.device_id).await {
                            warn!(device = %outcome.device_id, %err, "streaming failed");
                        }
                    }
                    Err(err) => warn!(device = %device_id, %err, "connect failed"),
                }
            });
        }
        BridgeEvent::Device {
            device_id,
            kind,
            detail,
        } => {
            info!(device = %device_id, ?kind, ?detail, "device event");
        }
        BridgeEvent::Motion { device_id, sample } => {
            tracing::trace!(
                device = %device_id,
                t = sample.timestamp_ms,
                w = sample.quaternion.w,
                x = sample.quaternion.x,
                y = sample.quaternion.y,
                z = sample.quaternion.z,
                "motion"
            );
        }
    }
}
