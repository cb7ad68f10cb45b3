//! BlueZ Backend
//!
//! Maps the transport traits onto bluetoothd via bluer: adapter discovery
//! streams, remote GATT services, and notification sessions. Trait getters
//! for UUIDs and properties are synchronous, so those values are captured
//! once at discovery time instead of round-tripping over D-Bus per call.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bluer::gatt::remote::{
    Characteristic as BluezGattCharacteristic, CharacteristicWriteRequest,
    Service as BluezGattService,
};
use bluer::gatt::WriteOp;
use bluer::{Adapter as BluezAdapterHandle, AdapterEvent, Address, Device, Session};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{
    Adapter, Characteristic, CharacteristicProps, DiscoveryFilter, NotificationStream, Peripheral,
    Service,
};
use crate::domain::models::{ConnectionState, PeripheralInfo};
use crate::error::{ResourceError, TransportError};

fn bluez_err(context: &str, err: bluer::Error) -> TransportError {
    TransportError::Backend(format!("{context}: {err}"))
}

/// Local radio via bluetoothd.
pub struct BluezAdapter {
    adapter: BluezAdapterHandle,
    discovered: Arc<StdMutex<HashMap<Address, PeripheralInfo>>>,
    scan_task: StdMutex<Option<JoinHandle<()>>>,
}

impl BluezAdapter {
    pub async fn new() -> Result<Self, TransportError> {
        let session = Session::new()
            .await
            .map_err(|e| bluez_err("session", e))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::AdapterUnavailable("no default adapter".to_string()))?;
        Ok(Self {
            adapter,
            discovered: Arc::new(StdMutex::new(HashMap::new())),
            scan_task: StdMutex::new(None),
        })
    }

    async fn device(&self, address: Address) -> Result<Device, TransportError> {
        self.adapter
            .device(address)
            .map_err(|e| bluez_err("device", e))
    }
}

fn parse_address(id: &str) -> Result<Address, ResourceError> {
    Address::from_str(id).map_err(|_| ResourceError::DeviceNotFound(id.to_string()))
}

#[async_trait]
impl Adapter for BluezAdapter {
    async fn initialize(&self) -> Result<(), TransportError> {
        self.adapter
            .set_powered(true)
            .await
            .map_err(|e| bluez_err("power on", e))
    }

    async fn start_scan(&self, filter: DiscoveryFilter) -> Result<(), TransportError> {
        self.stop_scan().await?;
        self.discovered.lock().unwrap().clear();

        let mut events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| bluez_err("discover", e))?;
        info!(adapter = %self.adapter.name(), "discovery started");

        let adapter = self.adapter.clone();
        let discovered = Arc::clone(&self.discovered);
        let task = tokio::spawn(async move {
            // The discovery session lives as long as this stream.
            while let Some(event) = events.next().await {
                let address = match event {
                    AdapterEvent::DeviceAdded(address) => address,
                    _ => continue,
                };
                let device = match adapter.device(address) {
                    Ok(device) => device,
                    Err(err) => {
                        warn!(%address, %err, "device lookup during scan failed");
                        continue;
                    }
                };
                let name = device.name().await.ok().flatten();
                let rssi = device.rssi().await.ok().flatten();
                if filter.matches(name.as_deref(), rssi) {
                    debug!(%address, ?name, ?rssi, "device matched");
                    let info = PeripheralInfo {
                        id: address.to_string(),
                        address: address.to_string(),
                        name,
                        rssi,
                        state: ConnectionState::Disconnected,
                    };
                    discovered.lock().unwrap().insert(address, info);
                }
            }
        });
        *self.scan_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(task) = self.scan_task.lock().unwrap().take() {
            task.abort();
            debug!("discovery stopped");
        }
        Ok(())
    }

    async fn discovered_devices(&self) -> Result<Vec<PeripheralInfo>, TransportError> {
        Ok(self.discovered.lock().unwrap().values().cloned().collect())
    }

    async fn peripheral(&self, id: &str) -> Result<Arc<dyn Peripheral>, ResourceError> {
        let address = parse_address(id)?;
        let device = self
            .device(address)
            .await
            .map_err(|_| ResourceError::DeviceNotFound(id.to_string()))?;
        Ok(Arc::new(BluezPeripheral::new(device)))
    }

    async fn forget_peripheral(&self, id: &str) -> Result<(), TransportError> {
        if let Ok(address) = parse_address(id) {
            self.discovered.lock().unwrap().remove(&address);
        }
        Ok(())
    }

    async fn clear_device_cache(&self, address: &str) -> Result<(), TransportError> {
        let address = parse_address(address)
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        if let Ok(device) = self.adapter.device(address) {
            if device.is_connected().await.unwrap_or(false) {
                let _ = device.disconnect().await;
            }
        }
        // Removes the bluetoothd record including cached GATT data.
        self.adapter
            .remove_device(address)
            .await
            .map_err(|e| bluez_err("remove device", e))?;
        self.discovered.lock().unwrap().remove(&address);
        info!(%address, "device record removed");
        Ok(())
    }
}

pub struct BluezPeripheral {
    device: Device,
    disconnects: broadcast::Sender<()>,
    watch_task: StdMutex<Option<JoinHandle<()>>>,
}

impl BluezPeripheral {
    fn new(device: Device) -> Self {
        let (disconnects, _) = broadcast::channel(8);
        Self {
            device,
            disconnects,
            watch_task: StdMutex::new(None),
        }
    }

    async fn spawn_property_watch(&self) {
        let events = match self.device.events().await {
            Ok(events) => events,
            Err(err) => {
                warn!(%err, "device property events unavailable");
                return;
            }
        };
        let disconnects = self.disconnects.clone();
        let task = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                let bluer::DeviceEvent::PropertyChanged(property) = event;
                if let bluer::DeviceProperty::Connected(false) = property {
                    let _ = disconnects.send(());
                }
            }
        });
        if let Some(previous) = self.watch_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    fn id(&self) -> String {
        self.device.address().to_string()
    }

    fn address(&self) -> String {
        self.device.address().to_string()
    }

    async fn name(&self) -> Option<String> {
        self.device.name().await.ok().flatten()
    }

    async fn rssi(&self) -> Option<i16> {
        self.device.rssi().await.ok().flatten()
    }

    async fn connection_state(&self) -> ConnectionState {
        match self.device.is_connected().await {
            Ok(true) => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.spawn_property_watch().await;
        self.device.connect().await.map_err(|e| {
            TransportError::ConnectFailed {
                address: self.device.address().to_string(),
                reason: e.to_string(),
            }
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let result = self
            .device
            .disconnect()
            .await
            .map_err(|e| bluez_err("disconnect", e));
        if let Some(task) = self.watch_task.lock().unwrap().take() {
            task.abort();
        }
        result
    }

    async fn discover_services(&self) -> Result<Vec<Arc<dyn Service>>, TransportError> {
        let services = self
            .device
            .services()
            .await
            .map_err(|e| bluez_err("services", e))?;
        let mut out: Vec<Arc<dyn Service>> = Vec::with_capacity(services.len());
        for service in services {
            let uuid = service.uuid().await.map_err(|e| bluez_err("services", e))?;
            out.push(Arc::new(BluezService {
                inner: service,
                uuid,
            }));
        }
        Ok(out)
    }

    fn subscribe_disconnects(&self) -> broadcast::Receiver<()> {
        self.disconnects.subscribe()
    }
}

pub struct BluezService {
    inner: BluezGattService,
    uuid: Uuid,
}

#[async_trait]
impl Service for BluezService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn discover_characteristics(
        &self,
    ) -> Result<Vec<Arc<dyn Characteristic>>, TransportError> {
        let characteristics = self
            .inner
            .characteristics()
            .await
            .map_err(|e| bluez_err("characteristics", e))?;
        let mut out: Vec<Arc<dyn Characteristic>> = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            let uuid = characteristic
                .uuid()
                .await
                .map_err(|e| bluez_err("characteristics", e))?;
            let flags = characteristic
                .flags()
                .await
                .map_err(|e| bluez_err("characteristics", e))?;
            out.push(Arc::new(BluezCharacteristic {
                inner: characteristic,
                uuid,
                props: CharacteristicProps {
                    read: flags.read,
                    write: flags.write,
                    write_without_response: flags.write_without_response,
                    notify: flags.notify,
                    indicate: flags.indicate,
                },
                notify_task: StdMutex::new(None),
            }));
        }
        Ok(out)
    }
}

pub struct BluezCharacteristic {
    inner: BluezGattCharacteristic,
    uuid: Uuid,
    props: CharacteristicProps,
    notify_task: StdMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Characteristic for BluezCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> CharacteristicProps {
        self.props
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        self.inner
            .read()
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    async fn write(&self, data: &[u8], needs_ack: bool) -> Result<(), TransportError> {
        let request = CharacteristicWriteRequest {
            op_type: if needs_ack {
                WriteOp::Request
            } else {
                WriteOp::Command
            },
            ..Default::default()
        };
        self.inner
            .write_ext(data, &request)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        let mut notifications = self
            .inner
            .notify()
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let (tx, rx) = mpsc::channel(256);
        // The notify session ends when the stream is dropped, so it lives
        // inside the forwarding task.
        let task = tokio::spawn(async move {
            while let Some(bytes) = notifications.next().await {
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.notify_task.lock().unwrap().replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        if let Some(task) = self.notify_task.lock().unwrap().take() {
            task.abort();
        }
        Ok(())
    }
}
