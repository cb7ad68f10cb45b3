//! WinRT Backend
//!
//! Maps the transport traits onto the Windows Bluetooth LE stack:
//! advertisement watcher for discovery, `BluetoothLEDevice` plus a pinned
//! `GattSession` for connections, and CCCD writes for notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

use super::transport::{
    Adapter, Characteristic, CharacteristicProps, DiscoveryFilter, NotificationStream, Peripheral,
    Service,
};
use crate::domain::models::{ConnectionState, PeripheralInfo};
use crate::error::{ResourceError, TransportError};

fn winrt_err(context: &str, err: windows::core::Error) -> TransportError {
    TransportError::Backend(format!("{context}: {err}"))
}

fn guid_to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn address_to_string(address: u64) -> String {
    let b = address.to_be_bytes();
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

fn string_to_address(s: &str) -> Result<u64, TransportError> {
    let hex: String = s.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return Err(TransportError::Backend(format!("bad address {s:?}")));
    }
    u64::from_str_radix(&hex, 16).map_err(|_| TransportError::Backend(format!("bad address {s:?}")))
}

struct SeenDevice {
    name: Option<String>,
    rssi: i16,
}

/// Local radio via the WinRT advertisement watcher.
pub struct WinRtAdapter {
    watcher: StdMutex<Option<BluetoothLEAdvertisementWatcher>>,
    seen: Arc<StdMutex<HashMap<String, SeenDevice>>>,
}

impl WinRtAdapter {
    pub fn new() -> Self {
        Self {
            watcher: StdMutex::new(None),
            seen: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

impl Default for WinRtAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for WinRtAdapter {
    async fn initialize(&self) -> Result<(), TransportError> {
        // The watcher API needs no explicit radio handle.
        Ok(())
    }

    async fn start_scan(&self, filter: DiscoveryFilter) -> Result<(), TransportError> {
        self.stop_scan().await?;
        self.seen.lock().unwrap().clear();

        let watcher =
            BluetoothLEAdvertisementWatcher::new().map_err(|e| winrt_err("watcher", e))?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(|e| winrt_err("scanning mode", e))?;

        let seen = Arc::clone(&self.seen);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let name = adv.LocalName()?.to_string();
                    let name = (!name.is_empty()).then_some(name);
                    let rssi = args.RawSignalStrengthInDBm()?;
                    if filter.matches(name.as_deref(), Some(rssi)) {
                        let address = address_to_string(args.BluetoothAddress()?);
                        seen.lock()
                            .unwrap()
                            .insert(address, SeenDevice { name, rssi });
                    }
                }
                Ok(())
            },
        );
        watcher
            .Received(&handler)
            .map_err(|e| winrt_err("received handler", e))?;
        watcher.Start().map_err(|e| winrt_err("watcher start", e))?;
        info!("advertisement watcher started");
        *self.watcher.lock().unwrap() = Some(watcher);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.Stop().map_err(|e| winrt_err("watcher stop", e))?;
            debug!("advertisement watcher stopped");
        }
        Ok(())
    }

    async fn discovered_devices(&self) -> Result<Vec<PeripheralInfo>, TransportError> {
        Ok(self
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(address, device)| PeripheralInfo {
                id: address.clone(),
                address: address.clone(),
                name: device.name.clone(),
                rssi: Some(device.rssi),
                state: ConnectionState::Disconnected,
            })
            .collect())
    }

    async fn peripheral(&self, id: &str) -> Result<Arc<dyn Peripheral>, ResourceError> {
        let address = string_to_address(id)
            .map_err(|_| ResourceError::DeviceNotFound(id.to_string()))?;
        Ok(Arc::new(WinRtPeripheral::new(id.to_string(), address)))
    }

    async fn forget_peripheral(&self, id: &str) -> Result<(), TransportError> {
        self.seen.lock().unwrap().remove(id);
        Ok(())
    }

    async fn clear_device_cache(&self, address: &str) -> Result<(), TransportError> {
        let raw = string_to_address(address)?;
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(raw)
            .map_err(|e| winrt_err("device lookup", e))?
            .await
            .map_err(|e| winrt_err("device lookup", e))?;
        let info = device
            .DeviceInformation()
            .map_err(|e| winrt_err("device info", e))?;
        let pairing = info.Pairing().map_err(|e| winrt_err("pairing", e))?;
        if pairing.IsPaired().map_err(|e| winrt_err("pairing", e))? {
            pairing
                .UnpairAsync()
                .map_err(|e| winrt_err("unpair", e))?
                .await
                .map_err(|e| winrt_err("unpair", e))?;
            info!(address, "pairing record removed");
        }
        self.seen.lock().unwrap().remove(address);
        Ok(())
    }
}

struct LinkState {
    device: Option<BluetoothLEDevice>,
    /// Held for the lifetime of the link; `MaintainConnection` keeps the OS
    /// from dropping it between GATT operations.
    session: Option<GattSession>,
    status_token: Option<i64>,
}

pub struct WinRtPeripheral {
    id: String,
    address: u64,
    link: StdMutex<LinkState>,
    disconnects: broadcast::Sender<()>,
}

impl WinRtPeripheral {
    fn new(id: String, address: u64) -> Self {
        let (disconnects, _) = broadcast::channel(8);
        Self {
            id,
            address,
            link: StdMutex::new(LinkState {
                device: None,
                session: None,
                status_token: None,
            }),
            disconnects,
        }
    }

    fn device(&self) -> Result<BluetoothLEDevice, TransportError> {
        self.link
            .lock()
            .unwrap()
            .device
            .clone()
            .ok_or_else(|| TransportError::Backend("not connected".to_string()))
    }
}

#[async_trait]
impl Peripheral for WinRtPeripheral {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn address(&self) -> String {
        self.id.clone()
    }

    async fn name(&self) -> Option<String> {
        let device = self.device().ok()?;
        device.Name().ok().map(|n| n.to_string())
    }

    async fn rssi(&self) -> Option<i16> {
        // Connected-mode RSSI is not exposed by this stack.
        None
    }

    async fn connection_state(&self) -> ConnectionState {
        match self.device() {
            Ok(device) => match device.ConnectionStatus() {
                Ok(BluetoothConnectionStatus::Connected) => ConnectionState::Connected,
                _ => ConnectionState::Disconnected,
            },
            Err(_) => ConnectionState::Disconnected,
        }
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(self.address)
            .map_err(|e| winrt_err("connect", e))?
            .await
            .map_err(|e| winrt_err("connect", e))?;

        // Without a maintained GattSession Windows tears the link down
        // between operations and re-prompts for pairing.
        let session = match device
            .BluetoothDeviceId()
            .and_then(|id| GattSession::FromDeviceIdAsync(&id))
        {
            Ok(pending) => match pending.await {
                Ok(session) => {
                    let _ = session.SetMaintainConnection(true);
                    Some(session)
                }
                Err(err) => {
                    warn!(%err, "gatt session unavailable, continuing without");
                    None
                }
            },
            Err(err) => {
                warn!(%err, "gatt session unavailable, continuing without");
                None
            }
        };

        let disconnects = self.disconnects.clone();
        let handler = TypedEventHandler::new(
            move |device: windows::core::Ref<BluetoothLEDevice>, _: windows::core::Ref<_>| {
                if let Some(device) = device.as_ref() {
                    if device.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = disconnects.send(());
                    }
                }
                Ok(())
            },
        );
        let token = device
            .ConnectionStatusChanged(&handler)
            .map_err(|e| winrt_err("status handler", e))?;

        let mut link = self.link.lock().unwrap();
        link.device = Some(device);
        link.session = session;
        link.status_token = Some(token);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        if let (Some(device), Some(token)) = (&link.device, link.status_token.take()) {
            let _ = device.RemoveConnectionStatusChanged(token);
        }
        if let Some(session) = link.session.take() {
            let _ = session.Close();
        }
        // Dropping the last device reference releases the link.
        link.device = None;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<Arc<dyn Service>>, TransportError> {
        let device = self.device()?;
        let result = device
            .GetGattServicesAsync()
            .map_err(|e| winrt_err("service discovery", e))?
            .await
            .map_err(|e| winrt_err("service discovery", e))?;
        if result.Status().map_err(|e| winrt_err("service discovery", e))?
            != GattCommunicationStatus::Success
        {
            return Err(TransportError::DiscoveryFailed {
                address: self.id.clone(),
                reason: format!("{:?}", result.Status()),
            });
        }
        let services = result
            .Services()
            .map_err(|e| winrt_err("service discovery", e))?;
        let mut out: Vec<Arc<dyn Service>> = Vec::new();
        for i in 0..services.Size().map_err(|e| winrt_err("service discovery", e))? {
            let service = services
                .GetAt(i)
                .map_err(|e| winrt_err("service discovery", e))?;
            out.push(Arc::new(WinRtService { inner: service }));
        }
        Ok(out)
    }

    fn subscribe_disconnects(&self) -> broadcast::Receiver<()> {
        self.disconnects.subscribe()
    }
}

pub struct WinRtService {
    inner: GattDeviceService,
}

#[async_trait]
impl Service for WinRtService {
    fn uuid(&self) -> Uuid {
        self.inner
            .Uuid()
            .map(guid_to_uuid)
            .unwrap_or_else(|_| Uuid::nil())
    }

    async fn discover_characteristics(
        &self,
    ) -> Result<Vec<Arc<dyn Characteristic>>, TransportError> {
        // Access must be requested once per service before characteristic
        // operations succeed on recent Windows builds.
        if let Ok(pending) = self.inner.RequestAccessAsync() {
            let _ = pending.await;
        }
        let result = self
            .inner
            .GetCharacteristicsAsync()
            .map_err(|e| winrt_err("characteristics", e))?
            .await
            .map_err(|e| winrt_err("characteristics", e))?;
        if result.Status().map_err(|e| winrt_err("characteristics", e))?
            != GattCommunicationStatus::Success
        {
            return Err(TransportError::Backend(format!(
                "characteristic discovery status {:?}",
                result.Status()
            )));
        }
        let characteristics = result
            .Characteristics()
            .map_err(|e| winrt_err("characteristics", e))?;
        let mut out: Vec<Arc<dyn Characteristic>> = Vec::new();
        for i in 0..characteristics
            .Size()
            .map_err(|e| winrt_err("characteristics", e))?
        {
            let inner = characteristics
                .GetAt(i)
                .map_err(|e| winrt_err("characteristics", e))?;
            out.push(Arc::new(WinRtCharacteristic {
                inner,
                value_token: StdMutex::new(None),
            }));
        }
        Ok(out)
    }
}

pub struct WinRtCharacteristic {
    inner: GattCharacteristic,
    value_token: StdMutex<Option<i64>>,
}

#[async_trait]
impl Characteristic for WinRtCharacteristic {
    fn uuid(&self) -> Uuid {
        self.inner
            .Uuid()
            .map(guid_to_uuid)
            .unwrap_or_else(|_| Uuid::nil())
    }

    fn properties(&self) -> CharacteristicProps {
        let raw = self
            .inner
            .CharacteristicProperties()
            .unwrap_or(GattCharacteristicProperties::None);
        CharacteristicProps {
            read: (raw & GattCharacteristicProperties::Read) != GattCharacteristicProperties::None,
            write: (raw & GattCharacteristicProperties::Write)
                != GattCharacteristicProperties::None,
            write_without_response: (raw & GattCharacteristicProperties::WriteWithoutResponse)
                != GattCharacteristicProperties::None,
            notify: (raw & GattCharacteristicProperties::Notify)
                != GattCharacteristicProperties::None,
            indicate: (raw & GattCharacteristicProperties::Indicate)
                != GattCharacteristicProperties::None,
        }
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let result = self
            .inner
            .ReadValueAsync()
            .map_err(|e| winrt_err("read", e))?
            .await
            .map_err(|e| winrt_err("read", e))?;
        if result.Status().map_err(|e| winrt_err("read", e))? != GattCommunicationStatus::Success {
            return Err(TransportError::ReadFailed(format!(
                "{:?}",
                result.Status()
            )));
        }
        let buffer = result.Value().map_err(|e| winrt_err("read", e))?;
        let reader = DataReader::FromBuffer(&buffer).map_err(|e| winrt_err("read", e))?;
        let len = buffer.Length().map_err(|e| winrt_err("read", e))? as usize;
        let mut bytes = vec![0u8; len];
        reader
            .ReadBytes(&mut bytes)
            .map_err(|e| winrt_err("read", e))?;
        Ok(bytes)
    }

    async fn write(&self, data: &[u8], needs_ack: bool) -> Result<(), TransportError> {
        let writer = DataWriter::new().map_err(|e| winrt_err("write", e))?;
        writer
            .WriteBytes(data)
            .map_err(|e| winrt_err("write", e))?;
        let buffer = writer.DetachBuffer().map_err(|e| winrt_err("write", e))?;
        let option = if needs_ack {
            GattWriteOption::WriteWithResponse
        } else {
            GattWriteOption::WriteWithoutResponse
        };
        let status = self
            .inner
            .WriteValueWithOptionAsync(&buffer, option)
            .map_err(|e| winrt_err("write", e))?
            .await
            .map_err(|e| winrt_err("write", e))?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::WriteFailed(format!("{status:?}")));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let buffer = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&buffer)?;
                    let len = buffer.Length()? as usize;
                    let mut bytes = vec![0u8; len];
                    reader.ReadBytes(&mut bytes)?;
                    let _ = tx.try_send(bytes);
                }
                Ok(())
            },
        );
        let token = self
            .inner
            .ValueChanged(&handler)
            .map_err(|e| winrt_err("subscribe", e))?;
        *self.value_token.lock().unwrap() = Some(token);

        let status = self
            .inner
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(|e| winrt_err("subscribe", e))?
            .await
            .map_err(|e| winrt_err("subscribe", e))?;
        if status != GattCommunicationStatus::Success {
            if let Some(token) = self.value_token.lock().unwrap().take() {
                let _ = self.inner.RemoveValueChanged(token);
            }
            return Err(TransportError::SubscribeFailed(format!("{status:?}")));
        }
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        if let Some(token) = self.value_token.lock().unwrap().take() {
            let _ = self.inner.RemoveValueChanged(token);
        }
        let _ = self
            .inner
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )
            .map_err(|e| winrt_err("unsubscribe", e))?
            .await;
        Ok(())
    }
}
