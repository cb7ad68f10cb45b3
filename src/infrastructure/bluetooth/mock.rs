//! Scripted in-process backend.
//!
//! Implements the transport traits against fixture data so sessions, the
//! orchestrator, and the sync engine can be exercised without a radio. A
//! [`FirmwareScript`] emulates the sensor's command/reply behavior on the
//! command characteristic; tests inject streaming packets by hand through
//! [`MockDeviceHandle::notify`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::protocol::{
    self, encode_reply, CMD_ENTER_TIME_SYNC, CMD_EXIT_TIME_SYNC, CMD_GET_BATTERY,
    CMD_GET_SYSTEM_STATE, CMD_GET_TIMESTAMP, CMD_SET_CLOCK_OFFSET, CMD_SET_DATE_TIME,
    CMD_SET_MODE, CMD_START_STREAM, CMD_STOP_STREAM, NACK_INVALID_STATE, READ_MASK,
};
use super::transport::{
    normalize_uuid, Adapter, Characteristic, CharacteristicProps, DiscoveryFilter,
    NotificationStream, Peripheral, Service,
};
use crate::domain::models::{ConnectionState, PeripheralInfo};
use crate::error::{ResourceError, TransportError};

/// Reply generator for writes to a characteristic; `None` means no
/// notification is produced.
pub type WriteResponder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

pub struct MockCharacteristicSpec {
    pub uuid: Uuid,
    pub props: CharacteristicProps,
    pub responder: Option<WriteResponder>,
}

pub struct MockServiceSpec {
    pub uuid: Uuid,
    pub characteristics: Vec<MockCharacteristicSpec>,
}

pub struct MockDeviceSpec {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<MockServiceSpec>,
    /// Fail the first N connect attempts.
    pub connect_failures: u32,
    /// Report zero services for the first N service discoveries.
    pub empty_service_discoveries: u32,
    /// Fail the first N characteristic discoveries.
    pub characteristic_discovery_failures: u32,
    pub connect_delay: Duration,
}

impl MockDeviceSpec {
    /// A well-behaved sensor advertising the standard service layout, with
    /// the given responder wired to the command characteristic.
    pub fn sensor(
        address: &str,
        name: &str,
        rssi: i16,
        responder: WriteResponder,
    ) -> Self {
        let service_uuid = normalize_uuid(protocol::SERVICE_UUID).unwrap();
        let command_uuid = normalize_uuid(protocol::COMMAND_CHAR_UUID).unwrap();
        let data_uuid = normalize_uuid(protocol::DATA_CHAR_UUID).unwrap();
        Self {
            id: address.to_string(),
            address: address.to_string(),
            name: Some(name.to_string()),
            rssi: Some(rssi),
            services: vec![MockServiceSpec {
                uuid: service_uuid,
                characteristics: vec![
                    MockCharacteristicSpec {
                        uuid: command_uuid,
                        props: CharacteristicProps {
                            write: true,
                            notify: true,
                            ..Default::default()
                        },
                        responder: Some(responder),
                    },
                    MockCharacteristicSpec {
                        uuid: data_uuid,
                        props: CharacteristicProps {
                            notify: true,
                            ..Default::default()
                        },
                        responder: None,
                    },
                ],
            }],
            connect_failures: 0,
            empty_service_discoveries: 0,
            characteristic_discovery_failures: 0,
            connect_delay: Duration::ZERO,
        }
    }
}

struct CharState {
    uuid: Uuid,
    props: CharacteristicProps,
    responder: Mutex<Option<WriteResponder>>,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl CharState {
    fn push_notification(&self, payload: Vec<u8>) {
        let subscribers = self.subscribers.lock().unwrap();
        for tx in subscribers.iter() {
            let _ = tx.try_send(payload.clone());
        }
    }
}

struct ServiceState {
    uuid: Uuid,
    characteristics: Vec<Arc<CharState>>,
}

struct DeviceState {
    id: String,
    address: String,
    name: Option<String>,
    rssi: Option<i16>,
    services: Vec<Arc<ServiceState>>,
    connected: AtomicBool,
    remaining_connect_failures: AtomicU32,
    remaining_empty_discoveries: AtomicU32,
    remaining_char_failures: AtomicU32,
    connect_delay: Duration,
    disconnect_tx: broadcast::Sender<()>,
}

impl DeviceState {
    fn characteristic(&self, uuid: Uuid) -> Option<Arc<CharState>> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .cloned()
    }

    fn info(&self) -> PeripheralInfo {
        PeripheralInfo {
            id: self.id.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            state: if self.connected.load(Ordering::SeqCst) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
        }
    }
}

struct AdapterState {
    devices: Mutex<HashMap<String, Arc<DeviceState>>>,
    filter: Mutex<Option<DiscoveryFilter>>,
    scanning: AtomicBool,
    cleared: Mutex<Vec<String>>,
}

/// Fixture-backed adapter.
#[derive(Clone)]
pub struct MockAdapter {
    inner: Arc<AdapterState>,
}

impl MockAdapter {
    pub fn new(specs: Vec<MockDeviceSpec>) -> Self {
        let mut devices = HashMap::new();
        for spec in specs {
            let services = spec
                .services
                .into_iter()
                .map(|s| {
                    Arc::new(ServiceState {
                        uuid: s.uuid,
                        characteristics: s
                            .characteristics
                            .into_iter()
                            .map(|c| {
                                Arc::new(CharState {
                                    uuid: c.uuid,
                                    props: c.props,
                                    responder: Mutex::new(c.responder),
                                    subscribers: Mutex::new(Vec::new()),
                                    writes: Mutex::new(Vec::new()),
                                })
                            })
                            .collect(),
                    })
                })
                .collect();
            let (disconnect_tx, _) = broadcast::channel(8);
            devices.insert(
                spec.id.clone(),
                Arc::new(DeviceState {
                    id: spec.id,
                    address: spec.address,
                    name: spec.name,
                    rssi: spec.rssi,
                    services,
                    connected: AtomicBool::new(false),
                    remaining_connect_failures: AtomicU32::new(spec.connect_failures),
                    remaining_empty_discoveries: AtomicU32::new(spec.empty_service_discoveries),
                    remaining_char_failures: AtomicU32::new(spec.characteristic_discovery_failures),
                    connect_delay: spec.connect_delay,
                    disconnect_tx,
                }),
            );
        }
        Self {
            inner: Arc::new(AdapterState {
                devices: Mutex::new(devices),
                filter: Mutex::new(None),
                scanning: AtomicBool::new(false),
                cleared: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Addresses removed from the OS registry via `clear_device_cache`.
    pub fn cleared_addresses(&self) -> Vec<String> {
        self.inner.cleared.lock().unwrap().clone()
    }

    pub fn device_handle(&self, address: &str) -> Option<MockDeviceHandle> {
        let devices = self.inner.devices.lock().unwrap();
        devices
            .values()
            .find(|d| d.address == address)
            .cloned()
            .map(|state| MockDeviceHandle { state })
    }

    fn find(&self, id: &str) -> Option<Arc<DeviceState>> {
        let devices = self.inner.devices.lock().unwrap();
        devices
            .get(id)
            .cloned()
            .or_else(|| devices.values().find(|d| d.address == id).cloned())
    }
}

/// Test-side handle to one fixture device.
pub struct MockDeviceHandle {
    state: Arc<DeviceState>,
}

impl MockDeviceHandle {
    /// Inject a notification on a characteristic (streaming packets).
    pub fn notify(&self, char_uuid: Uuid, payload: Vec<u8>) {
        if let Some(ch) = self.state.characteristic(char_uuid) {
            ch.push_notification(payload);
        }
    }

    /// Frames written to a characteristic so far.
    pub fn writes(&self, char_uuid: Uuid) -> Vec<Vec<u8>> {
        self.state
            .characteristic(char_uuid)
            .map(|ch| ch.writes.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Simulate an unexpected link loss.
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        let _ = self.state.disconnect_tx.send(());
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn start_scan(&self, filter: DiscoveryFilter) -> Result<(), TransportError> {
        *self.inner.filter.lock().unwrap() = Some(filter);
        self.inner.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.inner.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn discovered_devices(&self) -> Result<Vec<PeripheralInfo>, TransportError> {
        let filter = self.inner.filter.lock().unwrap().clone().unwrap_or_default();
        let devices = self.inner.devices.lock().unwrap();
        Ok(devices
            .values()
            .filter(|d| filter.matches(d.name.as_deref(), d.rssi))
            .map(|d| d.info())
            .collect())
    }

    async fn peripheral(&self, id: &str) -> Result<Arc<dyn Peripheral>, ResourceError> {
        self.find(id)
            .map(|state| Arc::new(MockPeripheral { state }) as Arc<dyn Peripheral>)
            .ok_or_else(|| ResourceError::DeviceNotFound(id.to_string()))
    }

    async fn forget_peripheral(&self, id: &str) -> Result<(), TransportError> {
        self.inner.devices.lock().unwrap().remove(id);
        Ok(())
    }

    async fn clear_device_cache(&self, address: &str) -> Result<(), TransportError> {
        let state = {
            let devices = self.inner.devices.lock().unwrap();
            devices.values().find(|d| d.address == address).cloned()
        };
        if let Some(state) = state {
            if state.connected.swap(false, Ordering::SeqCst) {
                let _ = state.disconnect_tx.send(());
            }
            self.inner.devices.lock().unwrap().remove(&state.id);
        }
        self.inner.cleared.lock().unwrap().push(address.to_string());
        Ok(())
    }
}

struct MockPeripheral {
    state: Arc<DeviceState>,
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn id(&self) -> String {
        self.state.id.clone()
    }

    fn address(&self) -> String {
        self.state.address.clone()
    }

    async fn name(&self) -> Option<String> {
        self.state.name.clone()
    }

    async fn rssi(&self) -> Option<i16> {
        self.state.rssi
    }

    async fn connection_state(&self) -> ConnectionState {
        if self.state.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.state.connect_delay.is_zero() {
            tokio::time::sleep(self.state.connect_delay).await;
        }
        let remaining = self.state.remaining_connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .remaining_connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed {
                address: self.state.address.clone(),
                reason: "scripted connect failure".to_string(),
            });
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.state.connected.swap(false, Ordering::SeqCst) {
            let _ = self.state.disconnect_tx.send(());
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<Arc<dyn Service>>, TransportError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(TransportError::DiscoveryFailed {
                address: self.state.address.clone(),
                reason: "not connected".to_string(),
            });
        }
        let remaining = self.state.remaining_empty_discoveries.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .remaining_empty_discoveries
                .store(remaining - 1, Ordering::SeqCst);
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .services
            .iter()
            .map(|s| {
                Arc::new(MockService {
                    device: Arc::clone(&self.state),
                    service: Arc::clone(s),
                }) as Arc<dyn Service>
            })
            .collect())
    }

    fn subscribe_disconnects(&self) -> broadcast::Receiver<()> {
        self.state.disconnect_tx.subscribe()
    }
}

struct MockService {
    device: Arc<DeviceState>,
    service: Arc<ServiceState>,
}

#[async_trait]
impl Service for MockService {
    fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    async fn discover_characteristics(
        &self,
    ) -> Result<Vec<Arc<dyn Characteristic>>, TransportError> {
        let remaining = self.device.remaining_char_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.device
                .remaining_char_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::DiscoveryFailed {
                address: self.device.address.clone(),
                reason: "scripted characteristic discovery failure".to_string(),
            });
        }
        Ok(self
            .service
            .characteristics
            .iter()
            .map(|c| Arc::new(MockCharacteristic { state: Arc::clone(c) }) as Arc<dyn Characteristic>)
            .collect())
    }
}

struct MockCharacteristic {
    state: Arc<CharState>,
}

#[async_trait]
impl Characteristic for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        self.state.uuid
    }

    fn properties(&self) -> CharacteristicProps {
        self.state.props
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::ReadFailed(
            "mock characteristics reply via notifications".to_string(),
        ))
    }

    async fn write(&self, data: &[u8], _needs_ack: bool) -> Result<(), TransportError> {
        self.state.writes.lock().unwrap().push(data.to_vec());
        let responder = self.state.responder.lock().unwrap().clone();
        if let Some(responder) = responder {
            if let Some(reply) = responder(data) {
                self.state.push_notification(reply);
            }
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        self.state.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.state.subscribers.lock().unwrap().clear();
        Ok(())
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Records of what a scripted firmware has been told.
#[derive(Default)]
pub struct FirmwareLog {
    pub rtc_unix_secs: Mutex<Option<u32>>,
    pub offset_register: Mutex<Option<i64>>,
    pub stream_commands: Mutex<Vec<Vec<u8>>>,
    pub in_sync_mode: AtomicBool,
}

/// Emulated sensor firmware behind the command characteristic.
///
/// The device counter reads `master_clock − clock_skew_ms` plus a small
/// deterministic jitter, so a sync run should estimate an offset of
/// about `clock_skew_ms`.
pub struct FirmwareScript {
    pub battery: u8,
    pub system_state: u8,
    pub clock_skew_ms: i64,
    /// When set, the counter is reported in milliseconds instead of
    /// microseconds (the small-counter firmware quirk).
    pub millisecond_firmware: bool,
    pub jitter_ms: i64,
    /// When set, `SetClockOffset` is nacked with this code even in sync
    /// mode, emulating legacy firmware or a faulty register.
    pub offset_register_nack: Option<u8>,
}

impl Default for FirmwareScript {
    fn default() -> Self {
        Self {
            battery: 87,
            system_state: 0x00,
            clock_skew_ms: 5000,
            millisecond_firmware: true,
            jitter_ms: 2,
            offset_register_nack: None,
        }
    }
}

impl FirmwareScript {
    pub fn into_responder(self) -> (WriteResponder, Arc<FirmwareLog>) {
        let log = Arc::new(FirmwareLog::default());
        let log_for_responder = Arc::clone(&log);
        let jitter_phase = AtomicI64::new(0);

        let responder: WriteResponder = Arc::new(move |frame: &[u8]| {
            if frame.len() < 2 {
                return None;
            }
            let opcode = frame[0];
            let payload = &frame[2..];
            match opcode {
                op if op == CMD_GET_BATTERY | READ_MASK => {
                    Some(encode_reply(op, &[self.battery]))
                }
                op if op == CMD_GET_SYSTEM_STATE | READ_MASK => {
                    Some(encode_reply(op, &[self.system_state]))
                }
                op if op == CMD_GET_TIMESTAMP | READ_MASK => {
                    let phase = jitter_phase.fetch_add(1, Ordering::SeqCst);
                    let span = 2 * self.jitter_ms + 1;
                    let jitter = (phase % span.max(1)) - self.jitter_ms;
                    let counter_ms = now_ms() - self.clock_skew_ms + jitter;
                    let counter = if self.millisecond_firmware {
                        counter_ms as u64
                    } else {
                        (counter_ms as u64).saturating_mul(1000)
                    };
                    Some(encode_reply(op, &counter.to_le_bytes()))
                }
                op if op == CMD_SET_DATE_TIME => {
                    if payload.len() == 4 {
                        let secs = u32::from_le_bytes(payload.try_into().unwrap());
                        *log_for_responder.rtc_unix_secs.lock().unwrap() = Some(secs);
                    }
                    Some(encode_reply(op, &[0]))
                }
                op if op == CMD_ENTER_TIME_SYNC => {
                    log_for_responder.in_sync_mode.store(true, Ordering::SeqCst);
                    Some(encode_reply(op, &[0]))
                }
                op if op == CMD_EXIT_TIME_SYNC => {
                    log_for_responder.in_sync_mode.store(false, Ordering::SeqCst);
                    Some(encode_reply(op, &[0]))
                }
                op if op == CMD_SET_CLOCK_OFFSET => {
                    // Writing the register outside sync mode is a protocol
                    // violation; the scripted firmware nacks it.
                    if !log_for_responder.in_sync_mode.load(Ordering::SeqCst) {
                        return Some(encode_reply(op, &[NACK_INVALID_STATE]));
                    }
                    if let Some(code) = self.offset_register_nack {
                        return Some(encode_reply(op, &[code]));
                    }
                    if payload.len() == 8 {
                        let offset = i64::from_le_bytes(payload.try_into().unwrap());
                        *log_for_responder.offset_register.lock().unwrap() = Some(offset);
                    }
                    Some(encode_reply(op, &[0]))
                }
                op if op == CMD_START_STREAM || op == CMD_STOP_STREAM => {
                    log_for_responder
                        .stream_commands
                        .lock()
                        .unwrap()
                        .push(frame.to_vec());
                    None
                }
                op if op == CMD_SET_MODE => Some(encode_reply(op, &[0])),
                _ => None,
            }
        });

        (responder, log)
    }
}
