//! Device Session
//!
//! Owns one physical sensor's lifecycle: connect, service/characteristic
//! discovery with retries, battery polling, stream start/stop, disconnect,
//! and disposal. A session that has been superseded by a newer instance for
//! the same address sets its disposed flag; every long-running method checks
//! that flag after each suspension point and aborts instead of touching
//! characteristic handles that now belong to the replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::protocol::{self, DeviceCommand};
use super::transport::{normalize_uuid, Characteristic, Peripheral};
use crate::domain::models::{
    BridgeEvent, ConnectOutcome, DeviceEventKind, MotionSample, SessionState, SyncState,
};
use crate::domain::settings::ConnectionSettings;
use crate::error::{BridgeError, ConcurrencyError, ResourceError, TransportError};

/// Per-session tuning, derived from [`ConnectionSettings`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub discovery_attempts: u32,
    pub discovery_retry_delay: Duration,
    pub battery_poll_interval: Duration,
    pub reply_timeout: Duration,
}

impl SessionConfig {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            discovery_attempts: settings.discovery_attempts,
            discovery_retry_delay: Duration::from_millis(settings.discovery_retry_delay_ms),
            battery_poll_interval: Duration::from_secs(settings.battery_poll_secs),
            reply_timeout: Duration::from_millis(settings.reply_timeout_ms),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

/// Cross-instance discovery locks, keyed by device address. Two session
/// instances can exist briefly for one physical device during a supersede;
/// only one may run characteristic discovery at a time. Guards are held
/// across the discovery awaits and released by drop, including when a
/// disposed holder bails out.
static DISCOVERY_LOCKS: OnceLock<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>> = OnceLock::new();

fn discovery_lock(address: &str) -> Arc<AsyncMutex<()>> {
    let locks = DISCOVERY_LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut map = locks.lock().unwrap();
    Arc::clone(
        map.entry(address.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
    )
}

#[derive(Default)]
struct CharCache {
    command: Option<Arc<dyn Characteristic>>,
    data: Option<Arc<dyn Characteristic>>,
}

#[derive(Default)]
struct SessionTasks {
    battery: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    link_watch: Option<JoinHandle<()>>,
}

struct SyncStatus {
    state: SyncState,
    offset_ms: Option<i64>,
}

struct SessionShared {
    device_id: String,
    name: StdMutex<Option<String>>,
    peripheral: Arc<dyn Peripheral>,
    config: SessionConfig,
    events: UnboundedSender<BridgeEvent>,
    state: StdMutex<SessionState>,
    streaming: AtomicBool,
    disposed: AtomicBool,
    user_disconnect: AtomicBool,
    chars: StdMutex<CharCache>,
    sync: StdMutex<SyncStatus>,
    last_sequence: StdMutex<Option<u16>>,
    tasks: StdMutex<SessionTasks>,
    /// One command/reply exchange on the command characteristic at a time.
    transact_lock: AsyncMutex<()>,
}

/// Handle to one device session. Clones share the same underlying session.
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<SessionShared>,
}

impl DeviceSession {
    pub fn new(
        peripheral: Arc<dyn Peripheral>,
        config: SessionConfig,
        events: UnboundedSender<BridgeEvent>,
    ) -> Self {
        let device_id = peripheral.address();
        Self {
            shared: Arc::new(SessionShared {
                device_id,
                name: StdMutex::new(None),
                peripheral,
                config,
                events,
                state: StdMutex::new(SessionState::Disconnected),
                streaming: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                user_disconnect: AtomicBool::new(false),
                chars: StdMutex::new(CharCache::default()),
                sync: StdMutex::new(SyncStatus {
                    state: SyncState::Unsynced,
                    offset_ms: None,
                }),
                last_sequence: StdMutex::new(None),
                tasks: StdMutex::new(SessionTasks::default()),
                transact_lock: AsyncMutex::new(()),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn name(&self) -> Option<String> {
        self.shared.name.lock().unwrap().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    pub fn sync_state(&self) -> SyncState {
        self.shared.sync.lock().unwrap().state
    }

    pub fn clock_offset_ms(&self) -> Option<i64> {
        self.shared.sync.lock().unwrap().offset_ms
    }

    fn ensure_not_disposed(&self) -> Result<(), ConcurrencyError> {
        if self.is_disposed() {
            Err(ConcurrencyError::SessionDisposed {
                device_id: self.shared.device_id.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.shared.state.lock().unwrap();
        trace!(device = %self.shared.device_id, ?state, previous = ?*current, "session state");
        *current = state;
    }

    fn emit(&self, kind: DeviceEventKind, detail: Option<String>) {
        let _ = self.shared.events.send(BridgeEvent::Device {
            device_id: self.shared.device_id.clone(),
            kind,
            detail,
        });
    }

    fn fail(&self, message: &str) {
        self.set_state(SessionState::Error);
        self.emit(DeviceEventKind::Error, Some(message.to_string()));
    }

    /// Connect, discover, read battery, start polling. The `Connected`
    /// event is only emitted after the battery read so the first
    /// notification carries complete device info.
    pub async fn connect(&self) -> Result<ConnectOutcome, BridgeError> {
        self.ensure_not_disposed()?;
        self.set_state(SessionState::Connecting);
        info!(device = %self.shared.device_id, "connecting");

        let connect_timeout = self.shared.config.connect_timeout;
        match timeout(connect_timeout, self.shared.peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.fail(&err.to_string());
                return Err(err.into());
            }
            Err(_) => {
                let err = TransportError::ConnectTimeout {
                    address: self.shared.device_id.clone(),
                    timeout_ms: connect_timeout.as_millis() as u64,
                };
                self.fail(&err.to_string());
                return Err(err.into());
            }
        }
        // Observe async disconnects from here on, before any further I/O.
        self.spawn_link_watch();

        match self.establish().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The physical link is up but the session never became
                // usable. Tear everything down so the radio is released
                // and the device can be rediscovered right away.
                self.dispose();
                if let Err(link_err) = self.shared.peripheral.disconnect().await {
                    debug!(device = %self.shared.device_id, %link_err, "teardown disconnect failed");
                }
                Err(err)
            }
        }
    }

    /// Post-link setup: name, service and characteristic discovery, the
    /// initial battery read. Split out so `connect` can release the link
    /// on any failure in here.
    async fn establish(&self) -> Result<ConnectOutcome, BridgeError> {
        self.ensure_not_disposed()?;
        let name = self.shared.peripheral.name().await;
        *self.shared.name.lock().unwrap() = name.clone();
        self.ensure_not_disposed()?;

        self.set_state(SessionState::ServiceDiscovery);
        let services = self.discover_services_tolerant().await?;
        self.ensure_not_disposed()?;

        let target_uuid = normalize_uuid(protocol::SERVICE_UUID)
            .map_err(BridgeError::from)?;
        let target = services
            .iter()
            .find(|s| s.uuid() == target_uuid)
            .cloned()
            .unwrap_or_else(|| {
                // Some firmware/backends do not report the service table
                // identically; fall back to the first service.
                warn!(device = %self.shared.device_id, "target service not reported, using first");
                Arc::clone(&services[0])
            });

        {
            let lock = discovery_lock(&self.shared.device_id);
            let _guard = lock.lock().await;
            self.ensure_not_disposed()?;
            self.discover_characteristics(target.as_ref()).await?;
        }

        // Best-effort: a failed battery read must not abort the connection.
        let battery = match self.read_battery().await {
            Ok(percent) => Some(percent),
            Err(err) if err.is_disposed() => return Err(err),
            Err(err) => {
                warn!(device = %self.shared.device_id, %err, "initial battery read failed");
                None
            }
        };
        self.ensure_not_disposed()?;

        self.spawn_battery_polling();
        self.set_state(SessionState::Connected);
        self.emit(
            DeviceEventKind::Connected,
            battery.map(|b| format!("battery={b}")),
        );
        info!(device = %self.shared.device_id, ?battery, "connected");

        Ok(ConnectOutcome {
            device_id: self.shared.device_id.clone(),
            name,
            battery,
            identity: None,
        })
    }

    /// Service discovery, retrying once when the backend reports zero
    /// services (a transient stack hiccup right after connection).
    async fn discover_services_tolerant(
        &self,
    ) -> Result<Vec<Arc<dyn super::transport::Service>>, BridgeError> {
        let mut services = self.shared.peripheral.discover_services().await?;
        if services.is_empty() {
            debug!(device = %self.shared.device_id, "empty service discovery, retrying once");
            sleep(self.shared.config.discovery_retry_delay).await;
            self.ensure_not_disposed()?;
            services = self.shared.peripheral.discover_services().await?;
        }
        if services.is_empty() {
            let err = TransportError::DiscoveryFailed {
                address: self.shared.device_id.clone(),
                reason: "no services reported".to_string(),
            };
            self.fail(&err.to_string());
            return Err(err.into());
        }
        Ok(services)
    }

    /// Find the command and data characteristics, retrying with fixed
    /// backoff; BLE stacks occasionally fail discovery transiently right
    /// after connecting. Caller holds the per-device discovery lock.
    async fn discover_characteristics(
        &self,
        service: &dyn super::transport::Service,
    ) -> Result<(), BridgeError> {
        let command_uuid = normalize_uuid(protocol::COMMAND_CHAR_UUID)?;
        let data_uuid = normalize_uuid(protocol::DATA_CHAR_UUID)?;

        let attempts = self.shared.config.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            match service.discover_characteristics().await {
                Ok(characteristics) => {
                    let command = characteristics
                        .iter()
                        .find(|c| c.uuid() == command_uuid)
                        .cloned();
                    let data = characteristics.iter().find(|c| c.uuid() == data_uuid).cloned();
                    if let (Some(command), Some(data)) = (command, data) {
                        let mut cache = self.shared.chars.lock().unwrap();
                        cache.command = Some(command);
                        cache.data = Some(data);
                        return Ok(());
                    }
                    debug!(
                        device = %self.shared.device_id,
                        attempt, "characteristics missing from discovery result"
                    );
                }
                Err(err) => {
                    debug!(device = %self.shared.device_id, attempt, %err, "characteristic discovery failed");
                }
            }
            if attempt < attempts {
                sleep(self.shared.config.discovery_retry_delay).await;
                self.ensure_not_disposed()?;
            }
        }

        let err = ResourceError::CharacteristicsUnavailable {
            device_id: self.shared.device_id.clone(),
        };
        self.fail(&err.to_string());
        Err(err.into())
    }

    fn command_char(&self) -> Result<Arc<dyn Characteristic>, ResourceError> {
        self.shared
            .chars
            .lock()
            .unwrap()
            .command
            .clone()
            .ok_or_else(|| ResourceError::CharacteristicsUnavailable {
                device_id: self.shared.device_id.clone(),
            })
    }

    fn data_char(&self) -> Result<Arc<dyn Characteristic>, ResourceError> {
        self.shared
            .chars
            .lock()
            .unwrap()
            .data
            .clone()
            .ok_or_else(|| ResourceError::CharacteristicsUnavailable {
                device_id: self.shared.device_id.clone(),
            })
    }

    /// Write a command and wait (bounded) for its notification reply on the
    /// command characteristic. Replies echoing a different command byte are
    /// stale leftovers from an earlier exchange and are discarded.
    pub async fn transact(&self, command: DeviceCommand) -> Result<Vec<u8>, BridgeError> {
        self.ensure_not_disposed()?;
        let command_char = self.command_char()?;
        let _exchange = self.shared.transact_lock.lock().await;
        self.ensure_not_disposed()?;

        let mut replies = command_char.subscribe().await?;
        command_char.write(&command.encode(), true).await?;

        let expected = command.wire_opcode();
        let reply_timeout = self.shared.config.reply_timeout;
        let deadline = Instant::now() + reply_timeout;
        let frame = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, replies.recv()).await {
                Ok(Some(frame)) if frame.first() == Some(&expected) => break frame,
                Ok(Some(stale)) => {
                    debug!(
                        device = %self.shared.device_id,
                        opcode = stale.first().copied().unwrap_or(0),
                        "discarding stale reply"
                    );
                }
                Ok(None) => {
                    let _ = command_char.unsubscribe().await;
                    return Err(TransportError::Backend(
                        "reply channel closed".to_string(),
                    )
                    .into());
                }
                Err(_) => {
                    let _ = command_char.unsubscribe().await;
                    return Err(
                        TransportError::ReplyTimeout(reply_timeout.as_millis() as u64).into()
                    );
                }
            }
        };
        let _ = command_char.unsubscribe().await;
        self.ensure_not_disposed()?;
        Ok(frame)
    }

    async fn read_battery(&self) -> Result<u8, BridgeError> {
        let frame = self.transact(DeviceCommand::GetBattery).await?;
        let percent = protocol::decode_battery(&frame)?;
        self.emit(DeviceEventKind::BatteryUpdate, Some(percent.to_string()));
        Ok(percent)
    }

    /// Subscribe to data, reset sequence bookkeeping, and start the stream
    /// in timestamped quaternion mode. Battery polling is suspended while
    /// streaming to keep the radio free for 100 Hz data.
    pub async fn start_streaming(&self) -> Result<(), BridgeError> {
        self.ensure_not_disposed()?;
        if self.is_streaming() {
            return Ok(());
        }
        let data_char = self.data_char()?;
        let command_char = self.command_char()?;

        // Clear any stale notification pump from a previous run.
        if let Some(pump) = self.shared.tasks.lock().unwrap().pump.take() {
            pump.abort();
        }
        let _ = data_char.unsubscribe().await;
        self.ensure_not_disposed()?;

        let mut packets = data_char.subscribe().await?;
        self.ensure_not_disposed()?;
        *self.shared.last_sequence.lock().unwrap() = None;

        let session = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(bytes) = packets.recv().await {
                if session.is_disposed() {
                    break;
                }
                session.handle_packet(&bytes);
            }
        });
        self.shared.tasks.lock().unwrap().pump = Some(pump);

        command_char
            .write(
                &DeviceCommand::StartStream {
                    mode: protocol::stream_mode::QUATERNION_TIMESTAMPED,
                    frequency_hz: protocol::FREQ_100_HZ,
                }
                .encode(),
                true,
            )
            .await?;
        self.ensure_not_disposed()?;

        self.shared.streaming.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Streaming);
        self.emit(DeviceEventKind::StreamingStarted, None);
        Ok(())
    }

    pub async fn stop_streaming(&self) -> Result<(), BridgeError> {
        self.ensure_not_disposed()?;
        if !self.is_streaming() {
            return Ok(());
        }
        let command_char = self.command_char()?;
        let data_char = self.data_char()?;

        command_char
            .write(&DeviceCommand::StopStream.encode(), true)
            .await?;
        let _ = data_char.unsubscribe().await;
        self.ensure_not_disposed()?;

        if let Some(pump) = self.shared.tasks.lock().unwrap().pump.take() {
            pump.abort();
        }
        self.shared.streaming.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Connected);
        self.emit(DeviceEventKind::StreamingStopped, None);
        Ok(())
    }

    /// Decode one streaming packet and forward it to the host. Unparseable
    /// packets are logged and dropped, never delivered.
    fn handle_packet(&self, bytes: &[u8]) {
        let packet = match protocol::parse_motion_packet(bytes, true) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(device = %self.shared.device_id, %err, len = bytes.len(), "dropping packet");
                return;
            }
        };

        {
            let mut last = self.shared.last_sequence.lock().unwrap();
            if let Some(previous) = *last {
                let expected = previous.wrapping_add(1);
                if packet.sequence != expected {
                    trace!(
                        device = %self.shared.device_id,
                        expected, got = packet.sequence, "sequence gap"
                    );
                }
            }
            *last = Some(packet.sequence);
        }

        let device_clock_ms = packet.device_clock.unwrap_or_default() as i64;
        // Hardware-synced devices already stream corrected timestamps; the
        // software offset applies only while the estimate lives host-side.
        let timestamp_ms = match self.sync_state() {
            SyncState::OffsetComputed => device_clock_ms + self.clock_offset_ms().unwrap_or(0),
            _ => device_clock_ms,
        };

        let _ = self.shared.events.send(BridgeEvent::Motion {
            device_id: self.shared.device_id.clone(),
            sample: MotionSample {
                timestamp_ms,
                quaternion: packet.quaternion,
            },
        });
    }

    /// User-initiated teardown.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.ensure_not_disposed()?;
        self.shared.user_disconnect.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Disconnecting);

        if self.is_streaming() {
            // The link may already be half-down; stopping is best-effort.
            if let Err(err) = self.stop_streaming().await {
                debug!(device = %self.shared.device_id, %err, "stop before disconnect failed");
            }
            self.set_state(SessionState::Disconnecting);
        }

        let result = self.shared.peripheral.disconnect().await;
        self.cleanup(true);
        self.set_state(SessionState::Disconnected);
        self.emit(DeviceEventKind::Disconnected, None);
        result.map_err(Into::into)
    }

    /// Stop timers and the pump; drop cached characteristics only when the
    /// link is really down, so soft errors don't force re-discovery.
    fn cleanup(&self, link_down: bool) {
        {
            let mut tasks = self.shared.tasks.lock().unwrap();
            if let Some(task) = tasks.battery.take() {
                task.abort();
            }
            if let Some(task) = tasks.pump.take() {
                task.abort();
            }
        }
        self.shared.streaming.store(false, Ordering::SeqCst);
        if link_down {
            let mut cache = self.shared.chars.lock().unwrap();
            cache.command = None;
            cache.data = None;
        }
    }

    /// Terminal. Idempotent. Pending async operations observe the flag at
    /// their next suspension point and abort with a disposed error.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(device = %self.shared.device_id, "disposing session");
        self.cleanup(true);
        if let Some(task) = self.shared.tasks.lock().unwrap().link_watch.take() {
            task.abort();
        }
        self.set_state(SessionState::Disposed);
    }

    fn spawn_link_watch(&self) {
        let mut disconnects = self.shared.peripheral.subscribe_disconnects();
        let session = self.clone();
        let watch = tokio::spawn(async move {
            loop {
                match disconnects.recv().await {
                    Ok(()) => {
                        if session.is_disposed() {
                            break;
                        }
                        if session.shared.user_disconnect.load(Ordering::SeqCst) {
                            // Requested teardown; nothing further to do.
                            break;
                        }
                        warn!(device = %session.shared.device_id, "unexpected disconnect");
                        session.cleanup(true);
                        session.set_state(SessionState::Disconnected);
                        session.emit(DeviceEventKind::Disconnected, None);
                        session.emit(DeviceEventKind::AutoReconnect, None);
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.shared.tasks.lock().unwrap().link_watch = Some(watch);
    }

    fn spawn_battery_polling(&self) {
        let session = self.clone();
        let interval = self.shared.config.battery_poll_interval;
        let poll = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if session.is_disposed() {
                    break;
                }
                // Suspended while streaming; 100 Hz data owns the radio.
                if session.is_streaming() {
                    continue;
                }
                match session.read_battery().await {
                    Ok(_) => {}
                    Err(err) if err.is_disposed() => break,
                    Err(err) => {
                        warn!(device = %session.shared.device_id, %err, "battery poll failed");
                    }
                }
            }
        });
        self.shared.tasks.lock().unwrap().battery = Some(poll);
    }

    // Sync-state bookkeeping, driven by the time-sync engine.

    pub fn mark_rtc_initialized(&self) {
        let mut sync = self.shared.sync.lock().unwrap();
        if sync.state == SyncState::Unsynced {
            sync.state = SyncState::RtcInitialized;
        }
    }

    /// Store a host-side offset estimate. No-op for a fully-synced session:
    /// its hardware register already corrects the stream, and re-applying
    /// on reconnect must not double-correct.
    pub fn apply_clock_offset(&self, offset_ms: i64) {
        let mut sync = self.shared.sync.lock().unwrap();
        if sync.state == SyncState::FullySynced {
            debug!(device = %self.shared.device_id, "already fully synced, ignoring software offset");
            return;
        }
        sync.offset_ms = Some(offset_ms);
        sync.state = SyncState::OffsetComputed;
    }

    pub fn mark_fully_synced(&self) {
        let mut sync = self.shared.sync.lock().unwrap();
        sync.state = SyncState::FullySynced;
    }
}

/// At most one non-disposed session per device address. Inserting a
/// replacement retires the old handle first.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<String, DeviceSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: DeviceSession) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(old) = sessions.remove(session.device_id()) {
            debug!(device = %old.device_id(), "retiring superseded session");
            old.dispose();
        }
        sessions.insert(session.device_id().to_string(), session);
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.lock().unwrap().get(device_id).cloned()
    }

    /// Remove and dispose.
    pub fn retire(&self, device_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().remove(device_id) {
            session.dispose();
        }
    }

    pub fn active(&self) -> Vec<DeviceSession> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.is_disposed())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{
        FirmwareScript, MockAdapter, MockDeviceSpec,
    };
    use crate::infrastructure::bluetooth::transport::Adapter;
    use tokio::sync::mpsc;

    fn quick_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(500),
            discovery_attempts: 3,
            discovery_retry_delay: Duration::from_millis(10),
            battery_poll_interval: Duration::from_secs(60),
            reply_timeout: Duration::from_millis(200),
        }
    }

    async fn session_for(
        adapter: &MockAdapter,
        address: &str,
    ) -> (DeviceSession, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peripheral = adapter.peripheral(address).await.unwrap();
        (DeviceSession::new(peripheral, quick_config(), tx), rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn connect_reads_battery_then_reports_connected() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let (session, mut rx) = session_for(&adapter, "AA:01").await;

        let outcome = session.connect().await.unwrap();
        assert_eq!(outcome.battery, Some(87));
        assert_eq!(session.state(), SessionState::Connected);

        let events = drain_events(&mut rx);
        let connected = events
            .iter()
            .find_map(|e| match e {
                BridgeEvent::Device {
                    kind: DeviceEventKind::Connected,
                    detail,
                    ..
                } => Some(detail.clone()),
                _ => None,
            })
            .expect("connected event");
        assert_eq!(connected.as_deref(), Some("battery=87"));
    }

    #[tokio::test]
    async fn empty_service_discovery_is_retried_once() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let mut spec = MockDeviceSpec::sensor("AA:01", "SensorA", -60, responder);
        spec.empty_service_discoveries = 1;
        let adapter = MockAdapter::new(vec![spec]);
        let (session, _rx) = session_for(&adapter, "AA:01").await;

        assert!(session.connect().await.is_ok());
    }

    #[tokio::test]
    async fn characteristic_discovery_retries_with_backoff() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let mut spec = MockDeviceSpec::sensor("AA:01", "SensorA", -60, responder);
        spec.characteristic_discovery_failures = 2;
        let adapter = MockAdapter::new(vec![spec]);
        let (session, _rx) = session_for(&adapter, "AA:01").await;

        assert!(session.connect().await.is_ok());
    }

    #[tokio::test]
    async fn characteristic_discovery_gives_up_after_bounded_attempts() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let mut spec = MockDeviceSpec::sensor("AA:01", "SensorA", -60, responder);
        spec.characteristic_discovery_failures = 10;
        let adapter = MockAdapter::new(vec![spec]);
        let (session, _rx) = session_for(&adapter, "AA:01").await;

        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Resource(ResourceError::CharacteristicsUnavailable { .. })
        ));
        // The link came up before discovery failed; a terminal failure must
        // give it back instead of squatting on the radio.
        assert!(!adapter.device_handle("AA:01").unwrap().is_connected());
        assert!(session.is_disposed());
        assert_eq!(session.state(), SessionState::Disposed);
    }

    #[tokio::test]
    async fn disposed_session_rejects_operations() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let (session, _rx) = session_for(&adapter, "AA:01").await;

        session.dispose();
        session.dispose(); // idempotent
        assert!(session.connect().await.unwrap_err().is_disposed());
        assert!(session.start_streaming().await.unwrap_err().is_disposed());
        assert_eq!(session.state(), SessionState::Disposed);
    }

    #[tokio::test]
    async fn disposal_mid_connect_aborts_without_touching_state() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let mut spec = MockDeviceSpec::sensor("AA:01", "SensorA", -60, responder);
        spec.connect_delay = Duration::from_millis(50);
        let adapter = MockAdapter::new(vec![spec]);
        let (session, _rx) = session_for(&adapter, "AA:01").await;

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.dispose();

        let result = connecting.await.unwrap();
        assert!(result.unwrap_err().is_disposed());
        assert_eq!(session.state(), SessionState::Disposed);
        assert!(!adapter.device_handle("AA:01").unwrap().is_connected());
    }

    #[tokio::test]
    async fn unexpected_disconnect_emits_auto_reconnect() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let (session, mut rx) = session_for(&adapter, "AA:01").await;
        session.connect().await.unwrap();
        drain_events(&mut rx);

        adapter.device_handle("AA:01").unwrap().drop_link();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BridgeEvent::Device {
                kind: DeviceEventKind::AutoReconnect,
                ..
            }
        )));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn user_disconnect_does_not_trigger_auto_reconnect() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let (session, mut rx) = session_for(&adapter, "AA:01").await;
        session.connect().await.unwrap();
        drain_events(&mut rx);

        session.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain_events(&mut rx);
        assert!(!events.iter().any(|e| matches!(
            e,
            BridgeEvent::Device {
                kind: DeviceEventKind::AutoReconnect,
                ..
            }
        )));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn streaming_delivers_parsed_packets_and_drops_garbage() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let (session, mut rx) = session_for(&adapter, "AA:01").await;
        session.connect().await.unwrap();
        session.apply_clock_offset(1000);
        session.start_streaming().await.unwrap();
        assert!(session.is_streaming());
        drain_events(&mut rx);

        let handle = adapter.device_handle("AA:01").unwrap();
        let data_uuid = normalize_uuid(protocol::DATA_CHAR_UUID).unwrap();
        handle.notify(
            data_uuid,
            protocol::encode_motion_packet(7, 16384, 0, 0, Some(500)),
        );
        handle.notify(data_uuid, vec![0xFF, 0x00]); // garbage, dropped
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain_events(&mut rx);
        let samples: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Motion { sample, .. } => Some(*sample),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 1);
        // Software offset applied: 500 + 1000.
        assert_eq!(samples[0].timestamp_ms, 1500);
    }

    #[tokio::test]
    async fn fully_synced_session_is_not_double_corrected() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let (session, _rx) = session_for(&adapter, "AA:01").await;
        session.apply_clock_offset(1000);
        session.mark_fully_synced();
        // Re-applying on reconnect must be a no-op now.
        session.apply_clock_offset(2500);
        assert_eq!(session.sync_state(), SyncState::FullySynced);
        assert_eq!(session.clock_offset_ms(), Some(1000));
    }

    #[tokio::test]
    async fn registry_retires_superseded_instance() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let registry = SessionRegistry::new();
        let (first, _rx1) = session_for(&adapter, "AA:01").await;
        let (second, _rx2) = session_for(&adapter, "AA:01").await;

        registry.insert(first.clone());
        registry.insert(second.clone());

        assert!(first.is_disposed());
        assert!(!second.is_disposed());
        assert_eq!(registry.active().len(), 1);
    }
}
