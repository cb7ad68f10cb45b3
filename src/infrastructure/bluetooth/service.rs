//! Bridge Service
//!
//! The host-facing entry point. Owns the adapter, the session registry and
//! the connection orchestrator, drives time-boxed discovery, and fans all
//! device activity out on a single typed event channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::orchestrator::{ConnectionOrchestrator, Connector, RadioState};
use super::session::{DeviceSession, SessionConfig, SessionRegistry};
use super::timesync::{self, ClockOffsetEstimate, TimeSyncConfig};
use super::transport::{Adapter, DiscoveryFilter};
use crate::domain::models::{BridgeEvent, ConnectOutcome, DeviceEventKind, IdentityRegistry};
use crate::domain::settings::BridgeSettings;
use crate::error::{BridgeError, ConcurrencyError, ResourceError};

type SharedIdentity = Arc<StdMutex<Option<Arc<dyn IdentityRegistry>>>>;

struct ScanControl {
    active: AtomicBool,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl ScanControl {
    /// Flip scanning off; true when this call did the flip.
    fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            if let Some(timer) = self.timer.lock().unwrap().take() {
                timer.abort();
            }
        }
        was_active
    }
}

pub struct BridgeService {
    adapter: Arc<dyn Adapter>,
    settings: BridgeSettings,
    events: UnboundedSender<BridgeEvent>,
    sessions: Arc<SessionRegistry>,
    orchestrator: ConnectionOrchestrator,
    identity: SharedIdentity,
    scan: Arc<ScanControl>,
}

impl BridgeService {
    /// Build the service and hand back the host's event receiver.
    pub fn new(
        adapter: Arc<dyn Adapter>,
        settings: BridgeSettings,
    ) -> (Self, UnboundedReceiver<BridgeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionRegistry::new());
        let identity: SharedIdentity = Arc::new(StdMutex::new(None));
        let scan = Arc::new(ScanControl {
            active: AtomicBool::new(false),
            timer: StdMutex::new(None),
        });

        let connector = Self::build_connector(
            Arc::clone(&adapter),
            Arc::clone(&sessions),
            events_tx.clone(),
            SessionConfig::from_settings(&settings.connection),
            Arc::clone(&identity),
            Arc::clone(&scan),
        );
        let orchestrator = ConnectionOrchestrator::new(
            connector,
            Duration::from_millis(settings.connection.settle_delay_ms),
        );

        (
            Self {
                adapter,
                settings,
                events: events_tx,
                sessions,
                orchestrator,
                identity,
                scan,
            },
            events_rx,
        )
    }

    /// The connect procedure the orchestrator drains one request at a time:
    /// stop any running scan, stand up a fresh session (retiring a stale
    /// one for the same address), connect, and attach the semantic identity.
    fn build_connector(
        adapter: Arc<dyn Adapter>,
        sessions: Arc<SessionRegistry>,
        events: UnboundedSender<BridgeEvent>,
        session_config: SessionConfig,
        identity: SharedIdentity,
        scan: Arc<ScanControl>,
    ) -> Connector {
        Arc::new(move |device_id: String| {
            let adapter = Arc::clone(&adapter);
            let sessions = Arc::clone(&sessions);
            let events = events.clone();
            let session_config = session_config.clone();
            let identity = Arc::clone(&identity);
            let scan = Arc::clone(&scan);
            Box::pin(async move {
                if scan.deactivate() {
                    debug!("stopping scan before connection attempt");
                    let _ = adapter.stop_scan().await;
                }

                let peripheral = adapter.peripheral(&device_id).await?;
                let session = DeviceSession::new(peripheral, session_config, events);
                sessions.insert(session.clone());
                let mut outcome = match session.connect().await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        // connect() has already released the link; drop the
                        // dead handle so the registry only holds live sessions.
                        sessions.retire(&device_id);
                        return Err(err);
                    }
                };

                let registry = identity.lock().unwrap().clone();
                if let (Some(registry), Some(name)) = (registry, outcome.name.as_deref()) {
                    outcome.identity = registry.assign_identity(name);
                }
                Ok(outcome)
            })
        })
    }

    pub fn set_identity_registry(&self, registry: Arc<dyn IdentityRegistry>) {
        *self.identity.lock().unwrap() = Some(registry);
    }

    pub fn radio_state(&self) -> RadioState {
        self.orchestrator.radio_state()
    }

    /// Begin time-boxed discovery. Rejected while the radio is scanning or
    /// connecting. Matching devices surface as `Discovered` events, each at
    /// most once per scan.
    pub async fn start_scan(&self) -> Result<(), BridgeError> {
        if self.orchestrator.radio_state() != RadioState::Idle {
            return Err(ConcurrencyError::RadioBusy.into());
        }

        self.adapter.initialize().await?;
        let filter = DiscoveryFilter {
            name_contains: self.settings.scan.name_filters.clone(),
            min_rssi: Some(self.settings.scan.min_rssi),
        };
        self.adapter.start_scan(filter).await?;
        self.orchestrator.set_radio_state(RadioState::Scanning);
        self.scan.active.store(true, Ordering::SeqCst);
        info!(timeout_secs = self.settings.scan.scan_timeout_secs, "scan started");

        let adapter = Arc::clone(&self.adapter);
        let events = self.events.clone();
        let scan = Arc::clone(&self.scan);
        let orchestrator = self.orchestrator.clone();
        let timeout = Duration::from_secs(self.settings.scan.scan_timeout_secs);
        let watcher = tokio::spawn(async move {
            let deadline = Instant::now() + timeout;
            let mut seen: HashSet<String> = HashSet::new();
            while Instant::now() < deadline {
                if !scan.active.load(Ordering::SeqCst) {
                    return;
                }
                match adapter.discovered_devices().await {
                    Ok(devices) => {
                        for device in devices {
                            if seen.insert(device.id.clone()) {
                                let _ = events.send(BridgeEvent::Device {
                                    device_id: device.id.clone(),
                                    kind: DeviceEventKind::Discovered,
                                    detail: Some(format!(
                                        "name={} rssi={}",
                                        device.name.as_deref().unwrap_or("?"),
                                        device
                                            .rssi
                                            .map(|r| r.to_string())
                                            .unwrap_or_else(|| "?".into()),
                                    )),
                                });
                            }
                        }
                    }
                    Err(err) => warn!(%err, "discovery poll failed"),
                }
                sleep(Duration::from_millis(200)).await;
            }
            if scan.active.swap(false, Ordering::SeqCst) {
                debug!("scan window elapsed");
                let _ = adapter.stop_scan().await;
                if orchestrator.radio_state() == RadioState::Scanning {
                    orchestrator.set_radio_state(RadioState::Idle);
                }
            }
        });
        *self.scan.timer.lock().unwrap() = Some(watcher);
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<(), BridgeError> {
        if self.scan.deactivate() {
            self.adapter.stop_scan().await?;
            if self.orchestrator.radio_state() == RadioState::Scanning {
                self.orchestrator.set_radio_state(RadioState::Idle);
            }
        }
        Ok(())
    }

    /// Queue a connection; resolves when the orchestrator has processed it.
    pub async fn connect(&self, device_id: &str) -> Result<ConnectOutcome, BridgeError> {
        self.orchestrator.enqueue(device_id).await
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<(), BridgeError> {
        let session = self
            .sessions
            .get(device_id)
            .ok_or_else(|| ResourceError::DeviceNotFound(device_id.to_string()))?;
        let result = session.disconnect().await;
        self.sessions.retire(device_id);
        result
    }

    pub fn session(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.get(device_id)
    }

    pub fn active_sessions(&self) -> Vec<DeviceSession> {
        self.sessions.active()
    }

    pub async fn start_streaming(&self, device_id: &str) -> Result<(), BridgeError> {
        let session = self
            .sessions
            .get(device_id)
            .ok_or_else(|| ResourceError::DeviceNotFound(device_id.to_string()))?;
        session.start_streaming().await
    }

    pub async fn stop_streaming(&self, device_id: &str) -> Result<(), BridgeError> {
        let session = self
            .sessions
            .get(device_id)
            .ok_or_else(|| ResourceError::DeviceNotFound(device_id.to_string()))?;
        session.stop_streaming().await
    }

    /// Synchronize one device against the host clock.
    pub async fn sync_device(&self, device_id: &str) -> Result<ClockOffsetEstimate, BridgeError> {
        let session = self
            .sessions
            .get(device_id)
            .ok_or_else(|| ResourceError::DeviceNotFound(device_id.to_string()))?;
        timesync::synchronize(
            &session,
            reference_unix_secs(),
            &TimeSyncConfig::from_settings(&self.settings.sync),
        )
        .await
    }

    /// Synchronize every active session against one shared reference
    /// instant so fleet timestamps are mutually comparable. Devices are
    /// processed sequentially; a failure on one does not stop the rest.
    pub async fn sync_fleet(&self) -> Vec<(String, Result<ClockOffsetEstimate, BridgeError>)> {
        let reference = reference_unix_secs();
        let config = TimeSyncConfig::from_settings(&self.settings.sync);
        let mut results = Vec::new();
        for session in self.sessions.active() {
            let device_id = session.device_id().to_string();
            let result = timesync::synchronize(&session, reference, &config).await;
            results.push((device_id, result));
        }
        results
    }

    /// Retire any session for the address and purge the OS-level pairing
    /// record; the standard remedy for repeated reconnection failures.
    pub async fn clear_device_cache(&self, address: &str) -> Result<(), BridgeError> {
        self.sessions.retire(address);
        self.adapter.clear_device_cache(address).await?;
        Ok(())
    }
}

fn reference_unix_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceIdentity;
    use crate::infrastructure::bluetooth::mock::{FirmwareScript, MockAdapter, MockDeviceSpec};

    fn quick_settings() -> BridgeSettings {
        let mut settings = BridgeSettings::default();
        settings.scan.scan_timeout_secs = 1;
        settings.connection.connect_timeout_secs = 1;
        settings.connection.discovery_retry_delay_ms = 10;
        settings.connection.settle_delay_ms = 0;
        settings.connection.reply_timeout_ms = 200;
        settings
    }

    fn fleet_adapter() -> MockAdapter {
        let (responder_a, _) = FirmwareScript::default().into_responder();
        let (responder_b, _) = FirmwareScript::default().into_responder();
        let (responder_c, _) = FirmwareScript::default().into_responder();
        MockAdapter::new(vec![
            MockDeviceSpec::sensor("AA:01", "SensorA", -60, responder_a),
            MockDeviceSpec::sensor("AA:02", "SensorB", -90, responder_b),
            MockDeviceSpec::sensor("AA:03", "Toothbrush", -40, responder_c),
        ])
    }

    #[tokio::test]
    async fn scan_surfaces_matching_devices_once() {
        let (service, mut rx) = BridgeService::new(Arc::new(fleet_adapter()), quick_settings());
        service.start_scan().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        service.stop_scan().await.unwrap();

        let mut discovered = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BridgeEvent::Device {
                device_id,
                kind: DeviceEventKind::Discovered,
                ..
            } = event
            {
                discovered.push(device_id);
            }
        }
        // SensorB is below the RSSI floor and Toothbrush fails the name
        // filter; SensorA appears exactly once despite repeated polls.
        assert_eq!(discovered, vec!["AA:01".to_string()]);
        assert_eq!(service.radio_state(), RadioState::Idle);
    }

    #[tokio::test]
    async fn scanning_radio_rejects_a_second_scan() {
        let (service, _rx) = BridgeService::new(Arc::new(fleet_adapter()), quick_settings());
        service.start_scan().await.unwrap();
        let err = service.start_scan().await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Concurrency(ConcurrencyError::RadioBusy)
        ));
        service.stop_scan().await.unwrap();
    }

    #[tokio::test]
    async fn connect_registers_a_session_and_reports_battery() {
        let (service, _rx) = BridgeService::new(Arc::new(fleet_adapter()), quick_settings());
        let outcome = service.connect("AA:01").await.unwrap();
        assert_eq!(outcome.battery, Some(87));

        let session = service.session("AA:01").expect("registered session");
        assert_eq!(
            session.state(),
            crate::domain::models::SessionState::Connected
        );

        service.disconnect("AA:01").await.unwrap();
        assert!(service.session("AA:01").is_none());
    }

    #[tokio::test]
    async fn failed_connect_releases_the_link_and_the_registry_slot() {
        let (responder, _) = FirmwareScript::default().into_responder();
        let mut spec = MockDeviceSpec::sensor("AA:01", "SensorA", -60, responder);
        spec.characteristic_discovery_failures = 100;
        let adapter = Arc::new(MockAdapter::new(vec![spec]));
        let (service, _rx) =
            BridgeService::new(Arc::clone(&adapter) as Arc<dyn Adapter>, quick_settings());

        let err = service.connect("AA:01").await.unwrap_err();
        assert!(matches!(err, BridgeError::Resource(_)));

        // The device must be free for rediscovery and the registry must not
        // hold a dead handle.
        assert!(!adapter.device_handle("AA:01").unwrap().is_connected());
        assert!(service.session("AA:01").is_none());
    }

    #[tokio::test]
    async fn identity_registry_is_consulted_after_connect() {
        struct Fixture;
        impl IdentityRegistry for Fixture {
            fn assign_identity(&self, device_name: &str) -> Option<DeviceIdentity> {
                (device_name == "SensorA").then(|| DeviceIdentity {
                    semantic_id: "trunk-1".into(),
                    joint: "spine".into(),
                    position: "upper".into(),
                })
            }
        }

        let (service, _rx) = BridgeService::new(Arc::new(fleet_adapter()), quick_settings());
        service.set_identity_registry(Arc::new(Fixture));
        let outcome = service.connect("AA:01").await.unwrap();
        assert_eq!(
            outcome.identity.map(|i| i.semantic_id),
            Some("trunk-1".to_string())
        );
    }

    #[tokio::test]
    async fn fleet_sync_covers_every_active_session() {
        let (service, _rx) = BridgeService::new(Arc::new(fleet_adapter()), quick_settings());
        service.connect("AA:01").await.unwrap();
        service.connect("AA:02").await.unwrap();

        let results = service.sync_fleet().await;
        assert_eq!(results.len(), 2);
        for (device_id, result) in results {
            let estimate = result.unwrap_or_else(|e| panic!("{device_id}: {e}"));
            assert!(
                (4_950..=5_050).contains(&estimate.offset_ms),
                "{device_id}: offset {}",
                estimate.offset_ms
            );
        }
    }

    #[tokio::test]
    async fn clear_cache_retires_session_and_forgets_device() {
        let adapter = Arc::new(fleet_adapter());
        let (service, _rx) = BridgeService::new(Arc::clone(&adapter) as Arc<dyn Adapter>, quick_settings());
        service.connect("AA:01").await.unwrap();

        service.clear_device_cache("AA:01").await.unwrap();
        assert!(service.session("AA:01").is_none());
        assert!(adapter.peripheral("AA:01").await.is_err());
    }
}
