//! Full-stack scenarios against the scripted in-process backend: discovery
//! filtering, fleet streaming, clock sync, session supersede, and queue
//! serialization, all through the public `BridgeService` API.

use std::sync::Arc;
use std::time::Duration;

use motionlink::domain::models::{BridgeEvent, DeviceEventKind, SessionState, SyncState};
use motionlink::domain::settings::BridgeSettings;
use motionlink::error::{BridgeError, ConcurrencyError};
use motionlink::infrastructure::bluetooth::mock::{FirmwareScript, MockAdapter, MockDeviceSpec};
use motionlink::infrastructure::bluetooth::protocol;
use motionlink::infrastructure::bluetooth::transport::normalize_uuid;
use motionlink::infrastructure::bluetooth::BridgeService;
use tokio::sync::mpsc::UnboundedReceiver;

fn quick_settings() -> BridgeSettings {
    let mut settings = BridgeSettings::default();
    settings.scan.scan_timeout_secs = 1;
    settings.connection.connect_timeout_secs = 1;
    settings.connection.discovery_retry_delay_ms = 10;
    settings.connection.settle_delay_ms = 0;
    settings.connection.reply_timeout_ms = 200;
    settings
}

fn sensor(address: &str, name: &str, rssi: i16) -> MockDeviceSpec {
    let (responder, _) = FirmwareScript::default().into_responder();
    MockDeviceSpec::sensor(address, name, rssi, responder)
}

fn drain(rx: &mut UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn motion_count(events: &[BridgeEvent], device_id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, BridgeEvent::Motion { device_id: id, .. } if id == device_id))
        .count()
}

#[tokio::test]
async fn discovery_filters_then_connect_reports_battery() {
    let adapter = Arc::new(MockAdapter::new(vec![
        sensor("AA:01", "SensorA", -60),
        sensor("AA:02", "SensorB", -90),
        sensor("AA:03", "Toothbrush", -40),
    ]));
    let (service, mut events) =
        BridgeService::new(Arc::clone(&adapter) as _, quick_settings());

    service.start_scan().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    service.stop_scan().await.unwrap();

    let discovered: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            BridgeEvent::Device {
                device_id,
                kind: DeviceEventKind::Discovered,
                ..
            } => Some(device_id),
            _ => None,
        })
        .collect();
    // SensorB sits below the -80 dBm floor, Toothbrush fails the name
    // filter despite its strong signal.
    assert_eq!(discovered, vec!["AA:01".to_string()]);

    let outcome = service.connect("AA:01").await.unwrap();
    assert_eq!(outcome.name.as_deref(), Some("SensorA"));
    assert_eq!(outcome.battery, Some(87));

    let connected_details: Vec<Option<String>> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            BridgeEvent::Device {
                kind: DeviceEventKind::Connected,
                detail,
                ..
            } => Some(detail),
            _ => None,
        })
        .collect();
    assert_eq!(connected_details, vec![Some("battery=87".to_string())]);
}

#[tokio::test]
async fn two_streams_are_independent() {
    let adapter = Arc::new(MockAdapter::new(vec![
        sensor("AA:01", "SensorA", -60),
        sensor("AA:02", "SensorB", -65),
    ]));
    let (service, mut events) =
        BridgeService::new(Arc::clone(&adapter) as _, quick_settings());

    service.connect("AA:01").await.unwrap();
    service.connect("AA:02").await.unwrap();
    service.start_streaming("AA:01").await.unwrap();
    service.start_streaming("AA:02").await.unwrap();
    drain(&mut events);

    let data_uuid = normalize_uuid(protocol::DATA_CHAR_UUID).unwrap();
    let handle_a = adapter.device_handle("AA:01").unwrap();
    let handle_b = adapter.device_handle("AA:02").unwrap();
    for seq in 0..3u16 {
        handle_a.notify(
            data_uuid,
            protocol::encode_motion_packet(seq, 8192, 0, 0, Some(1000 + seq as u64 * 10)),
        );
        handle_b.notify(
            data_uuid,
            protocol::encode_motion_packet(seq, 0, 8192, 0, Some(2000 + seq as u64 * 10)),
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let delivered = drain(&mut events);
    assert_eq!(motion_count(&delivered, "AA:01"), 3);
    assert_eq!(motion_count(&delivered, "AA:02"), 3);

    // Stopping one stream must not disturb the other.
    service.stop_streaming("AA:01").await.unwrap();
    drain(&mut events);
    handle_a.notify(data_uuid, protocol::encode_motion_packet(10, 8192, 0, 0, Some(1100)));
    handle_b.notify(data_uuid, protocol::encode_motion_packet(10, 0, 8192, 0, Some(2100)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after_stop = drain(&mut events);
    assert_eq!(motion_count(&after_stop, "AA:01"), 0);
    assert_eq!(motion_count(&after_stop, "AA:02"), 1);
    assert_eq!(
        service.session("AA:01").unwrap().state(),
        SessionState::Connected
    );
    assert_eq!(
        service.session("AA:02").unwrap().state(),
        SessionState::Streaming
    );
}

#[tokio::test]
async fn fleet_sync_estimates_each_skew() {
    let (responder_a, log_a) = FirmwareScript::default().into_responder();
    let (responder_b, log_b) = FirmwareScript {
        clock_skew_ms: -1500,
        ..FirmwareScript::default()
    }
    .into_responder();
    let adapter = Arc::new(MockAdapter::new(vec![
        MockDeviceSpec::sensor("AA:01", "SensorA", -60, responder_a),
        MockDeviceSpec::sensor("AA:02", "SensorB", -65, responder_b),
    ]));
    let (service, _events) =
        BridgeService::new(Arc::clone(&adapter) as _, quick_settings());

    service.connect("AA:01").await.unwrap();
    service.connect("AA:02").await.unwrap();

    let results = service.sync_fleet().await;
    assert_eq!(results.len(), 2);
    for (device_id, result) in results {
        let estimate = result.unwrap_or_else(|e| panic!("{device_id}: {e}"));
        let expected = if device_id == "AA:01" { 5000 } else { -1500 };
        assert!(
            (estimate.offset_ms - expected).abs() <= 50,
            "{device_id}: offset {} vs expected {expected}",
            estimate.offset_ms
        );
        assert!(estimate.avg_rtt_ms >= 0.0);
        assert_eq!(
            service.session(&device_id).unwrap().sync_state(),
            SyncState::FullySynced
        );
    }

    // Both RTCs were written and both firmwares left sync mode.
    assert!(log_a.rtc_unix_secs.lock().unwrap().is_some());
    assert!(log_b.rtc_unix_secs.lock().unwrap().is_some());
    assert!(!log_a.in_sync_mode.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!log_b.in_sync_mode.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn reconnect_supersedes_the_previous_session() {
    let adapter = Arc::new(MockAdapter::new(vec![sensor("AA:01", "SensorA", -60)]));
    let (service, _events) =
        BridgeService::new(Arc::clone(&adapter) as _, quick_settings());

    service.connect("AA:01").await.unwrap();
    let first = service.session("AA:01").unwrap();

    service.connect("AA:01").await.unwrap();
    let second = service.session("AA:01").unwrap();

    assert!(first.is_disposed());
    assert!(!second.is_disposed());
    assert_eq!(second.state(), SessionState::Connected);
    // The retired handle refuses further work instead of corrupting the
    // replacement's link.
    assert!(first.start_streaming().await.unwrap_err().is_disposed());
}

#[tokio::test]
async fn concurrent_connect_requests_queue_and_duplicates_bounce() {
    let mut slow = sensor("AA:01", "SensorA", -60);
    slow.connect_delay = Duration::from_millis(50);
    let adapter = Arc::new(MockAdapter::new(vec![slow, sensor("AA:02", "SensorB", -65)]));
    let (service, _events) =
        BridgeService::new(Arc::clone(&adapter) as _, quick_settings());
    let service = Arc::new(service);

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.connect("AA:01").await })
    };
    let second = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.connect("AA:02").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // A duplicate for a queued or in-flight device is rejected immediately.
    let duplicate = service.connect("AA:01").await;
    assert!(matches!(
        duplicate,
        Err(BridgeError::Concurrency(
            ConcurrencyError::ConnectInProgress { .. }
        ))
    ));

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(
        service.session("AA:01").unwrap().state(),
        SessionState::Connected
    );
    assert_eq!(
        service.session("AA:02").unwrap().state(),
        SessionState::Connected
    );
}

#[tokio::test]
async fn dropped_link_suspends_the_session_until_reconnect() {
    let adapter = Arc::new(MockAdapter::new(vec![sensor("AA:01", "SensorA", -60)]));
    let (service, mut events) =
        BridgeService::new(Arc::clone(&adapter) as _, quick_settings());

    service.connect("AA:01").await.unwrap();
    service.start_streaming("AA:01").await.unwrap();
    drain(&mut events);

    adapter.device_handle("AA:01").unwrap().drop_link();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after_drop = drain(&mut events);
    assert!(after_drop.iter().any(|e| matches!(
        e,
        BridgeEvent::Device {
            kind: DeviceEventKind::AutoReconnect,
            ..
        }
    )));
    let session = service.session("AA:01").unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_streaming());

    // A fresh connect through the queue brings the device back.
    let outcome = service.connect("AA:01").await.unwrap();
    assert_eq!(outcome.battery, Some(87));
    assert_eq!(
        service.session("AA:01").unwrap().state(),
        SessionState::Connected
    );
}
