//! Time Sync Engine
//!
//! Aligns a device's internal counter with the host clock over the command
//! channel. Each round-trip yields a candidate offset from the midpoint of
//! the host send/receive instants; the median over N rounds discards the
//! occasional BLE retransmission spike that would wreck a mean.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::protocol::{self, DeviceCommand};
use super::session::DeviceSession;
use crate::domain::settings::SyncSettings;
use crate::error::{BridgeError, ProtocolError, SyncError};

/// Counters at or above this are microseconds since the epoch; below it
/// they can only be milliseconds. Some firmware revisions report the small
/// counter and need the offset register written in the same unit.
const MS_COUNTER_THRESHOLD: u64 = 100_000_000_000_000;

#[derive(Debug, Clone)]
pub struct TimeSyncConfig {
    /// Round-trips per sync run.
    pub samples: usize,
}

impl TimeSyncConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            samples: settings.samples,
        }
    }
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

/// One completed round-trip.
#[derive(Debug, Clone, Copy)]
struct SyncSample {
    /// Host clock just before the request, microseconds since the epoch.
    sent_us: i64,
    /// Host clock just after the reply.
    received_us: i64,
    /// Raw device counter from the reply.
    counter: u64,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy)]
pub struct ClockOffsetEstimate {
    /// Host minus device, milliseconds. Positive means the device clock
    /// runs behind the host.
    pub offset_ms: i64,
    /// Mean round-trip time, for diagnostics.
    pub avg_rtt_ms: f64,
    pub samples: usize,
    /// Whether the firmware reports its counter in milliseconds.
    pub millisecond_firmware: bool,
    /// True when the device acknowledged the register write; false when the
    /// firmware lacks the register and the offset is applied host-side.
    pub hardware_offset: bool,
}

fn host_now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn median(values: &mut [i64]) -> i64 {
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2
    } else {
        values[mid]
    }
}

/// Run a full sync against one session: write the RTC to the shared
/// reference instant, enter sync mode, sample the counter, write the offset
/// register while still in sync mode, then exit.
///
/// For a fleet, call this per device with the same `reference_unix_secs` so
/// all RTCs share one reference instant.
pub async fn synchronize(
    session: &DeviceSession,
    reference_unix_secs: u32,
    config: &TimeSyncConfig,
) -> Result<ClockOffsetEstimate, BridgeError> {
    if config.samples == 0 {
        return Err(SyncError::NoSamples.into());
    }

    // Pre-flight state check is advisory only; some firmware reports a
    // stale state right after connect.
    match session.transact(DeviceCommand::GetSystemState).await {
        Ok(frame) => match protocol::decode_system_state(&frame) {
            Ok(protocol::SystemState::Idle) => {}
            Ok(state) => {
                warn!(device = session.device_id(), ?state, "device not idle before sync");
            }
            Err(err) => warn!(device = session.device_id(), %err, "system state unreadable"),
        },
        Err(err) => warn!(device = session.device_id(), %err, "system state query failed"),
    }

    let frame = session
        .transact(DeviceCommand::SetDateTime(reference_unix_secs))
        .await?;
    protocol::decode_ack(protocol::CMD_SET_DATE_TIME, &frame)?;
    session.mark_rtc_initialized();

    let frame = session.transact(DeviceCommand::EnterTimeSync).await?;
    protocol::decode_ack(protocol::CMD_ENTER_TIME_SYNC, &frame)?;

    // The register write must land while the device is still in sync mode,
    // so everything between enter and exit runs inside the same exchange.
    let result = sample_and_store(session, config).await;

    match session.transact(DeviceCommand::ExitTimeSync).await {
        Ok(frame) => {
            if let Err(err) = protocol::decode_ack(protocol::CMD_EXIT_TIME_SYNC, &frame) {
                warn!(device = session.device_id(), %err, "exit sync mode not acknowledged");
            }
        }
        Err(err) => warn!(device = session.device_id(), %err, "exit sync mode failed"),
    }

    result
}

async fn sample_and_store(
    session: &DeviceSession,
    config: &TimeSyncConfig,
) -> Result<ClockOffsetEstimate, BridgeError> {
    let mut samples = Vec::with_capacity(config.samples);
    for round in 0..config.samples {
        let sent_us = host_now_us();
        let frame = session.transact(DeviceCommand::GetTimestamp).await?;
        let received_us = host_now_us();
        let counter = protocol::decode_timestamp(&frame)?;
        debug!(
            device = session.device_id(),
            round,
            counter,
            rtt_us = received_us - sent_us,
            "sync sample"
        );
        samples.push(SyncSample {
            sent_us,
            received_us,
            counter,
        });
    }

    // Unit detection from the first sample: a microsecond epoch counter is
    // three orders of magnitude larger than a millisecond one.
    let millisecond_firmware = samples[0].counter < MS_COUNTER_THRESHOLD;

    let mut candidates_us = Vec::with_capacity(samples.len());
    let mut rtt_total_us: i64 = 0;
    for sample in &samples {
        let counter_us = if millisecond_firmware {
            (sample.counter as i64).saturating_mul(1000)
        } else {
            sample.counter as i64
        };
        let midpoint_us = sample.sent_us + (sample.received_us - sample.sent_us) / 2;
        candidates_us.push(midpoint_us - counter_us);
        rtt_total_us += sample.received_us - sample.sent_us;
    }

    let offset_us = median(&mut candidates_us);
    let offset_ms = offset_us / 1000;
    let avg_rtt_ms = rtt_total_us as f64 / samples.len() as f64 / 1000.0;
    info!(
        device = session.device_id(),
        offset_ms, avg_rtt_ms, millisecond_firmware, "offset estimated"
    );

    let register_value = if millisecond_firmware {
        offset_ms
    } else {
        offset_ms
            .checked_mul(1000)
            .ok_or(SyncError::OffsetOutOfRange(offset_ms))?
    };
    let frame = session
        .transact(DeviceCommand::SetClockOffset(register_value))
        .await?;
    let hardware_offset = match protocol::decode_ack(protocol::CMD_SET_CLOCK_OFFSET, &frame) {
        Ok(()) => {
            // The hardware register corrects the stream at the source.
            session.apply_clock_offset(offset_ms);
            session.mark_fully_synced();
            true
        }
        Err(ProtocolError::DeviceNack(protocol::NACK_UNKNOWN_COMMAND)) => {
            // Pre-register firmware does not know the command; correct in
            // software. Any other nack is a real write failure.
            debug!(
                device = session.device_id(),
                "no offset register on this firmware, falling back to software offset"
            );
            session.apply_clock_offset(offset_ms);
            false
        }
        Err(ProtocolError::DeviceNack(code)) => {
            return Err(SyncError::OffsetRegisterRejected { code }.into());
        }
        Err(err) => return Err(err.into()),
    };

    Ok(ClockOffsetEstimate {
        offset_ms,
        avg_rtt_ms,
        samples: samples.len(),
        millisecond_firmware,
        hardware_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SyncState;
    use crate::infrastructure::bluetooth::mock::{FirmwareScript, MockAdapter, MockDeviceSpec};
    use crate::infrastructure::bluetooth::session::SessionConfig;
    use crate::infrastructure::bluetooth::transport::Adapter;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn median_ignores_a_wild_outlier() {
        // Nineteen candidates near 5000 ms plus one sample inflated by a
        // retransmitted reply.
        let mut candidates: Vec<i64> = (0..19).map(|i| 4_990_000 + i * 1000).collect();
        candidates.push(60_000_000);
        let med = median(&mut candidates.clone());
        assert!((4_990_000..=5_010_000).contains(&med));

        let mean: i64 = candidates.iter().sum::<i64>() / candidates.len() as i64;
        assert!(mean > 5_050_000, "mean should be dragged by the outlier");
    }

    #[test]
    fn median_of_even_count_averages_the_middle_pair() {
        let mut values = vec![10, 30, 20, 40];
        assert_eq!(median(&mut values), 25);
    }

    async fn connected_session(script: FirmwareScript) -> (DeviceSession, Arc<super::super::mock::FirmwareLog>) {
        let (responder, log) = script.into_responder();
        let adapter = MockAdapter::new(vec![MockDeviceSpec::sensor(
            "AA:01", "SensorA", -60, responder,
        )]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let peripheral = adapter.peripheral("AA:01").await.unwrap();
        let config = SessionConfig {
            connect_timeout: Duration::from_millis(500),
            discovery_attempts: 3,
            discovery_retry_delay: Duration::from_millis(10),
            battery_poll_interval: Duration::from_secs(60),
            reply_timeout: Duration::from_millis(200),
        };
        let session = DeviceSession::new(peripheral, config, tx);
        session.connect().await.unwrap();
        (session, log)
    }

    #[tokio::test]
    async fn full_run_recovers_the_scripted_skew() {
        let (session, log) = connected_session(FirmwareScript::default()).await;

        let estimate = synchronize(&session, 1_700_000_000, &TimeSyncConfig { samples: 20 })
            .await
            .unwrap();

        // Scripted skew is 5000 ms with +/-2 ms jitter; allow slack for
        // scheduling between the host timestamps and the responder.
        assert!(
            (4_950..=5_050).contains(&estimate.offset_ms),
            "offset {} not near scripted skew",
            estimate.offset_ms
        );
        assert!(estimate.avg_rtt_ms >= 0.0);
        assert_eq!(estimate.samples, 20);
        assert!(estimate.millisecond_firmware);

        assert_eq!(*log.rtc_unix_secs.lock().unwrap(), Some(1_700_000_000));
        assert_eq!(
            *log.offset_register.lock().unwrap(),
            Some(estimate.offset_ms)
        );
        assert!(!log.in_sync_mode.load(Ordering::SeqCst));
        assert_eq!(session.sync_state(), SyncState::FullySynced);
        assert!(estimate.hardware_offset);
    }

    #[tokio::test]
    async fn legacy_firmware_falls_back_to_a_software_offset() {
        let script = FirmwareScript {
            offset_register_nack: Some(protocol::NACK_UNKNOWN_COMMAND),
            ..FirmwareScript::default()
        };
        let (session, log) = connected_session(script).await;

        let estimate = synchronize(&session, 1_700_000_000, &TimeSyncConfig { samples: 10 })
            .await
            .unwrap();

        assert!(!estimate.hardware_offset);
        assert!(log.offset_register.lock().unwrap().is_none());
        // Software path: offset stored but the session is not fully synced,
        // so the stream pump keeps correcting timestamps.
        assert_eq!(session.sync_state(), SyncState::OffsetComputed);
        assert_eq!(session.clock_offset_ms(), Some(estimate.offset_ms));
    }

    #[tokio::test]
    async fn register_write_fault_is_surfaced_not_swallowed() {
        let script = FirmwareScript {
            offset_register_nack: Some(0x7F),
            ..FirmwareScript::default()
        };
        let (session, _log) = connected_session(script).await;

        let err = synchronize(&session, 1_700_000_000, &TimeSyncConfig { samples: 10 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Sync(SyncError::OffsetRegisterRejected { code: 0x7F })
        ));
    }

    #[tokio::test]
    async fn microsecond_firmware_is_detected_and_register_scaled() {
        let script = FirmwareScript {
            millisecond_firmware: false,
            ..FirmwareScript::default()
        };
        let (session, log) = connected_session(script).await;

        let estimate = synchronize(&session, 1_700_000_000, &TimeSyncConfig { samples: 10 })
            .await
            .unwrap();

        assert!(!estimate.millisecond_firmware);
        assert!((4_950..=5_050).contains(&estimate.offset_ms));
        assert_eq!(
            *log.offset_register.lock().unwrap(),
            Some(estimate.offset_ms * 1000)
        );
    }

    #[tokio::test]
    async fn zero_samples_is_rejected_up_front() {
        let (session, _log) = connected_session(FirmwareScript::default()).await;
        let err = synchronize(&session, 1_700_000_000, &TimeSyncConfig { samples: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Sync(SyncError::NoSamples)));
    }
}
