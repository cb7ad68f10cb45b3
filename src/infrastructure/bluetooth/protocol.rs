//! Sensor Protocol
//!
//! Pure command/reply/packet codec for the wearable motion sensors. Command
//! frames are `[type, len, payload...]`; replies echo the command byte ahead
//! of the payload so a stale reply from a previous command can be detected
//! instead of being misread as data.

use crate::domain::models::Quaternion;
use crate::error::ProtocolError;

/// Motion sensor BLE service UUID.
pub const SERVICE_UUID: &str = "7a3c0001-9f6d-4c8e-8a2b-1d5e44c0f9a1";

/// Command characteristic UUID - commands are written here, replies arrive
/// as notifications on the same characteristic.
pub const COMMAND_CHAR_UUID: &str = "7a3c0002-9f6d-4c8e-8a2b-1d5e44c0f9a1";

/// Data characteristic UUID - streaming motion packets.
pub const DATA_CHAR_UUID: &str = "7a3c0003-9f6d-4c8e-8a2b-1d5e44c0f9a1";

/// Command opcodes.
pub const CMD_SET_MODE: u8 = 0x01;
pub const CMD_START_STREAM: u8 = 0x02;
pub const CMD_STOP_STREAM: u8 = 0x03;
pub const CMD_GET_BATTERY: u8 = 0x05;
pub const CMD_GET_SYSTEM_STATE: u8 = 0x06;
pub const CMD_SET_DATE_TIME: u8 = 0x08;
pub const CMD_ENTER_TIME_SYNC: u8 = 0x0A;
pub const CMD_EXIT_TIME_SYNC: u8 = 0x0B;
pub const CMD_GET_TIMESTAMP: u8 = 0x0C;
pub const CMD_SET_CLOCK_OFFSET: u8 = 0x0D;

/// ORed into the command byte for the "read" variant of a command.
pub const READ_MASK: u8 = 0x80;

/// Nack code: the command arrived in a state where it is not allowed.
pub const NACK_INVALID_STATE: u8 = 0x01;
/// Nack code: the firmware does not implement the command. Pre-offset-register
/// revisions answer `SetClockOffset` with this.
pub const NACK_UNKNOWN_COMMAND: u8 = 0x02;

/// Streaming mode values (3-byte little-endian on the wire).
pub mod stream_mode {
    /// Quaternion-only packets.
    pub const QUATERNION: u32 = 0x00_0004;
    /// Quaternion plus 48-bit device clock.
    pub const QUATERNION_TIMESTAMPED: u32 = 0x00_0104;
}

/// Frequency code: sample rate in Hz, one byte.
pub const FREQ_100_HZ: u8 = 100;

/// Quaternion components are Q14 fixed point.
pub const QUAT_SCALE: f32 = 1.0 / 16384.0;

const MOTION_HEADER_LEN: usize = 8;
const QUAT_LEN: usize = 6;
const CLOCK_LEN: usize = 6;

/// First header byte of every motion packet.
pub const PACKET_KIND_QUATERNION: u8 = 0x51;

/// Firmware-reported system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Idle,
    Streaming,
    TimeSync,
    /// Unrecognized firmware state byte, preserved for diagnostics.
    Other(u8),
}

impl From<u8> for SystemState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Idle,
            0x01 => Self::Streaming,
            0x02 => Self::TimeSync,
            other => Self::Other(other),
        }
    }
}

/// Commands understood by the sensor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    SetMode(u32),
    StartStream { mode: u32, frequency_hz: u8 },
    StopStream,
    GetBattery,
    GetSystemState,
    /// Unix seconds written to the device RTC.
    SetDateTime(u32),
    EnterTimeSync,
    ExitTimeSync,
    GetTimestamp,
    /// Signed offset for the hardware offset register.
    SetClockOffset(i64),
}

impl DeviceCommand {
    /// Wire byte: opcode, with the read mask for query commands.
    pub fn wire_opcode(&self) -> u8 {
        match self {
            Self::SetMode(_) => CMD_SET_MODE,
            Self::StartStream { .. } => CMD_START_STREAM,
            Self::StopStream => CMD_STOP_STREAM,
            Self::GetBattery => CMD_GET_BATTERY | READ_MASK,
            Self::GetSystemState => CMD_GET_SYSTEM_STATE | READ_MASK,
            Self::SetDateTime(_) => CMD_SET_DATE_TIME,
            Self::EnterTimeSync => CMD_ENTER_TIME_SYNC,
            Self::ExitTimeSync => CMD_EXIT_TIME_SYNC,
            Self::GetTimestamp => CMD_GET_TIMESTAMP | READ_MASK,
            Self::SetClockOffset(_) => CMD_SET_CLOCK_OFFSET,
        }
    }

    /// Build the command frame: `[type, len, payload...]`.
    pub fn encode(&self) -> Vec<u8> {
        let payload: Vec<u8> = match *self {
            Self::SetMode(mode) => mode.to_le_bytes()[..3].to_vec(),
            Self::StartStream { mode, frequency_hz } => {
                let mut p = mode.to_le_bytes()[..3].to_vec();
                p.push(frequency_hz);
                p
            }
            Self::SetDateTime(unix_secs) => unix_secs.to_le_bytes().to_vec(),
            Self::SetClockOffset(offset) => offset.to_le_bytes().to_vec(),
            Self::StopStream
            | Self::GetBattery
            | Self::GetSystemState
            | Self::EnterTimeSync
            | Self::ExitTimeSync
            | Self::GetTimestamp => Vec::new(),
        };

        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.push(self.wire_opcode());
        frame.push(payload.len() as u8);
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Build a reply frame for a command. The firmware echoes the wire opcode;
/// used by the mock backend and tests.
pub fn encode_reply(wire_opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.push(wire_opcode);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Validate the echoed command byte and length, returning the payload.
///
/// A mismatching echo means the reply belongs to an earlier command and must
/// be discarded, not interpreted.
pub fn decode_reply(expected_opcode: u8, frame: &[u8]) -> Result<&[u8], ProtocolError> {
    if frame.len() < 2 {
        return Err(ProtocolError::MalformedReply {
            len: frame.len(),
            expected: 2,
        });
    }
    if frame[0] != expected_opcode {
        return Err(ProtocolError::CommandMismatch {
            expected: expected_opcode,
            got: frame[0],
        });
    }
    let payload_len = frame[1] as usize;
    if frame.len() != 2 + payload_len {
        return Err(ProtocolError::MalformedReply {
            len: frame.len(),
            expected: 2 + payload_len,
        });
    }
    Ok(&frame[2..])
}

/// Battery percent from a get-battery reply.
pub fn decode_battery(frame: &[u8]) -> Result<u8, ProtocolError> {
    let payload = decode_reply(CMD_GET_BATTERY | READ_MASK, frame)?;
    match payload {
        [percent] => Ok(*percent),
        _ => Err(ProtocolError::MalformedReply {
            len: frame.len(),
            expected: 3,
        }),
    }
}

/// System state from a get-system-state reply.
pub fn decode_system_state(frame: &[u8]) -> Result<SystemState, ProtocolError> {
    let payload = decode_reply(CMD_GET_SYSTEM_STATE | READ_MASK, frame)?;
    match payload {
        [state] => Ok(SystemState::from(*state)),
        _ => Err(ProtocolError::MalformedReply {
            len: frame.len(),
            expected: 3,
        }),
    }
}

/// Raw device counter from a get-timestamp reply (8-byte LE).
pub fn decode_timestamp(frame: &[u8]) -> Result<u64, ProtocolError> {
    let payload = decode_reply(CMD_GET_TIMESTAMP | READ_MASK, frame)?;
    if payload.len() != 8 {
        return Err(ProtocolError::MalformedReply {
            len: frame.len(),
            expected: 10,
        });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(payload);
    Ok(u64::from_le_bytes(bytes))
}

/// Single-byte firmware acknowledgement; 0 is success.
pub fn decode_ack(expected_opcode: u8, frame: &[u8]) -> Result<(), ProtocolError> {
    let payload = decode_reply(expected_opcode, frame)?;
    match payload {
        [0] => Ok(()),
        [code] => Err(ProtocolError::DeviceNack(*code)),
        _ => Err(ProtocolError::MalformedReply {
            len: frame.len(),
            expected: 3,
        }),
    }
}

/// One decoded streaming packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionPacket {
    pub sequence: u16,
    pub quaternion: Quaternion,
    /// 48-bit device clock, present in timestamped mode.
    pub device_clock: Option<u64>,
}

/// Exact packet length for the given mode.
pub fn packet_len(timestamped: bool) -> usize {
    if timestamped {
        MOTION_HEADER_LEN + QUAT_LEN + CLOCK_LEN
    } else {
        MOTION_HEADER_LEN + QUAT_LEN
    }
}

/// Reconstruct a unit quaternion from the three streamed components.
///
/// `w = sqrt(max(0, 1 - x^2 - y^2 - z^2))`; the max clamp keeps
/// quantization noise from producing a NaN root.
pub fn quaternion_from_components(raw_x: i16, raw_y: i16, raw_z: i16) -> Quaternion {
    let x = raw_x as f32 * QUAT_SCALE;
    let y = raw_y as f32 * QUAT_SCALE;
    let z = raw_z as f32 * QUAT_SCALE;
    let w = (1.0 - x * x - y * y - z * z).max(0.0).sqrt();
    Quaternion { w, x, y, z }
}

/// Parse a streaming packet for the active mode.
///
/// Packet layout: 8-byte header (kind, flags, u16 LE sequence, reserved),
/// 6-byte quaternion (x, y, z as i16 LE), and in timestamped mode a 6-byte
/// little-endian 48-bit device clock.
pub fn parse_motion_packet(bytes: &[u8], timestamped: bool) -> Result<MotionPacket, ProtocolError> {
    let expected = packet_len(timestamped);
    if bytes.len() != expected {
        return Err(ProtocolError::PacketSizeMismatch {
            len: bytes.len(),
            expected,
        });
    }
    if bytes[0] != PACKET_KIND_QUATERNION {
        return Err(ProtocolError::UnknownPacketKind(bytes[0]));
    }

    let sequence = u16::from_le_bytes([bytes[2], bytes[3]]);
    let raw_x = i16::from_le_bytes([bytes[8], bytes[9]]);
    let raw_y = i16::from_le_bytes([bytes[10], bytes[11]]);
    let raw_z = i16::from_le_bytes([bytes[12], bytes[13]]);
    let quaternion = quaternion_from_components(raw_x, raw_y, raw_z);

    let device_clock = if timestamped {
        Some(read_u48_le(&bytes[14..20]))
    } else {
        None
    };

    Ok(MotionPacket {
        sequence,
        quaternion,
        device_clock,
    })
}

/// Build a streaming packet; used by the mock backend and tests.
pub fn encode_motion_packet(
    sequence: u16,
    raw_x: i16,
    raw_y: i16,
    raw_z: i16,
    device_clock: Option<u64>,
) -> Vec<u8> {
    let mut bytes = vec![0u8; packet_len(device_clock.is_some())];
    bytes[0] = PACKET_KIND_QUATERNION;
    bytes[1] = if device_clock.is_some() { 0x01 } else { 0x00 };
    bytes[2..4].copy_from_slice(&sequence.to_le_bytes());
    bytes[8..10].copy_from_slice(&raw_x.to_le_bytes());
    bytes[10..12].copy_from_slice(&raw_y.to_le_bytes());
    bytes[12..14].copy_from_slice(&raw_z.to_le_bytes());
    if let Some(clock) = device_clock {
        bytes[14..20].copy_from_slice(&clock.to_le_bytes()[..6]);
    }
    bytes
}

fn read_u48_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..6].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frames() {
        assert_eq!(DeviceCommand::StopStream.encode(), vec![CMD_STOP_STREAM, 0]);
        assert_eq!(
            DeviceCommand::GetBattery.encode(),
            vec![CMD_GET_BATTERY | READ_MASK, 0]
        );
        assert_eq!(
            DeviceCommand::StartStream {
                mode: stream_mode::QUATERNION_TIMESTAMPED,
                frequency_hz: FREQ_100_HZ,
            }
            .encode(),
            vec![CMD_START_STREAM, 4, 0x04, 0x01, 0x00, 100]
        );
        assert_eq!(
            DeviceCommand::SetDateTime(0x0102_0304).encode(),
            vec![CMD_SET_DATE_TIME, 4, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn set_clock_offset_is_signed_le() {
        let frame = DeviceCommand::SetClockOffset(-5000).encode();
        assert_eq!(frame[0], CMD_SET_CLOCK_OFFSET);
        assert_eq!(frame[1], 8);
        assert_eq!(i64::from_le_bytes(frame[2..10].try_into().unwrap()), -5000);
    }

    #[test]
    fn battery_roundtrip() {
        let reply = encode_reply(CMD_GET_BATTERY | READ_MASK, &[87]);
        assert_eq!(decode_battery(&reply).unwrap(), 87);
    }

    #[test]
    fn system_state_roundtrip() {
        let reply = encode_reply(CMD_GET_SYSTEM_STATE | READ_MASK, &[0x00]);
        assert_eq!(decode_system_state(&reply).unwrap(), SystemState::Idle);
        let reply = encode_reply(CMD_GET_SYSTEM_STATE | READ_MASK, &[0x07]);
        assert_eq!(
            decode_system_state(&reply).unwrap(),
            SystemState::Other(0x07)
        );
    }

    #[test]
    fn stale_reply_is_rejected() {
        // Reply echoes get-system-state while we asked for battery.
        let stale = encode_reply(CMD_GET_SYSTEM_STATE | READ_MASK, &[87]);
        assert!(matches!(
            decode_battery(&stale),
            Err(ProtocolError::CommandMismatch { .. })
        ));
    }

    #[test]
    fn undersized_reply_is_an_error() {
        assert!(matches!(
            decode_battery(&[CMD_GET_BATTERY | READ_MASK]),
            Err(ProtocolError::MalformedReply { .. })
        ));
        // Length byte claims more payload than present.
        assert!(matches!(
            decode_battery(&[CMD_GET_BATTERY | READ_MASK, 4, 87]),
            Err(ProtocolError::MalformedReply { .. })
        ));
    }

    #[test]
    fn nack_is_surfaced() {
        let reply = encode_reply(CMD_SET_CLOCK_OFFSET, &[0x11]);
        assert!(matches!(
            decode_ack(CMD_SET_CLOCK_OFFSET, &reply),
            Err(ProtocolError::DeviceNack(0x11))
        ));
    }

    #[test]
    fn quaternion_is_unit_norm_within_tolerance() {
        // x^2 + y^2 + z^2 < 1
        let q = quaternion_from_components(8000, 8000, 8000);
        assert!(q.w >= 0.0);
        assert!((q.norm() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn quaternion_clamps_noisy_sum_to_zero_w() {
        // Components whose squares sum past 1 from quantization noise.
        let q = quaternion_from_components(16384, 16384, 0);
        assert_eq!(q.w, 0.0);
        assert!(!q.w.is_nan());
    }

    #[test]
    fn timestamped_packet_parses() {
        let clock = 0x0000_7F11_2233_4455u64;
        let bytes = encode_motion_packet(42, 16384, 0, 0, Some(clock));
        let packet = parse_motion_packet(&bytes, true).unwrap();
        assert_eq!(packet.sequence, 42);
        assert_eq!(packet.device_clock, Some(clock));
        assert!((packet.quaternion.x - 1.0).abs() < 1e-6);
        assert_eq!(packet.quaternion.w, 0.0);
    }

    #[test]
    fn length_is_validated_per_mode() {
        let bytes = encode_motion_packet(1, 0, 0, 0, None);
        // 14-byte packet while the session expects timestamped frames.
        assert!(matches!(
            parse_motion_packet(&bytes, true),
            Err(ProtocolError::PacketSizeMismatch { len: 14, .. })
        ));
    }

    #[test]
    fn unknown_packet_kind_is_rejected() {
        let mut bytes = encode_motion_packet(1, 0, 0, 0, Some(1));
        bytes[0] = 0xEE;
        assert!(matches!(
            parse_motion_packet(&bytes, true),
            Err(ProtocolError::UnknownPacketKind(0xEE))
        ));
    }
}
