//! Frame codec for the host link.
//!
//! Every frame begins with `$`, followed by a one- or two-byte tag. Channel
//! numbers travel as two ASCII digits (a leading `-` plus one digit encodes
//! the negative "no channel" sentinel); timestamps and doubles are
//! little-endian 64-bit. The codec is symmetric: it decodes every frame type
//! it can encode, so the same tables serve the instrument and a host-side
//! consumer.

use crate::channel::{ChannelMode, SignalProtocol};
use crate::types::EdgeStamp;

pub const FRAME_SYNC: u8 = b'$';

pub const INPUT_FRAME_LEN: usize = 13;
pub const OUTPUT_FRAME_LEN: usize = 13;
pub const FREQUENCY_FRAME_LEN: usize = 28;
pub const CHANNEL_SETTINGS_FRAME_LEN: usize = 8;
pub const SYNC_SETTINGS_FRAME_LEN: usize = 29;
pub const CONNECT_FRAME_LEN: usize = 5;
pub const DISCONNECT_FRAME_LEN: usize = 5;
pub const MONITOR_HEADER_LEN: usize = 8;
pub const MONITOR_TIMESTAMP_LEN: usize = 8;

/// Most timestamps a single monitor frame can announce (four ASCII digits).
pub const MONITOR_MAX_COUNT: usize = 9999;

pub const SYNC_MIN_FREQ_HZ: f64 = 1e-3;
pub const SYNC_MAX_FREQ_HZ: f64 = 1e7;

/// Wire identifiers of the error frames the instrument can raise.
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum_macros::Display)]
pub enum ErrorKind {
    #[strum(serialize = "RR_INVALID_CHANNEL")]
    InvalidChannel,
    #[strum(serialize = "RR_INVALID_MODE")]
    InvalidMode,
    #[strum(serialize = "RR_INVALID_SIGNAL_TYPE")]
    InvalidSignalType,
    #[strum(serialize = "RR_INVALID_VALUE")]
    InvalidValue,
    #[strum(serialize = "RR_CH_SETT_PARAMS")]
    ChannelSettingsParams,
    #[strum(serialize = "RR_SYNC_PARAMS")]
    SyncParams,
    #[strum(serialize = "RR_INTERNAL")]
    Internal,
}

/// Logical level carried in Input and Output frames. `Empty` is the filler a
/// host sends when querying.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LineState {
    Low,
    High,
    Empty,
}

impl LineState {
    #[must_use]
    pub fn wire_char(self) -> u8 {
        match self {
            Self::Low => b'0',
            Self::High => b'1',
            Self::Empty => b' ',
        }
    }

    #[must_use]
    pub fn from_wire_char(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Self::Low),
            b'1' => Some(Self::High),
            b' ' => Some(Self::Empty),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_level(high: bool) -> Self {
        if high { Self::High } else { Self::Low }
    }
}

fn mode_code(mode: ChannelMode) -> &'static [u8; 2] {
    match mode {
        ChannelMode::Input => b"IN",
        ChannelMode::Output => b"OU",
        ChannelMode::Frequency => b"FR",
        ChannelMode::MonitorRising => b"MR",
        ChannelMode::MonitorFalling => b"MF",
        ChannelMode::MonitorBoth => b"MB",
        ChannelMode::Disabled => b"DS",
    }
}

fn mode_from_code(code: &[u8]) -> Option<ChannelMode> {
    match code {
        b"IN" => Some(ChannelMode::Input),
        b"OU" => Some(ChannelMode::Output),
        b"FR" => Some(ChannelMode::Frequency),
        b"MR" => Some(ChannelMode::MonitorRising),
        b"MF" => Some(ChannelMode::MonitorFalling),
        b"MB" => Some(ChannelMode::MonitorBoth),
        b"DS" => Some(ChannelMode::Disabled),
        _ => None,
    }
}

fn protocol_char(protocol: SignalProtocol) -> u8 {
    match protocol {
        SignalProtocol::FiveVolt => b'5',
        SignalProtocol::ThreeVoltThree => b'3',
        SignalProtocol::OneVoltEight => b'1',
        SignalProtocol::Lvds => b'L',
        SignalProtocol::Off => b'O',
    }
}

fn protocol_from_char(byte: u8) -> Option<SignalProtocol> {
    match byte {
        b'5' => Some(SignalProtocol::FiveVolt),
        b'3' => Some(SignalProtocol::ThreeVoltThree),
        b'1' => Some(SignalProtocol::OneVoltEight),
        b'L' => Some(SignalProtocol::Lvds),
        b'O' => Some(SignalProtocol::Off),
        _ => None,
    }
}

/// A decoded frame. Request payloads arrive inbound; reply payloads are
/// encoded outbound. Monitor timestamps are UNIX-nanosecond
/// [`EdgeStamp`] words.
#[derive(Clone, PartialEq, Debug)]
pub enum Frame {
    Input {
        channel: i8,
        value: LineState,
        time_ns: u64,
    },
    Output {
        channel: i8,
        value: LineState,
        time_ns: u64,
    },
    Frequency {
        channel: i8,
        frequency_hz: f64,
        duty_cycle_pct: f64,
        time_ns: u64,
    },
    Monitor {
        channel: i8,
        stamps: Vec<EdgeStamp>,
    },
    ChannelSettings {
        channel: i8,
        mode: ChannelMode,
        protocol: SignalProtocol,
    },
    SyncSettings {
        channel: i8,
        frequency_hz: f64,
        duty_cycle_pct: f64,
        time_ns: u64,
    },
    Connect,
    Disconnect,
    Error {
        message: String,
    },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DecodeError {
    /// The buffer holds less than the frame's fixed length; nothing should
    /// be discarded.
    NotEnoughData,
    /// Bad sync byte or unrecognised tag; discard a single byte.
    SyncSequenceNok,
    /// A fixed-length field failed its domain check; discard `consumed`
    /// bytes and raise `kind` towards the host.
    ErrorDecoding { consumed: usize, kind: ErrorKind },
}

fn encode_channel(channel: i8) -> [u8; 2] {
    if channel < 0 {
        [b'-', b'0' + channel.unsigned_abs()]
    } else {
        [b'0' + (channel as u8) / 10, b'0' + (channel as u8) % 10]
    }
}

fn decode_channel(bytes: &[u8]) -> Option<i8> {
    if bytes[0] == b'-' {
        if bytes[1].is_ascii_digit() {
            let digit = bytes[1] - b'0';
            // "-0" is an observed alternative spelling of the "no channel"
            // sentinel; it must not collapse to channel 0.
            if digit == 0 {
                return Some(-1);
            }
            return Some(-(digit as i8));
        }
        return None;
    }
    if bytes[0].is_ascii_digit() && bytes[1].is_ascii_digit() {
        return Some(((bytes[0] - b'0') * 10 + (bytes[1] - b'0')) as i8);
    }
    None
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().expect("eight bytes"))
}

fn le_f64(bytes: &[u8]) -> f64 {
    f64::from_le_bytes(bytes.try_into().expect("eight bytes"))
}

/// Serialises a frame to its wire form.
#[must_use]
pub fn encode(frame: &Frame) -> Vec<u8> {
    match frame {
        Frame::Input {
            channel,
            value,
            time_ns,
        } => encode_io(b'I', *channel, *value, *time_ns),
        Frame::Output {
            channel,
            value,
            time_ns,
        } => encode_io(b'O', *channel, *value, *time_ns),
        Frame::Frequency {
            channel,
            frequency_hz,
            duty_cycle_pct,
            time_ns,
        } => {
            let mut out = Vec::with_capacity(FREQUENCY_FRAME_LEN);
            out.extend_from_slice(&[FRAME_SYNC, b'F']);
            out.extend_from_slice(&encode_channel(*channel));
            out.extend_from_slice(&frequency_hz.to_le_bytes());
            out.extend_from_slice(&duty_cycle_pct.to_le_bytes());
            out.extend_from_slice(&time_ns.to_le_bytes());
            out
        }
        Frame::Monitor { channel, stamps } => {
            let count = stamps.len().min(MONITOR_MAX_COUNT);
            let mut out = Vec::with_capacity(MONITOR_HEADER_LEN + count * MONITOR_TIMESTAMP_LEN);
            out.extend_from_slice(&[FRAME_SYNC, b'M']);
            out.extend_from_slice(&encode_channel(*channel));
            out.extend_from_slice(format!("{count:04}").as_bytes());
            for stamp in &stamps[..count] {
                out.extend_from_slice(&stamp.to_le_bytes());
            }
            out
        }
        Frame::ChannelSettings {
            channel,
            mode,
            protocol,
        } => {
            let mut out = Vec::with_capacity(CHANNEL_SETTINGS_FRAME_LEN);
            out.extend_from_slice(&[FRAME_SYNC, b'S', b'C']);
            out.extend_from_slice(&encode_channel(*channel));
            out.extend_from_slice(mode_code(*mode));
            out.push(protocol_char(*protocol));
            out
        }
        Frame::SyncSettings {
            channel,
            frequency_hz,
            duty_cycle_pct,
            time_ns,
        } => {
            let mut out = Vec::with_capacity(SYNC_SETTINGS_FRAME_LEN);
            out.extend_from_slice(&[FRAME_SYNC, b'S', b'Y']);
            out.extend_from_slice(&encode_channel(*channel));
            out.extend_from_slice(&frequency_hz.to_le_bytes());
            out.extend_from_slice(&duty_cycle_pct.to_le_bytes());
            out.extend_from_slice(&time_ns.to_le_bytes());
            out
        }
        Frame::Connect => b"$CONN".to_vec(),
        Frame::Disconnect => b"$DISC".to_vec(),
        Frame::Error { message } => {
            let mut out = Vec::with_capacity(3 + message.len());
            out.extend_from_slice(&[FRAME_SYNC, b'E']);
            out.extend_from_slice(message.as_bytes());
            out.push(b'\n');
            out
        }
    }
}

fn encode_io(tag: u8, channel: i8, value: LineState, time_ns: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(INPUT_FRAME_LEN);
    out.extend_from_slice(&[FRAME_SYNC, tag]);
    out.extend_from_slice(&encode_channel(channel));
    out.push(value.wire_char());
    out.extend_from_slice(&time_ns.to_le_bytes());
    out
}

/// The error frame for one of the fixed error kinds.
#[must_use]
pub fn encode_error(kind: ErrorKind) -> Vec<u8> {
    encode(&Frame::Error {
        message: kind.to_string(),
    })
}

/// Decodes the frame at the start of `buf`, returning it together with the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::NotEnoughData);
    }
    if buf[0] != FRAME_SYNC {
        return Err(DecodeError::SyncSequenceNok);
    }
    if buf.len() < 2 {
        return Err(DecodeError::NotEnoughData);
    }
    match buf[1] {
        b'I' => decode_io(buf, true),
        b'O' => decode_io(buf, false),
        b'F' => decode_frequency(buf),
        b'M' => decode_monitor(buf),
        b'E' => decode_error_frame(buf),
        b'S' => match buf.get(2) {
            None => Err(DecodeError::NotEnoughData),
            Some(b'C') => decode_channel_settings(buf),
            Some(b'Y') => decode_sync_settings(buf),
            Some(_) => Err(DecodeError::SyncSequenceNok),
        },
        b'C' => decode_literal(buf, b"$CONN", Frame::Connect),
        b'D' => decode_literal(buf, b"$DISC", Frame::Disconnect),
        _ => Err(DecodeError::SyncSequenceNok),
    }
}

fn decode_literal(
    buf: &[u8],
    expected: &'static [u8],
    frame: Frame,
) -> Result<(Frame, usize), DecodeError> {
    let available = buf.len().min(expected.len());
    if buf[..available] != expected[..available] {
        return Err(DecodeError::SyncSequenceNok);
    }
    if buf.len() < expected.len() {
        return Err(DecodeError::NotEnoughData);
    }
    Ok((frame, expected.len()))
}

fn decode_io(buf: &[u8], input: bool) -> Result<(Frame, usize), DecodeError> {
    if buf.len() < INPUT_FRAME_LEN {
        return Err(DecodeError::NotEnoughData);
    }
    let channel = decode_channel(&buf[2..4]).ok_or(DecodeError::ErrorDecoding {
        consumed: INPUT_FRAME_LEN,
        kind: ErrorKind::InvalidChannel,
    })?;
    let value = LineState::from_wire_char(buf[4]).ok_or(DecodeError::ErrorDecoding {
        consumed: INPUT_FRAME_LEN,
        kind: ErrorKind::InvalidValue,
    })?;
    let time_ns = le_u64(&buf[5..13]);
    let frame = if input {
        Frame::Input {
            channel,
            value,
            time_ns,
        }
    } else {
        Frame::Output {
            channel,
            value,
            time_ns,
        }
    };
    Ok((frame, INPUT_FRAME_LEN))
}

fn decode_frequency(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if buf.len() < FREQUENCY_FRAME_LEN {
        return Err(DecodeError::NotEnoughData);
    }
    let channel = decode_channel(&buf[2..4]).ok_or(DecodeError::ErrorDecoding {
        consumed: FREQUENCY_FRAME_LEN,
        kind: ErrorKind::InvalidChannel,
    })?;
    Ok((
        Frame::Frequency {
            channel,
            frequency_hz: le_f64(&buf[4..12]),
            duty_cycle_pct: le_f64(&buf[12..20]),
            time_ns: le_u64(&buf[20..28]),
        },
        FREQUENCY_FRAME_LEN,
    ))
}

fn decode_monitor(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if buf.len() < MONITOR_HEADER_LEN {
        return Err(DecodeError::NotEnoughData);
    }
    let channel = decode_channel(&buf[2..4]).ok_or(DecodeError::ErrorDecoding {
        consumed: MONITOR_HEADER_LEN,
        kind: ErrorKind::InvalidChannel,
    })?;
    let mut count = 0usize;
    for &digit in &buf[4..8] {
        if !digit.is_ascii_digit() {
            return Err(DecodeError::ErrorDecoding {
                consumed: MONITOR_HEADER_LEN,
                kind: ErrorKind::Internal,
            });
        }
        count = count * 10 + usize::from(digit - b'0');
    }
    let total = MONITOR_HEADER_LEN + count * MONITOR_TIMESTAMP_LEN;
    if buf.len() < total {
        return Err(DecodeError::NotEnoughData);
    }
    let stamps = buf[MONITOR_HEADER_LEN..total]
        .chunks_exact(MONITOR_TIMESTAMP_LEN)
        .map(|chunk| EdgeStamp::from_le_bytes(chunk.try_into().expect("eight bytes")))
        .collect();
    Ok((Frame::Monitor { channel, stamps }, total))
}

fn decode_channel_settings(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if buf.len() < CHANNEL_SETTINGS_FRAME_LEN {
        return Err(DecodeError::NotEnoughData);
    }
    let channel = decode_channel(&buf[3..5]).ok_or(DecodeError::ErrorDecoding {
        consumed: CHANNEL_SETTINGS_FRAME_LEN,
        kind: ErrorKind::InvalidChannel,
    })?;
    let domain_error = DecodeError::ErrorDecoding {
        consumed: CHANNEL_SETTINGS_FRAME_LEN,
        kind: ErrorKind::ChannelSettingsParams,
    };
    let mode = mode_from_code(&buf[5..7]).ok_or(domain_error.clone())?;
    let protocol = protocol_from_char(buf[7]).ok_or(domain_error)?;
    Ok((
        Frame::ChannelSettings {
            channel,
            mode,
            protocol,
        },
        CHANNEL_SETTINGS_FRAME_LEN,
    ))
}

fn decode_sync_settings(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if buf.len() < SYNC_SETTINGS_FRAME_LEN {
        return Err(DecodeError::NotEnoughData);
    }
    let channel = decode_channel(&buf[3..5]).ok_or(DecodeError::ErrorDecoding {
        consumed: SYNC_SETTINGS_FRAME_LEN,
        kind: ErrorKind::InvalidChannel,
    })?;
    let frequency_hz = le_f64(&buf[5..13]);
    let duty_cycle_pct = le_f64(&buf[13..21]);
    let time_ns = le_u64(&buf[21..29]);
    let domain_error = DecodeError::ErrorDecoding {
        consumed: SYNC_SETTINGS_FRAME_LEN,
        kind: ErrorKind::SyncParams,
    };
    if !(SYNC_MIN_FREQ_HZ..=SYNC_MAX_FREQ_HZ).contains(&frequency_hz) {
        return Err(domain_error);
    }
    if duty_cycle_pct <= 0.0 || duty_cycle_pct >= 100.0 {
        return Err(domain_error);
    }
    // All-ones is reserved.
    if time_ns == u64::MAX {
        return Err(domain_error);
    }
    Ok((
        Frame::SyncSettings {
            channel,
            frequency_hz,
            duty_cycle_pct,
            time_ns,
        },
        SYNC_SETTINGS_FRAME_LEN,
    ))
}

fn decode_error_frame(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    let Some(end) = buf[2..].iter().position(|&b| b == b'\n') else {
        return Err(DecodeError::NotEnoughData);
    };
    let message = String::from_utf8_lossy(&buf[2..2 + end]).into_owned();
    Ok((Frame::Error { message }, 2 + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        input = { Frame::Input { channel: 5, value: LineState::High, time_ns: 0x1234_5678_9ABC_DEF0 } },
        input_empty = { Frame::Input { channel: 0, value: LineState::Empty, time_ns: 0 } },
        output = { Frame::Output { channel: 29, value: LineState::Low, time_ns: 42 } },
        frequency = { Frame::Frequency { channel: 7, frequency_hz: 1000.0, duty_cycle_pct: 25.0, time_ns: 99 } },
        monitor = { Frame::Monitor { channel: 3, stamps: vec![
            crate::types::EdgeStamp::new(1_000, true),
            crate::types::EdgeStamp::new(2_000, false),
        ] } },
        monitor_empty = { Frame::Monitor { channel: 13, stamps: vec![] } },
        channel_settings = { Frame::ChannelSettings { channel: 20, mode: ChannelMode::MonitorBoth, protocol: SignalProtocol::ThreeVoltThree } },
        channel_settings_disabled = { Frame::ChannelSettings { channel: 1, mode: ChannelMode::Disabled, protocol: SignalProtocol::Off } },
        sync_settings = { Frame::SyncSettings { channel: 0, frequency_hz: 1.0, duty_cycle_pct: 50.0, time_ns: 1_700_000_000_000_000_000 } },
        sync_settings_no_channel = { Frame::SyncSettings { channel: -1, frequency_hz: 10.0, duty_cycle_pct: 30.0, time_ns: 0 } },
        connect = { Frame::Connect },
        disconnect = { Frame::Disconnect },
        error = { Frame::Error { message: "RR_INVALID_CHANNEL".to_string() } },
    )]
    fn frames_round_trip(frame: Frame) {
        let bytes = encode(&frame);
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn input_reply_bytes_match_the_wire_layout() {
        let frame = Frame::Input {
            channel: 5,
            value: LineState::High,
            time_ns: 0x0102_0304_0506_0708,
        };
        let bytes = encode(&frame);
        assert_eq!(&bytes[..5], b"$I051");
        assert_eq!(&bytes[5..], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(bytes.len(), INPUT_FRAME_LEN);
    }

    #[test]
    fn monitor_header_bytes_match_the_wire_layout() {
        let stamps: Vec<_> = (0..20)
            .map(|i| crate::types::EdgeStamp::new(1000 + i, i % 2 == 0))
            .collect();
        let bytes = encode(&Frame::Monitor { channel: 3, stamps });
        assert_eq!(&bytes[..8], b"$M030020");
        assert_eq!(bytes.len(), 8 + 20 * 8);
    }

    #[test]
    fn error_frame_is_newline_terminated_text() {
        let bytes = encode_error(ErrorKind::InvalidSignalType);
        assert_eq!(bytes, b"$ERR_INVALID_SIGNAL_TYPE\n");
    }

    #[test]
    fn minus_zero_is_the_no_channel_sentinel_too() {
        let mut bytes = encode(&Frame::SyncSettings {
            channel: -1,
            frequency_hz: 1.0,
            duty_cycle_pct: 50.0,
            time_ns: 0,
        });
        bytes[4] = b'0';
        let (frame, _) = decode(&bytes).unwrap();
        let Frame::SyncSettings { channel, .. } = frame else {
            panic!("expected sync settings");
        };
        assert!(channel < 0);
    }

    #[test]
    fn negative_channel_sentinel_survives() {
        let bytes = encode(&Frame::SyncSettings {
            channel: -1,
            frequency_hz: 1.0,
            duty_cycle_pct: 50.0,
            time_ns: 0,
        });
        assert_eq!(&bytes[3..5], b"-1");
        let (frame, _) = decode(&bytes).unwrap();
        assert!(matches!(frame, Frame::SyncSettings { channel: -1, .. }));
    }

    #[parameterized(
        empty = { &[][..] },
        lone_sync = { &b"$"[..] },
        short_input = { &b"$I05"[..] },
        short_settings_tag = { &b"$S"[..] },
        partial_connect = { &b"$CON"[..] },
    )]
    fn truncated_frames_ask_for_more_data(buf: &[u8]) {
        assert_eq!(decode(buf).unwrap_err(), DecodeError::NotEnoughData);
    }

    #[parameterized(
        bad_sync = { &b"XI051234567890123"[..] },
        unknown_tag = { &b"$Z051234567890123"[..] },
        unknown_settings = { &b"$SX1234567890"[..] },
        not_conn = { &b"$CANN!"[..] },
    )]
    fn unrecognised_bytes_fail_the_sync_sequence(buf: &[u8]) {
        assert_eq!(decode(buf).unwrap_err(), DecodeError::SyncSequenceNok);
    }

    #[test]
    fn bad_mode_code_consumes_the_whole_frame() {
        let mut bytes = encode(&Frame::ChannelSettings {
            channel: 2,
            mode: ChannelMode::Input,
            protocol: SignalProtocol::FiveVolt,
        });
        bytes[5] = b'X';
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::ErrorDecoding {
                consumed: CHANNEL_SETTINGS_FRAME_LEN,
                kind: ErrorKind::ChannelSettingsParams,
            }
        );
    }

    #[parameterized(
        freq_too_low = { 0.0, 50.0, 0 },
        freq_too_high = { 2e7, 50.0, 0 },
        duty_zero = { 1.0, 0.0, 0 },
        duty_full = { 1.0, 100.0, 0 },
        reserved_time = { 1.0, 50.0, u64::MAX },
    )]
    fn sync_settings_domain_checks(frequency_hz: f64, duty_cycle_pct: f64, time_ns: u64) {
        let mut bytes = vec![FRAME_SYNC, b'S', b'Y', b'0', b'0'];
        bytes.extend_from_slice(&frequency_hz.to_le_bytes());
        bytes.extend_from_slice(&duty_cycle_pct.to_le_bytes());
        bytes.extend_from_slice(&time_ns.to_le_bytes());
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::ErrorDecoding {
                consumed: SYNC_SETTINGS_FRAME_LEN,
                kind: ErrorKind::SyncParams,
            }
        );
    }

    #[test]
    fn non_digit_channel_is_a_domain_failure() {
        let bytes = b"$IA51234567890123";
        assert_eq!(
            decode(bytes).unwrap_err(),
            DecodeError::ErrorDecoding {
                consumed: INPUT_FRAME_LEN,
                kind: ErrorKind::InvalidChannel,
            }
        );
    }
}
