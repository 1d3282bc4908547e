//! Foreground communications loop.
//!
//! Scans the inbound byte ring for frames, dispatches decoded commands
//! against the instrument state, paces asynchronous monitor emission, and
//! pushes outbound bytes to the transport with retry on busy.

use crate::channel::{ChannelMode, ConfigError};
use crate::frequency;
use crate::instrument::Midds;
use crate::protocol::{
    self, DecodeError, ErrorKind, Frame, LineState, MONITOR_HEADER_LEN, MONITOR_TIMESTAMP_LEN,
};
use crate::ring::ByteRing;
use crate::types::{EdgeStamp, TIMER_CHANNEL_COUNT, internal_to_unix_ns, unix_ns_to_internal};

/// Capacity of the inbound and outbound byte rings.
pub const BYTE_RING_CAPACITY: usize = 2048;

/// Largest inbound frame the scanner will buffer. A frame that cannot
/// complete within this window is treated as garbage and resynced past.
pub const COMMS_MAX_MSG_INPUT_LEN: usize = 64;

/// Most timestamps packed into one monitor frame.
pub const COMMS_MAX_TIMESTAMPS_IN_MONITOR: usize = 64;

/// Monitor emission deadline per channel.
pub const CHANNEL_PRINT_INTERVAL_MS: u32 = 100;

/// Largest chunk handed to the transport in one attempt.
pub const COMMS_TX_CHUNK_LEN: usize = 512;

pub const WELCOME_BANNER: &[u8] = b"Connected to MIDDS v.1.0\n";

/// Host-link state owned by the instrument root.
pub(crate) struct CommsState {
    pub input: ByteRing,
    pub output: ByteRing,
    pub connected: bool,
    /// Chunk popped from the output ring but not yet accepted by the
    /// transport.
    pub pending_tx: Vec<u8>,
}

impl CommsState {
    pub fn new() -> Self {
        Self {
            input: ByteRing::new(BYTE_RING_CAPACITY),
            output: ByteRing::new(BYTE_RING_CAPACITY),
            connected: false,
            pending_tx: Vec::new(),
        }
    }
}

impl Midds {
    /// One iteration of the cooperative foreground loop. Never blocks.
    pub fn poll(&mut self) {
        self.scan_input();
        let now_ms = self.board.tick.now_ms();
        self.sync.check_idle(now_ms);
        if self.comms.connected {
            self.emit_monitor_frames(now_ms);
        }
        self.transmit();
        if !self.comms.connected {
            // Nothing flows until the host says hello.
            self.comms.input.clear();
            self.comms.output.clear();
            self.comms.pending_tx.clear();
        }
    }

    fn scan_input(&mut self) {
        let mut scratch = [0u8; COMMS_MAX_MSG_INPUT_LEN];
        while let Some(first) = self.comms.input.peek() {
            if first != protocol::FRAME_SYNC {
                self.comms.input.pop();
                continue;
            }
            let available = self.comms.input.len().min(COMMS_MAX_MSG_INPUT_LEN);
            let snapshot = &mut scratch[..available];
            if !self.comms.input.peek_into(snapshot) {
                return;
            }
            match protocol::decode(snapshot) {
                Ok((frame, consumed)) => {
                    self.comms.input.discard(consumed);
                    self.execute(&frame);
                }
                Err(DecodeError::NotEnoughData) => {
                    if available == COMMS_MAX_MSG_INPUT_LEN {
                        // The frame claims more bytes than the scanner will
                        // ever hold; resync one byte at a time.
                        self.comms.input.pop();
                        continue;
                    }
                    // Wait for the rest of the frame; nothing is discarded.
                    return;
                }
                Err(DecodeError::SyncSequenceNok) => {
                    self.comms.input.pop();
                }
                Err(DecodeError::ErrorDecoding { consumed, kind }) => {
                    self.comms.input.discard(consumed);
                    self.raise_error(kind);
                }
            }
        }
    }

    fn execute(&mut self, frame: &Frame) {
        match frame {
            Frame::Input { channel, .. } => self.execute_input(*channel),
            Frame::Output { channel, value, .. } => self.execute_output(*channel, *value),
            Frame::Frequency { channel, .. } => self.execute_frequency(*channel),
            Frame::ChannelSettings {
                channel,
                mode,
                protocol,
            } => self.execute_channel_settings(*channel, *mode, *protocol),
            Frame::SyncSettings {
                channel,
                frequency_hz,
                duty_cycle_pct,
                time_ns,
            } => self.execute_sync_settings(*channel, *frequency_hz, *duty_cycle_pct, *time_ns),
            Frame::Connect => self.execute_connect(),
            Frame::Disconnect => self.reboot(),
            // Reply-type frames arriving inbound carry nothing to do.
            Frame::Monitor { .. } | Frame::Error { .. } => {}
        }
    }

    fn execute_input(&mut self, channel: i8) {
        let Ok(id) = usize::try_from(channel) else {
            return self.raise_error(ErrorKind::InvalidChannel);
        };
        let Some(ch) = self.channels.get(id) else {
            return self.raise_error(ErrorKind::InvalidChannel);
        };
        if ch.mode == ChannelMode::Disabled {
            return self.raise_error(ErrorKind::InvalidMode);
        }
        match self
            .channels
            .read_state(id, &*self.board.gpio, &*self.board.expanders)
        {
            Ok(level) => {
                let time_ns = self.current_unix_ns();
                self.push_frame(&Frame::Input {
                    channel,
                    value: LineState::from_level(level),
                    time_ns,
                });
            }
            Err(_) => self.raise_error(ErrorKind::Internal),
        }
    }

    fn execute_output(&mut self, channel: i8, value: LineState) {
        let Ok(id) = usize::try_from(channel) else {
            return self.raise_error(ErrorKind::InvalidChannel);
        };
        let Some(ch) = self.channels.get(id) else {
            return self.raise_error(ErrorKind::InvalidChannel);
        };
        if ch.mode != ChannelMode::Output {
            return self.raise_error(ErrorKind::InvalidMode);
        }
        let high = match value {
            LineState::High => true,
            LineState::Low => false,
            LineState::Empty => return self.raise_error(ErrorKind::InvalidValue),
        };
        if self
            .channels
            .write_state(id, high, &mut *self.board.gpio, &mut *self.board.expanders)
            .is_err()
        {
            self.raise_error(ErrorKind::Internal);
        }
    }

    fn execute_frequency(&mut self, channel: i8) {
        let Ok(id) = usize::try_from(channel) else {
            return self.raise_error(ErrorKind::InvalidChannel);
        };
        let Some(ch) = self.channels.get(id) else {
            return self.raise_error(ErrorKind::InvalidChannel);
        };
        if !matches!(ch.mode, ChannelMode::Input | ChannelMode::Frequency) || ch.timer().is_none() {
            return self.raise_error(ErrorKind::InvalidMode);
        }
        let now_ms = self.board.tick.now_ms();
        let measurement = frequency::estimate(self.channels.get_mut(id).expect("checked"), now_ms);
        let time_ns = self.current_unix_ns();
        self.push_frame(&Frame::Frequency {
            channel,
            frequency_hz: measurement.map_or(0.0, |m| m.frequency_hz),
            duty_cycle_pct: measurement.map_or(0.0, |m| m.duty_cycle_pct),
            time_ns,
        });
    }

    fn execute_channel_settings(
        &mut self,
        channel: i8,
        mode: ChannelMode,
        protocol: crate::channel::SignalProtocol,
    ) {
        let Ok(id) = usize::try_from(channel) else {
            return self.raise_error(ErrorKind::InvalidChannel);
        };
        match self.channels.apply_config(
            id,
            mode,
            protocol,
            &mut *self.board.timer,
            &mut *self.board.gpio,
            &mut *self.board.expanders,
        ) {
            Ok(()) => {
                if self
                    .channels
                    .push_shift_registers(&mut *self.board.shift)
                    .is_err()
                {
                    self.raise_error(ErrorKind::Internal);
                }
            }
            Err(ConfigError::InvalidChannel) => self.raise_error(ErrorKind::InvalidChannel),
            Err(ConfigError::InvalidSignalType) => self.raise_error(ErrorKind::InvalidSignalType),
            Err(ConfigError::Hardware(_)) => self.raise_error(ErrorKind::Internal),
        }
    }

    fn execute_sync_settings(
        &mut self,
        channel: i8,
        frequency_hz: f64,
        duty_cycle_pct: f64,
        time_ns: u64,
    ) {
        let sync_channel = if channel >= 0 {
            let id = channel as usize;
            let Some(ch) = self.channels.get(id) else {
                return self.raise_error(ErrorKind::InvalidChannel);
            };
            // Only a timer channel watching both edges can carry the
            // reference pulse.
            if ch.timer().is_none() || ch.mode != ChannelMode::MonitorBoth {
                return self.raise_error(ErrorKind::SyncParams);
            }
            Some(id)
        } else {
            None
        };
        // Keep the capture path quiet while the derived periods and the
        // pending reset change underneath it.
        for id in 0..TIMER_CHANNEL_COUNT {
            self.board.timer.enable_capture_irq(id, false);
        }
        self.channels.set_sync_channel(sync_channel);
        self.sync
            .configure(frequency_hz as f32, (duty_cycle_pct / 100.0) as f32);
        let pending = if time_ns == 0 {
            None
        } else {
            Some(unix_ns_to_internal(time_ns))
        };
        self.sync.set_pending_reset(pending);
        for id in 0..TIMER_CHANNEL_COUNT {
            if let Some(ch) = self.channels.get(id) {
                self.board
                    .timer
                    .enable_capture_irq(id, ch.mode.captures_edges());
            }
        }
    }

    fn execute_connect(&mut self) {
        for id in 0..crate::types::CHANNEL_COUNT {
            if let Some(ch) = self.channels.get_mut(id) {
                ch.mode = ChannelMode::Disabled;
                ch.protocol = crate::channel::SignalProtocol::Off;
            }
        }
        let _ = self.channels.reprogram_all(
            &mut *self.board.timer,
            &mut *self.board.gpio,
            &mut *self.board.expanders,
        );
        let _ = self.channels.push_shift_registers(&mut *self.board.shift);
        self.comms.output.clear();
        self.comms.pending_tx.clear();
        self.comms.output.push_all(WELCOME_BANNER);
        self.comms.connected = true;
    }

    /// Emits a monitor frame for every monitored channel whose ring is half
    /// full or whose print deadline has passed.
    fn emit_monitor_frames(&mut self, now_ms: u32) {
        for id in 0..TIMER_CHANNEL_COUNT {
            let free = self.comms.output.free();
            if free < MONITOR_HEADER_LEN + MONITOR_TIMESTAMP_LEN {
                return;
            }
            let Some(channel) = self.channels.get_mut(id) else {
                continue;
            };
            if !channel.mode.is_monitor() {
                continue;
            }
            let last_print = channel.last_print_tick;
            let Some(tc) = channel.timer_mut() else {
                continue;
            };
            let buffered = tc.ring.len();
            if buffered == 0 {
                continue;
            }
            let due = buffered >= tc.ring.capacity() / 2
                || now_ms.wrapping_sub(last_print) >= CHANNEL_PRINT_INTERVAL_MS;
            if !due {
                continue;
            }
            let fits = (free - MONITOR_HEADER_LEN) / MONITOR_TIMESTAMP_LEN;
            let count = buffered.min(COMMS_MAX_TIMESTAMPS_IN_MONITOR).min(fits);
            let stamps: Vec<EdgeStamp> = (0..count)
                .filter_map(|_| tc.ring.pop())
                .map(EdgeStamp::to_unix)
                .collect();
            channel.last_print_tick = now_ms;
            let bytes = protocol::encode(&Frame::Monitor {
                channel: id as i8,
                stamps,
            });
            self.comms.output.push_all(&bytes);
        }
    }

    fn transmit(&mut self) {
        if self.comms.pending_tx.is_empty() && !self.comms.output.is_empty() {
            let take = self.comms.output.len().min(COMMS_TX_CHUNK_LEN);
            let mut chunk = vec![0u8; take];
            if self.comms.output.pop_into(&mut chunk) {
                self.comms.pending_tx = chunk;
            }
        }
        if !self.comms.pending_tx.is_empty()
            && self.board.transport.try_transmit(&self.comms.pending_tx)
                == crate::hardware::TransmitOutcome::Accepted
        {
            self.comms.pending_tx.clear();
        }
    }

    /// Current instrument time on the wire timescale.
    fn current_unix_ns(&self) -> u64 {
        let now = self.clock.now(self.board.timer.read_counter());
        internal_to_unix_ns(self.sync.correct(now))
    }

    fn push_frame(&mut self, frame: &Frame) {
        let bytes = protocol::encode(frame);
        self.comms.output.push_all(&bytes);
    }

    fn raise_error(&mut self, kind: ErrorKind) {
        self.comms.output.push_all(&protocol::encode_error(kind));
    }
}
