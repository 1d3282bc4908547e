//! Per-channel configuration and the table of all thirty channels.
//!
//! Channels `0..14` are bound to a timer capture unit and an MCU pin;
//! channels `14..30` live on one of the three I²C GPIO expanders, selected by
//! the channel's electrical protocol. All configuration flows through
//! [`ChannelTable::apply_config`], which re-programs the hardware and
//! discards stale capture data.

use anyhow::{Result, anyhow};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::hardware::{
    CapturePolarity, ExpanderId, Gpio, GpioExpander, HwTimer, PinDirection, PinMode, ShiftRegister,
    TIMER_CHANNEL_PINS,
};
use crate::ring::TimestampRing;
use crate::types::{CHANNEL_COUNT, TIMER_CHANNEL_COUNT};

/// Capacity of each timer channel's timestamp ring.
pub const TIMESTAMP_RING_CAPACITY: usize = 200;

/// Operating mode of a channel.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug, strum_macros::Display)]
pub enum ChannelMode {
    Disabled,
    Input,
    Output,
    Frequency,
    MonitorRising,
    MonitorFalling,
    MonitorBoth,
}

impl ChannelMode {
    #[must_use]
    pub fn is_monitor(self) -> bool {
        matches!(
            self,
            Self::MonitorRising | Self::MonitorFalling | Self::MonitorBoth
        )
    }

    /// Modes that arm the capture unit.
    #[must_use]
    pub fn captures_edges(self) -> bool {
        matches!(
            self,
            Self::Input
                | Self::Frequency
                | Self::MonitorRising
                | Self::MonitorFalling
                | Self::MonitorBoth
        )
    }

    #[must_use]
    pub fn capture_polarity(self) -> Option<CapturePolarity> {
        match self {
            Self::MonitorRising => Some(CapturePolarity::Rising),
            Self::MonitorFalling => Some(CapturePolarity::Falling),
            Self::MonitorBoth | Self::Input | Self::Frequency => Some(CapturePolarity::Both),
            Self::Disabled | Self::Output => None,
        }
    }
}

/// Electrical protocol driven on the channel's signal electronics.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug, strum_macros::Display)]
pub enum SignalProtocol {
    Off,
    FiveVolt,
    ThreeVoltThree,
    OneVoltEight,
    Lvds,
}

impl SignalProtocol {
    /// The expander serving this protocol's supply rail. LVDS and Off have
    /// none.
    #[must_use]
    pub fn expander(self) -> Option<ExpanderId> {
        match self {
            Self::FiveVolt => Some(ExpanderId::FiveVolt),
            Self::ThreeVoltThree => Some(ExpanderId::ThreeVoltThree),
            Self::OneVoltEight => Some(ExpanderId::OneVoltEight),
            Self::Off | Self::Lvds => None,
        }
    }
}

bitflags! {
    /// One shift-register lane: the signal-electronics control bits of a
    /// single timer channel.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct LaneFlags: u8 {
        /// Voltage select bit 1: 5 V, 1.8 V, and LVDS rails.
        const V1 = 1 << 0;
        /// Voltage select bit 2: 3.3 V and 1.8 V rails.
        const V2 = 1 << 1;
        const STATUS_GREEN = 1 << 2;
        const STATUS_RED = 1 << 3;
        /// Receiver enable of the transceiver.
        const RECEIVER_ENABLE = 1 << 4;
        /// Driver enable of the transceiver.
        const DRIVER_ENABLE = 1 << 5;
        /// Level-shifter direction pin.
        const DIR_OUT = 1 << 6;
    }
}

/// Last frequency estimate of a channel, kept so repeated queries on a slow
/// signal do not return nothing while the ring refills.
#[derive(Copy, Clone, Default)]
pub struct FrequencyCache {
    pub frequency_hz: Option<f64>,
    pub duty_cycle_pct: Option<f64>,
    pub calculated_at_ms: u32,
}

/// State owned by a timer-backed channel.
pub struct TimerChannel {
    pub ring: TimestampRing,
    pub is_sync: bool,
    pub port: u8,
    pub pin: u8,
    /// Capture-unit index on the timer bank.
    pub capture: usize,
}

/// State owned by an expander-backed channel.
pub struct GpioChannel {
    pub pin_number: u8,
}

pub enum ChannelKind {
    Timer(TimerChannel),
    Gpio(GpioChannel),
}

pub struct Channel {
    pub kind: ChannelKind,
    pub mode: ChannelMode,
    pub protocol: SignalProtocol,
    /// Millisecond stamp of the last monitor emission.
    pub last_print_tick: u32,
    pub freq_cache: FrequencyCache,
}

impl Channel {
    #[must_use]
    pub fn timer(&self) -> Option<&TimerChannel> {
        match &self.kind {
            ChannelKind::Timer(tc) => Some(tc),
            ChannelKind::Gpio(_) => None,
        }
    }

    pub fn timer_mut(&mut self) -> Option<&mut TimerChannel> {
        match &mut self.kind {
            ChannelKind::Timer(tc) => Some(tc),
            ChannelKind::Gpio(_) => None,
        }
    }

    /// The signal-electronics lane bits for this channel's configuration.
    #[must_use]
    pub fn lane_flags(&self) -> LaneFlags {
        let mut lanes = LaneFlags::empty();
        if matches!(
            self.protocol,
            SignalProtocol::FiveVolt | SignalProtocol::OneVoltEight | SignalProtocol::Lvds
        ) {
            lanes |= LaneFlags::V1;
        }
        if matches!(
            self.protocol,
            SignalProtocol::ThreeVoltThree | SignalProtocol::OneVoltEight
        ) {
            lanes |= LaneFlags::V2;
        }
        if self.mode == ChannelMode::Disabled {
            lanes |= LaneFlags::STATUS_RED;
        } else {
            lanes |= LaneFlags::STATUS_GREEN;
        }
        let lvds = self.protocol == SignalProtocol::Lvds;
        if (!lvds && self.mode != ChannelMode::Disabled)
            || (lvds && self.mode == ChannelMode::Output)
        {
            lanes |= LaneFlags::RECEIVER_ENABLE;
        }
        if lvds {
            lanes |= LaneFlags::DRIVER_ENABLE;
        }
        if self.mode == ChannelMode::Output {
            lanes |= LaneFlags::DIR_OUT;
        }
        lanes
    }
}

/// Why a configuration request was rejected.
#[derive(Debug)]
pub enum ConfigError {
    InvalidChannel,
    /// LVDS requested on an expander channel.
    InvalidSignalType,
    Hardware(anyhow::Error),
}

/// Alternate-function number routing a timer channel's pin to its capture
/// unit.
fn alt_fn(capture: usize) -> u8 {
    match capture {
        0..=3 => 6,
        4..=7 => 1,
        _ => 2,
    }
}

pub struct ChannelTable {
    channels: Vec<Channel>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTable {
    /// Builds the power-on table: every channel disabled, timer channels
    /// bound to their capture units and pins, expander channels numbered so
    /// that the last channel sits on expander pin 0.
    #[must_use]
    pub fn new() -> Self {
        let mut channels = Vec::with_capacity(CHANNEL_COUNT);
        for (capture, &(port, pin)) in TIMER_CHANNEL_PINS.iter().enumerate() {
            channels.push(Channel {
                kind: ChannelKind::Timer(TimerChannel {
                    ring: TimestampRing::new(TIMESTAMP_RING_CAPACITY),
                    is_sync: false,
                    port,
                    pin,
                    capture,
                }),
                mode: ChannelMode::Disabled,
                protocol: SignalProtocol::Off,
                last_print_tick: 0,
                freq_cache: FrequencyCache::default(),
            });
        }
        for offset in TIMER_CHANNEL_COUNT..CHANNEL_COUNT {
            let pin_number = (CHANNEL_COUNT - 1 - offset) as u8;
            channels.push(Channel {
                kind: ChannelKind::Gpio(GpioChannel { pin_number }),
                mode: ChannelMode::Disabled,
                protocol: SignalProtocol::Off,
                last_print_tick: 0,
                freq_cache: FrequencyCache::default(),
            });
        }
        Self { channels }
    }

    #[must_use]
    pub fn get(&self, id: usize) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// The channel currently designated as the SYNC reference, if any.
    #[must_use]
    pub fn sync_channel(&self) -> Option<usize> {
        self.channels
            .iter()
            .position(|ch| ch.timer().is_some_and(|tc| tc.is_sync))
    }

    /// Designates (or clears) the SYNC reference channel. Only timer
    /// channels qualify.
    pub fn set_sync_channel(&mut self, id: Option<usize>) -> bool {
        if let Some(id) = id
            && self.channels.get(id).and_then(Channel::timer).is_none()
        {
            return false;
        }
        for ch in &mut self.channels {
            if let Some(tc) = ch.timer_mut() {
                tc.is_sync = false;
            }
        }
        if let Some(id) = id
            && let Some(tc) = self.channels[id].timer_mut()
        {
            tc.is_sync = true;
        }
        true
    }

    /// Validates and applies a configuration change, re-programming the
    /// hardware behind the channel. Timer channels lose any buffered stamps
    /// from the previous mode.
    pub fn apply_config(
        &mut self,
        id: usize,
        mode: ChannelMode,
        protocol: SignalProtocol,
        timer: &mut dyn HwTimer,
        gpio: &mut dyn Gpio,
        expanders: &mut dyn GpioExpander,
    ) -> Result<(), ConfigError> {
        let Some(channel) = self.channels.get_mut(id) else {
            return Err(ConfigError::InvalidChannel);
        };
        if matches!(channel.kind, ChannelKind::Gpio(_)) && protocol == SignalProtocol::Lvds {
            return Err(ConfigError::InvalidSignalType);
        }
        channel.mode = mode;
        channel.protocol = if mode == ChannelMode::Disabled {
            SignalProtocol::Off
        } else {
            protocol
        };
        Self::reprogram(channel, timer, gpio, expanders).map_err(ConfigError::Hardware)
    }

    /// Re-applies every channel's current configuration, as done at boot and
    /// on (re)connection.
    pub fn reprogram_all(
        &mut self,
        timer: &mut dyn HwTimer,
        gpio: &mut dyn Gpio,
        expanders: &mut dyn GpioExpander,
    ) -> Result<()> {
        for channel in &mut self.channels {
            Self::reprogram(channel, timer, gpio, expanders)?;
        }
        Ok(())
    }

    fn reprogram(
        channel: &mut Channel,
        timer: &mut dyn HwTimer,
        gpio: &mut dyn Gpio,
        expanders: &mut dyn GpioExpander,
    ) -> Result<()> {
        let mode = channel.mode;
        match &mut channel.kind {
            ChannelKind::Timer(tc) => {
                // Quiesce first so no stale capture fires mid-change.
                timer.enable_capture_irq(tc.capture, false);
                tc.ring.clear();
                match mode {
                    ChannelMode::Disabled => {
                        gpio.configure_pin(tc.port, tc.pin, PinMode::Analog);
                    }
                    ChannelMode::Output => {
                        gpio.configure_pin(tc.port, tc.pin, PinMode::Output);
                    }
                    _ => {
                        gpio.configure_pin(tc.port, tc.pin, PinMode::AltFn(alt_fn(tc.capture)));
                        if let Some(polarity) = mode.capture_polarity() {
                            timer.set_capture_polarity(tc.capture, polarity);
                        }
                        timer.enable_capture_irq(tc.capture, true);
                    }
                }
                Ok(())
            }
            ChannelKind::Gpio(gc) => {
                // Park the pin as input on every rail, then drive it on the
                // selected one if the channel outputs.
                for id in [
                    ExpanderId::FiveVolt,
                    ExpanderId::ThreeVoltThree,
                    ExpanderId::OneVoltEight,
                ] {
                    expanders.set_direction(id, gc.pin_number, PinDirection::In)?;
                }
                if mode == ChannelMode::Output
                    && let Some(id) = channel.protocol.expander()
                {
                    expanders.set_state(id, gc.pin_number, false)?;
                    expanders.set_direction(id, gc.pin_number, PinDirection::Out)?;
                }
                Ok(())
            }
        }
    }

    /// Shifts the lane image of all timer channels out to the signal
    /// electronics and latches it. Lanes go out last channel first, so the
    /// first channel ends up in the register closest to the MCU.
    pub fn push_shift_registers(&self, shift: &mut dyn ShiftRegister) -> Result<()> {
        let frame: Vec<u8> = self.channels[..TIMER_CHANNEL_COUNT]
            .iter()
            .rev()
            .map(|ch| ch.lane_flags().bits())
            .collect();
        shift.transmit(&frame)?;
        shift.pulse_enable();
        Ok(())
    }

    /// Reads a channel's present logical level, whatever its kind.
    pub fn read_state(
        &self,
        id: usize,
        gpio: &dyn Gpio,
        expanders: &dyn GpioExpander,
    ) -> Result<bool> {
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| anyhow!("channel {id} out of range"))?;
        match &channel.kind {
            ChannelKind::Timer(tc) => Ok(gpio.read_pin(tc.port, tc.pin)),
            ChannelKind::Gpio(gc) => {
                let expander = channel
                    .protocol
                    .expander()
                    .ok_or_else(|| anyhow!("channel {id} has no active rail"))?;
                expanders.get_state(expander, gc.pin_number)
            }
        }
    }

    /// Drives a channel's output level, whatever its kind.
    pub fn write_state(
        &mut self,
        id: usize,
        high: bool,
        gpio: &mut dyn Gpio,
        expanders: &mut dyn GpioExpander,
    ) -> Result<()> {
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| anyhow!("channel {id} out of range"))?;
        match &channel.kind {
            ChannelKind::Timer(tc) => {
                gpio.write_pin(tc.port, tc.pin, high);
                Ok(())
            }
            ChannelKind::Gpio(gc) => {
                let expander = channel
                    .protocol
                    .expander()
                    .ok_or_else(|| anyhow!("channel {id} has no active rail"))?;
                expanders.set_state(expander, gc.pin_number, high)
            }
        }
    }
}
