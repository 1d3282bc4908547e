//! Capability traits for the hardware the core depends on.
//!
//! The core never touches peripheral registers; everything goes through
//! these narrow adapters. Concrete implementations live outside the core:
//! real firmware supplies register-backed adapters, while tests and the CLI
//! use the fully simulated board in [`sim`].

use anyhow::Result;

pub mod sim;

/// Edge selection for a timer capture unit.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CapturePolarity {
    Rising,
    Falling,
    Both,
}

/// Electrical configuration of an MCU pin.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PinMode {
    InputFloating,
    Output,
    AltFn(u8),
    Analog,
}

/// The three GPIO expanders, one per supply rail.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExpanderId {
    FiveVolt,
    ThreeVoltThree,
    OneVoltEight,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PinDirection {
    In,
    Out,
}

/// Outcome of a transport transmit attempt. `Busy` means the bytes were not
/// taken and should be retried later.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransmitOutcome {
    Accepted,
    Busy,
}

/// The bank of 16-bit capture timers behind the fourteen timer channels.
///
/// Channels are addressed by their capture-unit index, `0..TIMER_CHANNEL_COUNT`.
pub trait HwTimer {
    /// Starts the counters and arms the configured interrupts.
    fn start(&mut self);

    /// Returns whether a capture was pending on the channel and clears the
    /// flag atomically. The core never touches raw flag words.
    fn acknowledge_capture(&mut self, channel: usize) -> bool;

    /// Reads the channel's capture register.
    fn read_capture(&self, channel: usize) -> u16;

    /// Reads the live counter.
    fn read_counter(&self) -> u16;

    fn set_capture_polarity(&mut self, channel: usize, polarity: CapturePolarity);

    fn enable_capture_irq(&mut self, channel: usize, enabled: bool);

    fn enable_update_irq(&mut self, enabled: bool);
}

/// Direct MCU pin access for the timer channels.
pub trait Gpio {
    fn read_pin(&self, port: u8, pin: u8) -> bool;
    fn write_pin(&mut self, port: u8, pin: u8, high: bool);
    fn configure_pin(&mut self, port: u8, pin: u8, mode: PinMode);
}

/// The I²C GPIO expanders behind the sixteen expander channels. Bus errors
/// surface as `Err` and are reported as internal errors, never panics.
pub trait GpioExpander {
    fn set_direction(&mut self, id: ExpanderId, pin: u8, direction: PinDirection) -> Result<()>;
    fn set_state(&mut self, id: ExpanderId, pin: u8, high: bool) -> Result<()>;
    fn get_state(&self, id: ExpanderId, pin: u8) -> Result<bool>;
}

/// The SPI shift-register chain driving the per-channel signal electronics.
pub trait ShiftRegister {
    /// Shifts a full chain image out, one byte per timer channel.
    fn transmit(&mut self, frame: &[u8]) -> Result<()>;

    /// Strobes the enable pin so the registers latch their contents.
    fn pulse_enable(&mut self);
}

/// The byte transport towards the host (USB CDC on the real instrument).
pub trait ByteTransport {
    fn try_transmit(&mut self, bytes: &[u8]) -> TransmitOutcome;
}

/// Platform millisecond tick source.
pub trait Tick {
    fn now_ms(&self) -> u32;
}

/// MCU (port, pin) behind each timer channel, in channel order. Ports are
/// numbered `0 = A`, `1 = B`.
pub const TIMER_CHANNEL_PINS: [(u8, u8); crate::types::TIMER_CHANNEL_COUNT] = [
    (0, 8),
    (0, 9),
    (0, 10),
    (0, 11),
    (0, 0),
    (0, 1),
    (1, 10),
    (1, 11),
    (0, 6),
    (0, 4),
    (1, 0),
    (1, 1),
    (1, 6),
    (1, 9),
];

/// The full set of adapters handed to the core at boot.
pub struct Board {
    pub timer: Box<dyn HwTimer>,
    pub gpio: Box<dyn Gpio>,
    pub expanders: Box<dyn GpioExpander>,
    pub shift: Box<dyn ShiftRegister>,
    pub transport: Box<dyn ByteTransport>,
    pub tick: Box<dyn Tick>,
}
