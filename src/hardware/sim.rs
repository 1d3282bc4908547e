//! Fully simulated board.
//!
//! Implements every capability trait over one shared state cell so tests and
//! the CLI can play both sides: poke counter values, line levels, and
//! capture latches from the outside while the core sees an ordinary board.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Result, bail};

use crate::hardware::{
    Board, ByteTransport, CapturePolarity, ExpanderId, Gpio, GpioExpander, HwTimer, PinDirection,
    PinMode, ShiftRegister, Tick, TransmitOutcome,
};
use crate::types::TIMER_CHANNEL_COUNT;

pub const EXPANDER_PIN_COUNT: usize = 16;

pub struct SimState {
    pub counter: u16,
    pub timer_running: bool,
    pub update_irq_enabled: bool,
    pub captures: [u16; TIMER_CHANNEL_COUNT],
    pub capture_pending: [bool; TIMER_CHANNEL_COUNT],
    pub capture_irq_enabled: [bool; TIMER_CHANNEL_COUNT],
    pub capture_polarity: [Option<CapturePolarity>; TIMER_CHANNEL_COUNT],
    pub pin_levels: HashMap<(u8, u8), bool>,
    pub pin_modes: HashMap<(u8, u8), PinMode>,
    pub expander_levels: [[bool; EXPANDER_PIN_COUNT]; 3],
    pub expander_directions: [[PinDirection; EXPANDER_PIN_COUNT]; 3],
    /// When set, every expander access fails, emulating a wedged I²C bus.
    pub expander_bus_fault: bool,
    pub shift_frames: Vec<Vec<u8>>,
    pub enable_pulses: u32,
    pub tx_sink: Vec<u8>,
    pub tx_busy: bool,
    pub now_ms: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            counter: 0,
            timer_running: false,
            update_irq_enabled: false,
            captures: [0; TIMER_CHANNEL_COUNT],
            capture_pending: [false; TIMER_CHANNEL_COUNT],
            capture_irq_enabled: [false; TIMER_CHANNEL_COUNT],
            capture_polarity: [None; TIMER_CHANNEL_COUNT],
            pin_levels: HashMap::new(),
            pin_modes: HashMap::new(),
            expander_levels: [[false; EXPANDER_PIN_COUNT]; 3],
            expander_directions: [[PinDirection::In; EXPANDER_PIN_COUNT]; 3],
            expander_bus_fault: false,
            shift_frames: Vec::new(),
            enable_pulses: 0,
            tx_sink: Vec::new(),
            tx_busy: false,
            now_ms: 0,
        }
    }
}

fn expander_index(id: ExpanderId) -> usize {
    match id {
        ExpanderId::FiveVolt => 0,
        ExpanderId::ThreeVoltThree => 1,
        ExpanderId::OneVoltEight => 2,
    }
}

/// Handle onto the shared state, kept by the harness after the adapter boxes
/// have been handed to the core.
#[derive(Clone)]
pub struct SimBoard {
    state: Rc<RefCell<SimState>>,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState::default())),
        }
    }

    /// Builds the adapter set sharing this board's state.
    #[must_use]
    pub fn board(&self) -> Board {
        Board {
            timer: Box::new(SimTimer(self.state.clone())),
            gpio: Box::new(SimGpio(self.state.clone())),
            expanders: Box::new(SimExpanders(self.state.clone())),
            shift: Box::new(SimShiftRegister(self.state.clone())),
            transport: Box::new(SimTransport(self.state.clone())),
            tick: Box::new(SimTick(self.state.clone())),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.borrow_mut())
    }

    pub fn set_counter(&self, value: u16) {
        self.state.borrow_mut().counter = value;
    }

    /// Advances the 16-bit counter, reporting whether it wrapped. On a wrap
    /// the harness is expected to invoke the core's update interrupt.
    pub fn advance_counter(&self, ticks: u16) -> bool {
        let mut state = self.state.borrow_mut();
        let (next, wrapped) = state.counter.overflowing_add(ticks);
        state.counter = next;
        wrapped
    }

    pub fn set_pin(&self, port: u8, pin: u8, high: bool) {
        self.state.borrow_mut().pin_levels.insert((port, pin), high);
    }

    /// Applies an edge on a timer channel: updates the line level and, when
    /// the configured capture polarity matches the edge direction, latches
    /// the current counter into the capture register and raises the pending
    /// flag. Returns whether a capture was latched.
    pub fn edge(&self, channel: usize, level: bool) -> bool {
        let (port, pin) = crate::hardware::TIMER_CHANNEL_PINS[channel];
        let mut state = self.state.borrow_mut();
        state.pin_levels.insert((port, pin), level);
        let latched = match state.capture_polarity[channel] {
            Some(CapturePolarity::Both) => true,
            Some(CapturePolarity::Rising) => level,
            Some(CapturePolarity::Falling) => !level,
            None => false,
        };
        if latched {
            state.captures[channel] = state.counter;
            state.capture_pending[channel] = true;
        }
        latched
    }

    pub fn set_ms(&self, now_ms: u32) {
        self.state.borrow_mut().now_ms = now_ms;
    }

    pub fn advance_ms(&self, delta: u32) {
        self.state.borrow_mut().now_ms += delta;
    }

    pub fn set_tx_busy(&self, busy: bool) {
        self.state.borrow_mut().tx_busy = busy;
    }

    pub fn set_expander_bus_fault(&self, faulty: bool) {
        self.state.borrow_mut().expander_bus_fault = faulty;
    }

    pub fn set_expander_level(&self, id: ExpanderId, pin: u8, high: bool) {
        self.state.borrow_mut().expander_levels[expander_index(id)][pin as usize] = high;
    }

    /// Drains everything the core has transmitted so far.
    pub fn take_tx(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().tx_sink)
    }
}

struct SimTimer(Rc<RefCell<SimState>>);

impl HwTimer for SimTimer {
    fn start(&mut self) {
        self.0.borrow_mut().timer_running = true;
    }

    fn acknowledge_capture(&mut self, channel: usize) -> bool {
        let mut state = self.0.borrow_mut();
        if !state.capture_pending[channel] || !state.capture_irq_enabled[channel] {
            return false;
        }
        state.capture_pending[channel] = false;
        true
    }

    fn read_capture(&self, channel: usize) -> u16 {
        self.0.borrow().captures[channel]
    }

    fn read_counter(&self) -> u16 {
        self.0.borrow().counter
    }

    fn set_capture_polarity(&mut self, channel: usize, polarity: CapturePolarity) {
        self.0.borrow_mut().capture_polarity[channel] = Some(polarity);
    }

    fn enable_capture_irq(&mut self, channel: usize, enabled: bool) {
        self.0.borrow_mut().capture_irq_enabled[channel] = enabled;
    }

    fn enable_update_irq(&mut self, enabled: bool) {
        self.0.borrow_mut().update_irq_enabled = enabled;
    }
}

struct SimGpio(Rc<RefCell<SimState>>);

impl Gpio for SimGpio {
    fn read_pin(&self, port: u8, pin: u8) -> bool {
        *self.0.borrow().pin_levels.get(&(port, pin)).unwrap_or(&false)
    }

    fn write_pin(&mut self, port: u8, pin: u8, high: bool) {
        self.0.borrow_mut().pin_levels.insert((port, pin), high);
    }

    fn configure_pin(&mut self, port: u8, pin: u8, mode: PinMode) {
        self.0.borrow_mut().pin_modes.insert((port, pin), mode);
    }
}

struct SimExpanders(Rc<RefCell<SimState>>);

impl GpioExpander for SimExpanders {
    fn set_direction(&mut self, id: ExpanderId, pin: u8, direction: PinDirection) -> Result<()> {
        let mut state = self.0.borrow_mut();
        if state.expander_bus_fault {
            bail!("expander {id:?} did not acknowledge");
        }
        state.expander_directions[expander_index(id)][pin as usize] = direction;
        Ok(())
    }

    fn set_state(&mut self, id: ExpanderId, pin: u8, high: bool) -> Result<()> {
        let mut state = self.0.borrow_mut();
        if state.expander_bus_fault {
            bail!("expander {id:?} did not acknowledge");
        }
        state.expander_levels[expander_index(id)][pin as usize] = high;
        Ok(())
    }

    fn get_state(&self, id: ExpanderId, pin: u8) -> Result<bool> {
        let state = self.0.borrow();
        if state.expander_bus_fault {
            bail!("expander {id:?} did not acknowledge");
        }
        Ok(state.expander_levels[expander_index(id)][pin as usize])
    }
}

struct SimShiftRegister(Rc<RefCell<SimState>>);

impl ShiftRegister for SimShiftRegister {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        self.0.borrow_mut().shift_frames.push(frame.to_vec());
        Ok(())
    }

    fn pulse_enable(&mut self) {
        self.0.borrow_mut().enable_pulses += 1;
    }
}

struct SimTransport(Rc<RefCell<SimState>>);

impl ByteTransport for SimTransport {
    fn try_transmit(&mut self, bytes: &[u8]) -> TransmitOutcome {
        let mut state = self.0.borrow_mut();
        if state.tx_busy {
            return TransmitOutcome::Busy;
        }
        state.tx_sink.extend_from_slice(bytes);
        TransmitOutcome::Accepted
    }
}

struct SimTick(Rc<RefCell<SimState>>);

impl Tick for SimTick {
    fn now_ms(&self) -> u32 {
        self.0.borrow().now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_latches_only_matching_polarity() {
        let sim = SimBoard::new();
        let mut board = sim.board();
        board.timer.set_capture_polarity(0, CapturePolarity::Rising);
        board.timer.enable_capture_irq(0, true);
        sim.set_counter(0x42);
        assert!(!sim.edge(0, false));
        assert!(sim.edge(0, true));
        assert!(board.timer.acknowledge_capture(0));
        assert_eq!(board.timer.read_capture(0), 0x42);
        // Acknowledge clears the pending flag.
        assert!(!board.timer.acknowledge_capture(0));
    }

    #[test]
    fn busy_transport_takes_nothing() {
        let sim = SimBoard::new();
        let mut board = sim.board();
        sim.set_tx_busy(true);
        assert_eq!(board.transport.try_transmit(b"abc"), TransmitOutcome::Busy);
        sim.set_tx_busy(false);
        assert_eq!(
            board.transport.try_transmit(b"abc"),
            TransmitOutcome::Accepted
        );
        assert_eq!(sim.take_tx(), b"abc");
    }

    #[test]
    fn expander_bus_fault_surfaces_as_error() {
        let sim = SimBoard::new();
        let mut board = sim.board();
        sim.set_expander_bus_fault(true);
        assert!(
            board
                .expanders
                .set_state(ExpanderId::FiveVolt, 3, true)
                .is_err()
        );
        sim.set_expander_bus_fault(false);
        assert!(
            board
                .expanders
                .set_state(ExpanderId::FiveVolt, 3, true)
                .is_ok()
        );
        assert!(board.expanders.get_state(ExpanderId::FiveVolt, 3).unwrap());
    }
}
