//! SYNC interpolation engine.
//!
//! The free-running counter drifts against wall-clock time. An external
//! reference pulse of known frequency and duty cycle gives a ground-truth
//! timeline: the engine tracks the measured length of each SYNC half-period
//! against its ideal length and linearly interpolates arbitrary captures
//! between two successive SYNC edges onto the ideal timeline.

use crate::clock::VirtualClock;
use crate::types::MCU_HZ;

/// Clean SYNC pulses required before correction engages.
pub const SYNC_ENGAGE_PULSES: u8 = 3;

/// Which half-period the SYNC line is currently in. `Uninit` disables
/// correction entirely.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SyncState {
    Uninit,
    High,
    Low,
}

pub struct SyncEngine {
    freq_hz: f32,
    duty_fraction: f32,
    ideal_high_ticks: u64,
    ideal_low_ticks: u64,
    measured_high_ticks: u64,
    measured_low_ticks: u64,
    last_sync_measured: u64,
    last_sync_ideal: u64,
    state: SyncState,
    pulse_count: u8,
    /// Set when at least one SYNC edge has been observed since the last
    /// (re)configuration, i.e. `last_sync_measured` is meaningful.
    primed: bool,
    /// Absolute internal time the next SYNC rising edge should be aligned to.
    pending_reset: Option<u64>,
    last_edge_ms: u32,
    idle_timeout_ms: Option<u32>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine {
    /// A fresh engine assumes a 1 PPS, 50 % duty cycle reference until the
    /// host says otherwise.
    #[must_use]
    pub fn new() -> Self {
        let mut engine = Self {
            freq_hz: 0.0,
            duty_fraction: 0.0,
            ideal_high_ticks: 0,
            ideal_low_ticks: 0,
            measured_high_ticks: 0,
            measured_low_ticks: 0,
            last_sync_measured: 0,
            last_sync_ideal: 0,
            state: SyncState::Uninit,
            pulse_count: 0,
            primed: false,
            pending_reset: None,
            last_edge_ms: 0,
            idle_timeout_ms: None,
        };
        engine.configure(1.0, 0.5);
        engine
    }

    /// Sets the reference signal parameters and derives the ideal
    /// half-period lengths. Any reconfiguration drops back to `Uninit`.
    pub fn configure(&mut self, freq_hz: f32, duty_fraction: f32) {
        self.freq_hz = freq_hz;
        self.duty_fraction = duty_fraction;
        let freq = f64::from(freq_hz);
        let duty = f64::from(duty_fraction);
        self.ideal_high_ticks = (MCU_HZ as f64 * duty / freq) as u64;
        self.ideal_low_ticks = (MCU_HZ as f64 * (1.0 - duty) / freq) as u64;
        self.disengage();
    }

    /// Requests that the next SYNC edge be aligned to an absolute internal
    /// time. `None` cancels a pending request. Either way correction drops
    /// back to `Uninit` until the pulse train proves clean again.
    pub fn set_pending_reset(&mut self, target_ticks: Option<u64>) {
        self.pending_reset = target_ticks;
        self.disengage();
    }

    pub fn set_idle_timeout_ms(&mut self, window: Option<u32>) {
        self.idle_timeout_ms = window;
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    #[must_use]
    pub fn frequency_hz(&self) -> f32 {
        self.freq_hz
    }

    #[must_use]
    pub fn duty_fraction(&self) -> f32 {
        self.duty_fraction
    }

    fn disengage(&mut self) {
        self.state = SyncState::Uninit;
        self.pulse_count = 0;
        self.primed = false;
    }

    /// Handles one edge on the designated SYNC channel and returns the
    /// ideal-anchored stamp for that edge.
    ///
    /// `captured` is the clock-extended capture value, `level` the line level
    /// right after the edge. When the level is high, a low half-period just
    /// ended, and vice versa.
    pub fn on_sync_edge(
        &mut self,
        clock: &mut VirtualClock,
        captured: u64,
        level: bool,
        counter: u16,
        now_ms: u32,
    ) -> u64 {
        if self.primed {
            let elapsed = captured.saturating_sub(self.last_sync_measured);
            if level {
                self.measured_low_ticks = elapsed;
            } else {
                self.measured_high_ticks = elapsed;
            }
        }

        self.last_edge_ms = now_ms;

        if let Some(target) = self.pending_reset.take() {
            // The captured value belongs to the pre-reset timebase; rebase
            // the clock and anchor both timelines to the requested instant.
            clock.set_absolute(target, counter);
            self.last_sync_ideal = target;
            self.last_sync_measured = target;
            self.state = SyncState::Uninit;
            self.pulse_count = 0;
            self.primed = true;
            return target;
        }

        if self.primed {
            let half = if level {
                self.ideal_low_ticks
            } else {
                self.ideal_high_ticks
            };
            self.last_sync_ideal = self.last_sync_ideal.saturating_add(half);
        } else {
            // First edge since (re)configuration: anchor the ideal timeline
            // to the measurement.
            self.last_sync_ideal = captured;
            self.primed = true;
        }
        self.last_sync_measured = captured;

        if self.pulse_count >= SYNC_ENGAGE_PULSES - 1 {
            self.state = if level { SyncState::High } else { SyncState::Low };
        } else {
            self.pulse_count += 1;
        }

        self.last_sync_ideal
    }

    /// Interpolates an arbitrary capture onto the ideal timeline.
    ///
    /// Identity while the engine is `Uninit` or the active half-period has
    /// not been measured yet. Saturating on 64 bits.
    #[must_use]
    pub fn correct(&self, captured: u64) -> u64 {
        let (ideal, measured) = match self.state {
            SyncState::Uninit => return captured,
            SyncState::High => (self.ideal_high_ticks, self.measured_high_ticks),
            SyncState::Low => (self.ideal_low_ticks, self.measured_low_ticks),
        };
        if measured == 0 {
            return captured;
        }
        if captured >= self.last_sync_measured {
            let offset = captured - self.last_sync_measured;
            let scaled = u128::from(ideal) * u128::from(offset) / u128::from(measured);
            self.last_sync_ideal
                .saturating_add(u64::try_from(scaled).unwrap_or(u64::MAX))
        } else {
            let offset = self.last_sync_measured - captured;
            let scaled = u128::from(ideal) * u128::from(offset) / u128::from(measured);
            self.last_sync_ideal
                .saturating_sub(u64::try_from(scaled).unwrap_or(u64::MAX))
        }
    }

    /// De-engages when the reference has stopped pulsing for longer than the
    /// configured idle window.
    pub fn check_idle(&mut self, now_ms: u32) {
        if self.state == SyncState::Uninit {
            return;
        }
        if let Some(window) = self.idle_timeout_ms
            && now_ms.wrapping_sub(self.last_edge_ms) >= window
        {
            self.disengage();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF_SECOND: u64 = MCU_HZ / 2;

    /// Feeds an alternating edge train starting with a rising edge at
    /// `start`, spaced `high` and `low` ticks apart, and returns the engine
    /// ready for correction.
    fn engaged_engine(start: u64, high: u64, low: u64, edges: usize) -> (SyncEngine, VirtualClock) {
        let mut engine = SyncEngine::new();
        let mut clock = VirtualClock::new();
        engine.configure(1.0, 0.5);
        let mut t = start;
        let mut level = true;
        for _ in 0..edges {
            engine.on_sync_edge(&mut clock, t, level, 0, 0);
            t += if level { high } else { low };
            level = !level;
        }
        (engine, clock)
    }

    #[test]
    fn stays_uninit_until_three_pulses() {
        let mut engine = SyncEngine::new();
        let mut clock = VirtualClock::new();
        engine.on_sync_edge(&mut clock, 10, true, 0, 0);
        assert_eq!(engine.state(), SyncState::Uninit);
        engine.on_sync_edge(&mut clock, 10 + HALF_SECOND, false, 0, 0);
        assert_eq!(engine.state(), SyncState::Uninit);
        engine.on_sync_edge(&mut clock, 10 + 2 * HALF_SECOND, true, 0, 0);
        assert_eq!(engine.state(), SyncState::High);
    }

    #[test]
    fn perfect_reference_corrects_to_identity() {
        let (engine, _) = engaged_engine(10, HALF_SECOND, HALF_SECOND, 3);
        for v in [0u64, 10, HALF_SECOND, 3 * HALF_SECOND, 7 * HALF_SECOND] {
            assert_eq!(engine.correct(v), v);
        }
    }

    #[test]
    fn correction_is_affine_within_a_half_period() {
        // Reference claims 1 Hz 50 % but actually pulses every 100 Mticks:
        // the measured half-periods are longer than the ideal 85 Mticks.
        let measured = 100_000_000u64;
        let ideal = HALF_SECOND;
        let (engine, _) = engaged_engine(1_000_000, measured, measured, 3);

        let anchor_measured = 1_000_000 + 2 * measured;
        let anchor_ideal = 1_000_000 + 2 * ideal;
        // Endpoints reproduce the anchor and anchor + ideal half-period.
        assert_eq!(engine.correct(anchor_measured), anchor_ideal);
        assert_eq!(engine.correct(anchor_measured + measured), anchor_ideal + ideal);
        // Midpoint lands halfway up the ideal segment.
        assert_eq!(
            engine.correct(anchor_measured + measured / 2),
            anchor_ideal + ideal / 2
        );
        // Captures before the anchor interpolate backwards symmetrically.
        assert_eq!(
            engine.correct(anchor_measured - measured / 2),
            anchor_ideal - ideal / 2
        );
    }

    #[test]
    fn unmeasured_half_period_skips_correction() {
        let mut engine = SyncEngine::new();
        let mut clock = VirtualClock::new();
        // Three rising-only edges engage the High state but never measure a
        // high half-period (measured_high stays 0).
        for i in 0..3u64 {
            engine.on_sync_edge(&mut clock, 10 + i * HALF_SECOND, true, 0, 0);
        }
        assert_eq!(engine.state(), SyncState::High);
        assert_eq!(engine.correct(123_456), 123_456);
    }

    #[test]
    fn reconfiguration_drops_back_to_uninit() {
        let (mut engine, _) = engaged_engine(10, HALF_SECOND, HALF_SECOND, 4);
        assert_ne!(engine.state(), SyncState::Uninit);
        engine.configure(10.0, 0.25);
        assert_eq!(engine.state(), SyncState::Uninit);
    }

    #[test]
    fn pending_reset_rebases_clock_and_timelines() {
        let mut engine = SyncEngine::new();
        let mut clock = VirtualClock::new();
        engine.on_sync_edge(&mut clock, 100, true, 0, 0);
        engine.on_sync_edge(&mut clock, 100 + HALF_SECOND, false, 0, 0);

        let target = 3_400_000_000u64;
        engine.set_pending_reset(Some(target));
        let stamp = engine.on_sync_edge(&mut clock, 100 + 2 * HALF_SECOND, true, 0x40, 0);
        assert_eq!(stamp, target);
        assert_eq!(clock.now(0x40), target);
        assert_eq!(engine.state(), SyncState::Uninit);

        // The next edges measure against the rebased timeline and re-engage.
        engine.on_sync_edge(&mut clock, target + HALF_SECOND, false, 0, 0);
        engine.on_sync_edge(&mut clock, target + 2 * HALF_SECOND, true, 0, 0);
        engine.on_sync_edge(&mut clock, target + 3 * HALF_SECOND, false, 0, 0);
        assert_eq!(engine.state(), SyncState::Low);
        assert_eq!(engine.correct(target + 3 * HALF_SECOND), target + 3 * HALF_SECOND);
    }

    #[test]
    fn idle_timeout_disengages() {
        let (mut engine, _) = engaged_engine(10, HALF_SECOND, HALF_SECOND, 3);
        engine.set_idle_timeout_ms(Some(5_000));
        engine.check_idle(4_999);
        assert_ne!(engine.state(), SyncState::Uninit);
        engine.check_idle(5_000);
        assert_eq!(engine.state(), SyncState::Uninit);
    }
}
