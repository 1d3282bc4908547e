//! Common types and constants shared across the capture, correction, and
//! comms pipeline.

/// Frequency of the hardware capture timers, in Hz. One internal tick is one
/// increment of the 16-bit counter running at this rate.
pub const MCU_HZ: u64 = 170_000_000;

/// Number of channels backed by a timer capture unit.
pub const TIMER_CHANNEL_COUNT: usize = 14;

/// Number of channels backed by the I²C GPIO expanders.
pub const GPIO_CHANNEL_COUNT: usize = 16;

/// Total addressable channels. Channels `0..TIMER_CHANNEL_COUNT` are timer
/// channels; the rest are expander channels.
pub const CHANNEL_COUNT: usize = TIMER_CHANNEL_COUNT + GPIO_CHANNEL_COUNT;

/// A single timestamped edge, packed into 64 bits.
///
/// Bit 0 carries the logical level of the line at the moment of capture
/// (`1` = high); bits 1..64 carry the time shifted left by one. Inside the
/// instrument the time field is in internal ticks; on the wire it is
/// UNIX-epoch nanoseconds. The packing is otherwise identical, so the same
/// type serves both, converted with [`EdgeStamp::to_unix`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct EdgeStamp(u64);

impl EdgeStamp {
    #[must_use]
    pub fn new(time: u64, level: bool) -> Self {
        Self((time << 1) | u64::from(level))
    }

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The time field, without the level bit.
    #[must_use]
    pub fn time(self) -> u64 {
        self.0 >> 1
    }

    /// The logical level of the line at the moment of capture.
    #[must_use]
    pub fn level(self) -> bool {
        self.0 & 1 != 0
    }

    /// Re-bases an internal-tick stamp onto UNIX-epoch nanoseconds,
    /// preserving the level bit.
    #[must_use]
    pub fn to_unix(self) -> Self {
        Self::new(internal_to_unix_ns(self.time()), self.level())
    }

    #[must_use]
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

/// Converts internal ticks to UNIX-epoch nanoseconds.
#[must_use]
pub fn internal_to_unix_ns(ticks: u64) -> u64 {
    (u128::from(ticks) * 1_000_000_000 / u128::from(MCU_HZ)) as u64
}

/// Converts UNIX-epoch nanoseconds to internal ticks.
#[must_use]
pub fn unix_ns_to_internal(ns: u64) -> u64 {
    (u128::from(ns) * u128::from(MCU_HZ) / 1_000_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_packs_level_into_lsb() {
        let stamp = EdgeStamp::new(0x1234, true);
        assert_eq!(stamp.raw(), (0x1234 << 1) | 1);
        assert_eq!(stamp.time(), 0x1234);
        assert!(stamp.level());

        let stamp = EdgeStamp::new(0x1234, false);
        assert_eq!(stamp.time(), 0x1234);
        assert!(!stamp.level());
    }

    #[test]
    fn stamp_survives_wire_bytes() {
        let stamp = EdgeStamp::new(1_700_000_000_000_000_000, true);
        assert_eq!(EdgeStamp::from_le_bytes(stamp.to_le_bytes()), stamp);
    }

    #[test]
    fn tick_conversion_is_inverse_within_one_tick() {
        for ticks in [0u64, 1, MCU_HZ, MCU_HZ * 3600, 0x0000_0000_1234_5678] {
            let back = unix_ns_to_internal(internal_to_unix_ns(ticks));
            assert!(ticks.abs_diff(back) <= 1, "ticks {ticks} came back as {back}");
        }
    }

    #[test]
    fn one_second_of_ticks_is_one_billion_ns() {
        assert_eq!(internal_to_unix_ns(MCU_HZ), 1_000_000_000);
        assert_eq!(unix_ns_to_internal(1_000_000_000), MCU_HZ);
    }
}
