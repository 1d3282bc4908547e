//! Frequency and duty-cycle estimation from a channel's captured edge
//! stream.
//!
//! The read is destructive: the channel's ring is drained as part of the
//! computation, so a channel being measured does not also emit monitor
//! records. The last estimate is cached per channel so a query landing
//! between refills still gets an answer.

use crate::channel::Channel;
use crate::types::MCU_HZ;

/// Edges required in the ring before a fresh estimate is attempted.
pub const FREQ_MIN_EDGES: usize = 10;

/// Age after which a cached estimate is no longer served.
pub const FREQ_CACHE_MAX_AGE_MS: u32 = 30_000;

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Measurement {
    pub frequency_hz: f64,
    pub duty_cycle_pct: f64,
}

/// Estimates the frequency and duty cycle of the signal on a timer channel.
///
/// Returns the cached estimate when fewer than [`FREQ_MIN_EDGES`] stamps are
/// buffered and the cache is younger than [`FREQ_CACHE_MAX_AGE_MS`];
/// `None` when no estimate can be produced at all.
pub fn estimate(channel: &mut Channel, now_ms: u32) -> Option<Measurement> {
    let cache = channel.freq_cache;
    let Some(tc) = channel.timer_mut() else {
        return None;
    };

    if tc.ring.len() < FREQ_MIN_EDGES {
        if now_ms.wrapping_sub(cache.calculated_at_ms) > FREQ_CACHE_MAX_AGE_MS {
            return None;
        }
        return match (cache.frequency_hz, cache.duty_cycle_pct) {
            (Some(frequency_hz), Some(duty_cycle_pct)) => Some(Measurement {
                frequency_hz,
                duty_cycle_pct,
            }),
            _ => None,
        };
    }

    // Gate the producer out while the ring is drained.
    tc.ring.lock();

    let mut previous_rising: Option<u64> = None;
    let mut pending_fall: Option<u64> = None;
    let mut period_sum = 0u64;
    let mut risen_time_sum = 0u64;
    let mut cycles = 0u64;

    while let Some(stamp) = tc.ring.pop() {
        let t = stamp.time();
        if stamp.level() {
            // Rising edge: commit the cycle that just closed. A trailing
            // falling edge with no closing rising edge is never committed.
            if let Some(rise) = previous_rising {
                period_sum += t.saturating_sub(rise);
                if let Some(fall) = pending_fall {
                    risen_time_sum += fall.saturating_sub(rise);
                }
                cycles += 1;
            }
            previous_rising = Some(t);
            pending_fall = None;
        } else if previous_rising.is_some() {
            // Leading falling edges before the first rising edge are skipped.
            pending_fall = Some(t);
        }
    }

    tc.ring.unlock();

    if cycles == 0 || period_sum == 0 {
        return None;
    }

    let frequency_hz = MCU_HZ as f64 * cycles as f64 / period_sum as f64;
    let duty_cycle_pct = 100.0 * risen_time_sum as f64 / period_sum as f64;
    channel.freq_cache.frequency_hz = Some(frequency_hz);
    channel.freq_cache.duty_cycle_pct = Some(duty_cycle_pct);
    channel.freq_cache.calculated_at_ms = now_ms;

    Some(Measurement {
        frequency_hz,
        duty_cycle_pct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelMode, ChannelTable, SignalProtocol};
    use crate::types::EdgeStamp;

    /// Loads `cycles` periods of a square wave onto channel 7's ring.
    fn load_square_wave(
        table: &mut ChannelTable,
        start: u64,
        period_ticks: u64,
        high_ticks: u64,
        cycles: usize,
    ) {
        let channel = table.get_mut(7).unwrap();
        channel.mode = ChannelMode::Input;
        channel.protocol = SignalProtocol::ThreeVoltThree;
        let tc = channel.timer_mut().unwrap();
        let mut t = start;
        for _ in 0..cycles {
            tc.ring.push(EdgeStamp::new(t, true));
            tc.ring.push(EdgeStamp::new(t + high_ticks, false));
            t += period_ticks;
        }
    }

    #[test]
    fn recovers_frequency_and_duty_of_a_square_wave() {
        let mut table = ChannelTable::new();
        // 1 kHz at 25 % duty: period 170_000 ticks, high for 42_500.
        load_square_wave(&mut table, 1000, 170_000, 42_500, 80);
        let measurement = estimate(table.get_mut(7).unwrap(), 0).unwrap();
        assert!((measurement.frequency_hz - 1000.0).abs() < 1e-6);
        assert!((measurement.duty_cycle_pct - 25.0).abs() < 1e-6);
        // Destructive read: the ring is empty afterwards and unlocked.
        let tc = table.get(7).unwrap().timer().unwrap();
        assert!(tc.ring.is_empty());
        assert!(!tc.ring.is_locked());
    }

    #[test]
    fn leading_falling_edge_is_skipped() {
        let mut table = ChannelTable::new();
        {
            let tc = table.get_mut(7).unwrap().timer_mut().unwrap();
            tc.ring.push(EdgeStamp::new(100, false));
        }
        load_square_wave(&mut table, 1000, 170_000, 85_000, 40);
        let measurement = estimate(table.get_mut(7).unwrap(), 0).unwrap();
        assert!((measurement.frequency_hz - 1000.0).abs() < 1e-6);
        assert!((measurement.duty_cycle_pct - 50.0).abs() < 1e-6);
    }

    #[test]
    fn short_ring_serves_the_cache_until_it_expires() {
        let mut table = ChannelTable::new();
        load_square_wave(&mut table, 0, 170_000, 85_000, 40);
        let first = estimate(table.get_mut(7).unwrap(), 1_000).unwrap();

        // Ring now empty: the cached value is served while fresh.
        let cached = estimate(table.get_mut(7).unwrap(), 10_000).unwrap();
        assert_eq!(cached, first);

        // Past the age limit the cache is refused.
        assert!(estimate(table.get_mut(7).unwrap(), 1_000 + FREQ_CACHE_MAX_AGE_MS + 1).is_none());
    }

    #[test]
    fn too_few_edges_with_no_cache_yields_nothing() {
        let mut table = ChannelTable::new();
        load_square_wave(&mut table, 0, 170_000, 85_000, 3);
        assert!(estimate(table.get_mut(7).unwrap(), FREQ_CACHE_MAX_AGE_MS + 1).is_none());
    }

    #[test]
    fn expander_channels_cannot_be_measured() {
        let mut table = ChannelTable::new();
        assert!(estimate(table.get_mut(20).unwrap(), 0).is_none());
    }
}
