//! ISR-side capture pipeline.
//!
//! Each enabled timer channel's capture event reads the latched counter
//! value, extends it to 64 bits against the virtual clock, folds in the SYNC
//! correction, encodes the line level into the LSB, and pushes the result
//! onto the channel's ring. The overflow handler replays every channel with
//! the epoch tie-break active before committing the new coarse value.

use crate::channel::{Channel, ChannelTable};
use crate::clock::VirtualClock;
use crate::hardware::{Gpio, HwTimer};
use crate::sync::SyncEngine;
use crate::types::{EdgeStamp, TIMER_CHANNEL_COUNT};

/// Services one channel's capture event, if any is pending.
///
/// Failure model: a capture is dropped silently when the ring is full or
/// locked; the foreground consumer must pace monitor emission to keep the
/// ring drained.
pub(crate) fn service_capture(
    clock: &mut VirtualClock,
    sync: &mut SyncEngine,
    channel: &mut Channel,
    timer: &mut dyn HwTimer,
    gpio: &dyn Gpio,
    overflow_pending: bool,
    now_ms: u32,
) {
    let Some(tc) = channel.timer_mut() else {
        return;
    };
    if !timer.acknowledge_capture(tc.capture) {
        return;
    }
    if tc.ring.is_locked() || tc.ring.len() >= tc.ring.capacity() {
        return;
    }

    let captured = timer.read_capture(tc.capture);
    let extended = clock.extend(captured, timer.read_counter(), overflow_pending);
    let level = gpio.read_pin(tc.port, tc.pin);

    let corrected = if tc.is_sync {
        sync.on_sync_edge(clock, extended, level, timer.read_counter(), now_ms)
    } else {
        sync.correct(extended)
    };

    tc.ring.push(EdgeStamp::new(corrected, level));
}

/// The counter overflow handler: replays any pending captures under the
/// epoch tie-break, then commits the new coarse value.
pub(crate) fn service_overflow(
    clock: &mut VirtualClock,
    sync: &mut SyncEngine,
    channels: &mut ChannelTable,
    timer: &mut dyn HwTimer,
    gpio: &dyn Gpio,
    now_ms: u32,
) {
    clock.begin_overflow();
    for id in 0..TIMER_CHANNEL_COUNT {
        if let Some(channel) = channels.get_mut(id) {
            service_capture(clock, sync, channel, timer, gpio, true, now_ms);
        }
    }
    clock.commit_overflow();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelMode, SignalProtocol};
    use crate::clock::TICKS_PER_OVERFLOW;
    use crate::hardware::sim::SimBoard;

    fn rig() -> (SimBoard, crate::hardware::Board, ChannelTable, VirtualClock, SyncEngine) {
        let sim = SimBoard::new();
        let mut board = sim.board();
        let mut channels = ChannelTable::new();
        channels
            .apply_config(
                2,
                ChannelMode::MonitorBoth,
                SignalProtocol::ThreeVoltThree,
                &mut *board.timer,
                &mut *board.gpio,
                &mut *board.expanders,
            )
            .unwrap();
        (sim, board, channels, VirtualClock::new(), SyncEngine::new())
    }

    #[test]
    fn capture_composes_level_and_extended_time() {
        let (sim, mut board, mut channels, mut clock, mut sync) = rig();
        sim.set_counter(0x0100);
        assert!(sim.edge(2, true));
        service_capture(
            &mut clock,
            &mut sync,
            channels.get_mut(2).unwrap(),
            &mut *board.timer,
            &*board.gpio,
            false,
            0,
        );
        let stamp = channels
            .get_mut(2)
            .unwrap()
            .timer_mut()
            .unwrap()
            .ring
            .pop()
            .unwrap();
        assert_eq!(stamp.time(), 0x0100);
        assert!(stamp.level());
    }

    #[test]
    fn no_pending_capture_is_a_no_op() {
        let (_sim, mut board, mut channels, mut clock, mut sync) = rig();
        service_capture(
            &mut clock,
            &mut sync,
            channels.get_mut(2).unwrap(),
            &mut *board.timer,
            &*board.gpio,
            false,
            0,
        );
        assert!(channels.get(2).unwrap().timer().unwrap().ring.is_empty());
    }

    #[test]
    fn capture_latched_before_wrap_is_replayed_into_the_old_epoch() {
        let (sim, mut board, mut channels, mut clock, mut sync) = rig();
        // Edge latched near the top of the counter; the wrap happens before
        // the capture interrupt is serviced.
        sim.set_counter(0xFFF0);
        assert!(sim.edge(2, true));
        sim.set_counter(0x0004);
        service_overflow(
            &mut clock,
            &mut sync,
            &mut channels,
            &mut *board.timer,
            &*board.gpio,
            0,
        );
        let stamp = channels
            .get_mut(2)
            .unwrap()
            .timer_mut()
            .unwrap()
            .ring
            .pop()
            .unwrap();
        assert_eq!(stamp.time(), 0xFFF0);
        assert_eq!(clock.now(0x0004), TICKS_PER_OVERFLOW + 0x0004);
    }

    #[test]
    fn capture_latched_after_wrap_is_replayed_into_the_new_epoch() {
        let (sim, mut board, mut channels, mut clock, mut sync) = rig();
        // The counter wrapped and then the edge latched, all before the
        // update handler ran.
        sim.set_counter(0x0002);
        assert!(sim.edge(2, true));
        sim.set_counter(0x0004);
        service_overflow(
            &mut clock,
            &mut sync,
            &mut channels,
            &mut *board.timer,
            &*board.gpio,
            0,
        );
        let stamp = channels
            .get_mut(2)
            .unwrap()
            .timer_mut()
            .unwrap()
            .ring
            .pop()
            .unwrap();
        assert_eq!(stamp.time(), TICKS_PER_OVERFLOW + 0x0002);
    }

    #[test]
    fn full_ring_drops_the_capture_but_clears_the_flag() {
        let (sim, mut board, mut channels, mut clock, mut sync) = rig();
        {
            let tc = channels.get_mut(2).unwrap().timer_mut().unwrap();
            for i in 0..tc.ring.capacity() as u64 {
                assert!(tc.ring.push(EdgeStamp::new(i, false)));
            }
        }
        sim.set_counter(10);
        assert!(sim.edge(2, true));
        service_capture(
            &mut clock,
            &mut sync,
            channels.get_mut(2).unwrap(),
            &mut *board.timer,
            &*board.gpio,
            false,
            0,
        );
        let tc = channels.get(2).unwrap().timer().unwrap();
        assert_eq!(tc.ring.len(), tc.ring.capacity());
        sim.with_state(|state| assert!(!state.capture_pending[2]));
    }

    #[test]
    fn locked_ring_drops_the_capture() {
        let (sim, mut board, mut channels, mut clock, mut sync) = rig();
        channels.get_mut(2).unwrap().timer_mut().unwrap().ring.lock();
        sim.set_counter(10);
        assert!(sim.edge(2, true));
        service_capture(
            &mut clock,
            &mut sync,
            channels.get_mut(2).unwrap(),
            &mut *board.timer,
            &*board.gpio,
            false,
            0,
        );
        let tc = channels.get(2).unwrap().timer().unwrap();
        assert!(tc.ring.is_empty());
        tc.ring.unlock();
    }

    #[test]
    fn sync_channel_stamps_follow_the_ideal_timeline() {
        let (sim, mut board, mut channels, mut clock, mut sync) = rig();
        channels
            .apply_config(
                0,
                ChannelMode::MonitorBoth,
                SignalProtocol::ThreeVoltThree,
                &mut *board.timer,
                &mut *board.gpio,
                &mut *board.expanders,
            )
            .unwrap();
        assert!(channels.set_sync_channel(Some(0)));
        let target = 1_000_000u64;
        sync.set_pending_reset(Some(target));

        sim.set_counter(0x0123);
        assert!(sim.edge(0, true));
        service_capture(
            &mut clock,
            &mut sync,
            channels.get_mut(0).unwrap(),
            &mut *board.timer,
            &*board.gpio,
            false,
            0,
        );
        let stamp = channels
            .get_mut(0)
            .unwrap()
            .timer_mut()
            .unwrap()
            .ring
            .pop()
            .unwrap();
        assert_eq!(stamp.time(), target);
        assert_eq!(clock.now(0x0123), target);
    }
}
