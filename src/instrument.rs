//! The instrument root.
//!
//! All state lives in one owned struct built at boot; ISR handlers are plain
//! methods the embedding invokes on hardware events, and the cooperative
//! foreground loop is [`Midds::poll`]. Nothing here blocks.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::capture;
use crate::channel::{ChannelTable, TIMESTAMP_RING_CAPACITY};
use crate::clock::VirtualClock;
use crate::comms::CommsState;
use crate::hardware::Board;
use crate::sync::SyncEngine;
use crate::types::{GPIO_CHANNEL_COUNT, MCU_HZ, TIMER_CHANNEL_COUNT};

/// Static description of the instrument, for hosts and tooling.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct InstrumentInfo {
    pub model: String,
    pub firmware_version: String,
    pub mcu_hz: u64,
    pub timer_channels: usize,
    pub gpio_channels: usize,
    pub timestamp_ring_capacity: usize,
}

impl Display for InstrumentInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&serde_json::to_string(&self).unwrap())
    }
}

/// The Multi-Input Digital-Data Sampler core.
pub struct Midds {
    pub(crate) clock: VirtualClock,
    pub(crate) sync: SyncEngine,
    pub(crate) channels: ChannelTable,
    pub(crate) comms: CommsState,
    pub(crate) board: Board,
    reboot_count: u32,
}

impl Midds {
    /// Builds the power-on state and programs the hardware behind it.
    pub fn new(board: Board) -> Result<Self> {
        let mut midds = Self {
            clock: VirtualClock::new(),
            sync: SyncEngine::new(),
            channels: ChannelTable::new(),
            comms: CommsState::new(),
            board,
            reboot_count: 0,
        };
        midds.boot_hardware()?;
        Ok(midds)
    }

    fn boot_hardware(&mut self) -> Result<()> {
        self.board.timer.start();
        // Quiesce every capture unit, apply the configuration, latch the
        // signal electronics, then let the per-mode interrupt enables stand.
        for channel in 0..TIMER_CHANNEL_COUNT {
            self.board.timer.enable_capture_irq(channel, false);
        }
        self.channels.reprogram_all(
            &mut *self.board.timer,
            &mut *self.board.gpio,
            &mut *self.board.expanders,
        )?;
        self.channels.push_shift_registers(&mut *self.board.shift)?;
        self.board.timer.enable_update_irq(true);
        Ok(())
    }

    #[must_use]
    pub fn info(&self) -> InstrumentInfo {
        InstrumentInfo {
            model: "MIDDS".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            mcu_hz: MCU_HZ,
            timer_channels: TIMER_CHANNEL_COUNT,
            gpio_channels: GPIO_CHANNEL_COUNT,
            timestamp_ring_capacity: TIMESTAMP_RING_CAPACITY,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.comms.connected
    }

    #[must_use]
    pub fn reboot_count(&self) -> u32 {
        self.reboot_count
    }

    /// Current internal time.
    #[must_use]
    pub fn now_internal(&self) -> u64 {
        self.clock.now(self.board.timer.read_counter())
    }

    /// Stale-reference guard for the SYNC engine; `None` disables it.
    pub fn set_sync_idle_timeout_ms(&mut self, window: Option<u32>) {
        self.sync.set_idle_timeout_ms(window);
    }

    /// Capture-event handler for one timer channel.
    pub fn on_capture_interrupt(&mut self, channel: usize) {
        let now_ms = self.board.tick.now_ms();
        if let Some(ch) = self.channels.get_mut(channel) {
            capture::service_capture(
                &mut self.clock,
                &mut self.sync,
                ch,
                &mut *self.board.timer,
                &*self.board.gpio,
                false,
                now_ms,
            );
        }
    }

    /// Counter-overflow handler: replays pending captures under the epoch
    /// tie-break, then commits the next coarse value.
    pub fn on_update_interrupt(&mut self) {
        let now_ms = self.board.tick.now_ms();
        capture::service_overflow(
            &mut self.clock,
            &mut self.sync,
            &mut self.channels,
            &mut *self.board.timer,
            &*self.board.gpio,
            now_ms,
        );
    }

    /// Transport receive callback; bytes that do not fit are dropped whole.
    pub fn on_receive(&mut self, bytes: &[u8]) {
        self.comms.input.push_all(bytes);
    }

    /// Full reinitialisation, as close to a power cycle as the embedding
    /// allows. Raised by a Disconnect frame; no partial state survives.
    pub fn reboot(&mut self) {
        self.clock = VirtualClock::new();
        self.sync = SyncEngine::new();
        self.channels = ChannelTable::new();
        self.comms = CommsState::new();
        self.reboot_count += 1;
        // A failing reboot leaves the hardware deconfigured, which is still
        // closer to power-on than keeping the old session alive.
        let _ = self.boot_hardware();
    }
}
