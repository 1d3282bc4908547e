use anyhow::{Context, Result, bail};
use chrono::DateTime;
use clap::{Parser, Subcommand, ValueEnum, ValueHint};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use strum_macros::Display;

use midds_core::channel::{ChannelMode, SignalProtocol};
use midds_core::hardware::sim::SimBoard;
use midds_core::instrument::Midds;
use midds_core::protocol::{self, DecodeError, Frame};
use midds_core::types::MCU_HZ;

#[derive(Debug, Parser)]
#[command(name = "midds_core")]
#[command(about = "A CLI for exercising the MIDDS sampler core against a simulated board.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Output information about the instrument build, in JSON format.
    Info {
        /// The board implementation to run the core against.
        #[arg(long, default_value_t = BoardType::default())]
        board: BoardType,
    },

    /// Run the core for a while, feeding synthetic square waves into the
    /// configured channels, and print the monitor records and frequency
    /// estimates the instrument streams back.
    Simulate {
        /// Path to the simulation configuration file. When omitted, a single
        /// 1 kHz, 50 % duty stimulus is monitored on channel 3.
        ///
        /// The format is documented in [`SimulationConfig`]; JSON examples
        /// are available in the source distribution's `sample_config`
        /// directory.
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,

        /// The span of instrument time to simulate. Can be specified in any
        /// format allowed by [`humantime::parse_duration`].
        #[arg(long)]
        duration: humantime::Duration,

        /// The board implementation to run the core against.
        #[arg(long, default_value_t = BoardType::default())]
        board: BoardType,
    },
}

#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
#[strum(serialize_all = "kebab-case")]
enum BoardType {
    #[default]
    Sim,
}

/// One synthetic stimulus and the channel configuration it feeds.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SimulatedChannel {
    /// Timer channel the stimulus drives, `0..14`.
    pub id: u8,
    pub mode: ChannelMode,
    pub protocol: SignalProtocol,
    pub stimulus_hz: f64,
    pub stimulus_duty_pct: f64,
}

/// Reference-pulse definition forwarded to the instrument as SyncSettings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SyncReference {
    /// Timer channel carrying the pulse; must also appear in `channels`
    /// with `MonitorBoth` mode.
    pub channel: u8,
    pub frequency_hz: f64,
    pub duty_cycle_pct: f64,
    /// UNIX nanoseconds the first rising edge is aligned to; `0` leaves the
    /// instrument on its free-running timeline.
    pub start_time_ns: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SimulationConfig {
    pub channels: Vec<SimulatedChannel>,
    #[serde(default)]
    pub sync: Option<SyncReference>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            channels: vec![SimulatedChannel {
                id: 3,
                mode: ChannelMode::MonitorBoth,
                protocol: SignalProtocol::ThreeVoltThree,
                stimulus_hz: 1_000.0,
                stimulus_duty_pct: 50.0,
            }],
            sync: None,
        }
    }
}

struct Stimulus {
    channel: usize,
    high_ticks: u64,
    low_ticks: u64,
    next_edge_tick: u64,
    level: bool,
}

/// Host-side reassembly of the instrument's outbound byte stream.
struct FrameScanner {
    buffer: Vec<u8>,
}

impl FrameScanner {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < self.buffer.len() {
            match protocol::decode(&self.buffer[offset..]) {
                Ok((frame, consumed)) => {
                    frames.push(frame);
                    offset += consumed;
                }
                Err(DecodeError::NotEnoughData) => break,
                Err(DecodeError::SyncSequenceNok) => offset += 1,
                Err(DecodeError::ErrorDecoding { consumed, .. }) => offset += consumed,
            }
        }
        self.buffer.drain(..offset);
        frames
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SimulationConfig> {
    match path {
        Some(path) => serde_json::from_str(fs::read_to_string(path)?.as_str())
            .with_context(|| format!("Error while parsing config file at {}", path.display())),
        None => Ok(SimulationConfig::default()),
    }
}

fn print_frame(frame: &Frame) {
    match frame {
        Frame::Monitor { channel, stamps } => {
            for stamp in stamps {
                let time = DateTime::from_timestamp_nanos(stamp.time() as i64);
                println!(
                    "ch{:02} {} {}",
                    channel,
                    if stamp.level() { "rise" } else { "fall" },
                    time.format("%Y-%m-%dT%H:%M:%S%.9fZ")
                );
            }
        }
        Frame::Frequency {
            channel,
            frequency_hz,
            duty_cycle_pct,
            ..
        } => {
            println!("ch{channel:02} frequency {frequency_hz:.3} Hz, duty {duty_cycle_pct:.2} %");
        }
        Frame::Error { message } => println!("instrument error: {message}"),
        _ => {}
    }
}

#[allow(clippy::too_many_lines)]
fn simulate(config: &SimulationConfig, duration: std::time::Duration) -> Result<()> {
    let sim = SimBoard::new();
    let mut midds = Midds::new(sim.board())?;
    let mut scanner = FrameScanner::new();

    midds.on_receive(&protocol::encode(&Frame::Connect));
    midds.poll();
    if !midds.is_connected() {
        bail!("The instrument refused the connection.");
    }
    sim.take_tx();

    let mut stimuli = Vec::new();
    for entry in &config.channels {
        if usize::from(entry.id) >= midds_core::types::TIMER_CHANNEL_COUNT {
            bail!("Channel {} has no timer capture unit.", entry.id);
        }
        if entry.stimulus_hz <= 0.0 {
            bail!("Channel {} stimulus frequency must be positive.", entry.id);
        }
        midds.on_receive(&protocol::encode(&Frame::ChannelSettings {
            channel: entry.id as i8,
            mode: entry.mode,
            protocol: entry.protocol,
        }));
        midds.poll();
        let period = MCU_HZ as f64 / entry.stimulus_hz;
        let high = (period * entry.stimulus_duty_pct / 100.0) as u64;
        stimuli.push(Stimulus {
            channel: usize::from(entry.id),
            high_ticks: high.max(1),
            low_ticks: (period as u64).saturating_sub(high).max(1),
            next_edge_tick: 0,
            level: false,
        });
    }
    if let Some(sync) = &config.sync {
        midds.on_receive(&protocol::encode(&Frame::SyncSettings {
            channel: sync.channel as i8,
            frequency_hz: sync.frequency_hz,
            duty_cycle_pct: sync.duty_cycle_pct,
            time_ns: sync.start_time_ns,
        }));
        midds.poll();
    }
    for frame in scanner.feed(&sim.take_tx()) {
        print_frame(&frame);
    }

    let total_ms = u64::try_from(duration.as_millis()).context("Duration too long")?;
    let ticks_per_ms = MCU_HZ / 1_000;
    let progress_bar = ProgressBar::new(total_ms)
        .with_style(ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40} {msg}",
        )?)
        .with_message("Simulating...");

    let mut cursor = 0u64;
    for ms in 0..total_ms {
        let ms_end = (ms + 1) * ticks_per_ms;
        loop {
            let Some(next) = stimuli
                .iter()
                .map(|stimulus| stimulus.next_edge_tick)
                .min()
                .filter(|&tick| tick < ms_end)
            else {
                break;
            };
            advance_to(&sim, &mut midds, &mut cursor, next);
            for stimulus in &mut stimuli {
                if stimulus.next_edge_tick == next {
                    stimulus.level = !stimulus.level;
                    if sim.edge(stimulus.channel, stimulus.level) {
                        midds.on_capture_interrupt(stimulus.channel);
                    }
                    stimulus.next_edge_tick += if stimulus.level {
                        stimulus.high_ticks
                    } else {
                        stimulus.low_ticks
                    };
                }
            }
        }
        advance_to(&sim, &mut midds, &mut cursor, ms_end);
        sim.advance_ms(1);
        midds.poll();
        for frame in scanner.feed(&sim.take_tx()) {
            print_frame(&frame);
        }
        progress_bar.set_position(ms + 1);
    }

    // Close with a frequency estimate for every measurable channel.
    for entry in &config.channels {
        if matches!(entry.mode, ChannelMode::Input | ChannelMode::Frequency) {
            midds.on_receive(&protocol::encode(&Frame::Frequency {
                channel: entry.id as i8,
                frequency_hz: 0.0,
                duty_cycle_pct: 0.0,
                time_ns: 0,
            }));
            midds.poll();
        }
    }
    for frame in scanner.feed(&sim.take_tx()) {
        print_frame(&frame);
    }

    progress_bar.finish_with_message("Simulation complete");
    Ok(())
}

/// Advances the simulated counter to an absolute tick, firing the update
/// interrupt at every 16-bit wrap.
fn advance_to(sim: &SimBoard, midds: &mut Midds, cursor: &mut u64, target: u64) {
    while *cursor < target {
        let step = (target - *cursor).min(0x8000) as u16;
        if sim.advance_counter(step) {
            midds.on_update_interrupt();
        }
        *cursor += u64::from(step);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Info { board } => {
            let BoardType::Sim = board;
            let sim = SimBoard::new();
            let midds = Midds::new(sim.board())?;
            println!("{}", &serde_json::to_string_pretty(&midds.info())?);
            Ok(())
        }
        Command::Simulate {
            config,
            duration,
            board,
        } => {
            let BoardType::Sim = board;
            let config = load_config(config.as_ref())?;
            if config.channels.is_empty() {
                bail!("The simulation needs at least one channel.");
            }
            simulate(&config, *duration)
        }
    }
}
