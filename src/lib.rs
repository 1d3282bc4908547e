//! Rust library and CLI implementing the core of the MIDDS (Multi-Input
//! Digital-Data Sampler): an embedded measurement instrument that stamps the
//! edges of up to fourteen digital input channels against a common monotonic
//! time base, corrects those stamps toward an external reference pulse
//! (SYNC) to produce UNIX-epoch-nanosecond timestamps, and streams them over
//! a byte-framed host link alongside on-demand state and frequency queries.
//!
//! ## How to use
//!
//! The core is hardware-free. Everything it needs from the outside world is
//! described by the capability traits in [`hardware`]; the embedding builds
//! a [`hardware::Board`] from its adapters and hands it to
//! [`instrument::Midds::new`]. Broadly speaking, the pieces fall into the
//! following categories:
//!
//! ### Time base
//!
//! A 16-bit hardware counter is extended to a 64-bit monotonic internal time
//! by [`clock`], and linearised against the external reference pulse by
//! [`sync`]. [`types`] converts between internal ticks and UNIX nanoseconds.
//!
//! ### Capture
//!
//! [`capture`] is the ISR-side producer: each enabled channel's capture
//! event becomes a packed level-and-timestamp word on that channel's ring
//! ([`ring`]). [`channel`] holds the per-channel configuration state machine
//! and [`frequency`] estimates frequency and duty cycle from a captured edge
//! stream.
//!
//! ### Host link
//!
//! [`protocol`] is the byte-framed codec and [`comms`] the cooperative
//! foreground loop: frame scanning, command dispatch, monitor pacing, and
//! transmit retry.
//!
//! ## Examples
//!
//! For now, the best example of a complete instrument is probably the
//! `midds_core` CLI implementation, which runs the core against the fully
//! simulated board in [`hardware::sim`].
//!
//! ## API stability
//!
//! We follow the [Semantic Versioning 2.0.0](https://semver.org/) standard.
//! The capability traits are expected to change as more boards are brought
//! up, so no 1.x.x release is planned yet.

pub mod capture;
pub mod channel;
pub mod clock;
pub mod comms;
pub mod frequency;
pub mod hardware;
pub mod instrument;
pub mod protocol;
pub mod ring;
pub mod sync;
pub mod types;
