//! # chorus-audio
//!
//! Audio routing between the shared virtual output and individual
//! Bluetooth speaker sinks, implemented on top of PulseAudio's `pactl`.
//!
//! The orchestrator consumes this crate through the [`AudioRouter`] trait:
//! loopback routes are created and destroyed idempotently, keyed by a sink
//! name derived from the speaker's address. [`PulseRouter`] is the
//! production implementation; [`setup`] prepares the daemon and the shared
//! `virtual_out` null sink every route feeds from.
//!
//! Per-sink volume, balance, and mute helpers round out the control
//! surface.

pub mod error;
pub mod pulse;
pub mod router;
pub mod volume;

pub use error::{AudioError, Result};
pub use pulse::{setup, PulseRouter, VIRTUAL_SINK};
pub use router::AudioRouter;
pub use volume::{set_sink_mute, set_sink_volume, split_volume};
