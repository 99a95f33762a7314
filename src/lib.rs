//! Core library for the bench sequencer.
//!
//! A sequence is an ordered table of timed command rows. Each row names an
//! instrument on the bench, a command from that instrument's capability
//! table, arguments, and how long to wait after dispatching. The library
//! loads and validates sequences, inlines saved sub-sequences, expands
//! setpoint ramps, and drives the result against bound instruments under
//! operator pause, skip and abort. A failed or aborted run replays the
//! configured safe-exit sequence.

pub mod config;
pub mod error;
pub mod execution;
pub mod instrument;
pub mod logging;
pub mod sequence;

pub use config::Settings;
pub use error::{BenchError, BenchResult};
