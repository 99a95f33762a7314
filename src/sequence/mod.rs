//! Sequence model: rows, steps, and ordered sequences.
//!
//! A sequence is read once at run start (load, inline sub-sequences, validate,
//! ramp-expand) and is read-only afterwards. Insertion order is execution
//! order.
//!
//! # Pipeline
//!
//! ```text
//! SequenceSource --rows--> loader::load --> library::expand_subsequences
//!     --> validate::validate_commands --> ramp::expand_ramps --> Scheduler
//! ```

pub mod args;
pub mod library;
pub mod loader;
pub mod ramp;
pub mod validate;

pub use args::{parse_arguments, ArgValue};
pub use library::SequenceLibrary;
pub use loader::{load, Row, SequenceSource};
pub use ramp::{expand_ramp, expand_ramps, SeedTable};
pub use validate::validate_commands;

use crate::error::RowRef;
use serde::Serialize;
use std::time::Duration;

/// Reserved pseudo-instrument: wait only, no dispatch.
pub const SLEEP: &str = "sleep";
/// Reserved pseudo-instrument: inline a saved sequence at load time.
pub const SEQUENCE: &str = "sequence";

/// One scheduled instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    /// Seconds to wait after dispatch before the next step may start.
    pub relative_time: f64,
    /// Lower-cased instrument id.
    pub instrument_id: String,
    /// Command name as written, trimmed.
    pub command: String,
    /// Raw `Argument` cell; `None` when the cell was absent.
    pub argument_text: Option<String>,
    /// Where the step came from, for error messages.
    #[serde(skip)]
    pub origin: RowRef,
}

impl Step {
    /// Build a step, normalizing the instrument id and command.
    pub fn new(
        relative_time: f64,
        instrument_id: &str,
        command: &str,
        argument_text: Option<&str>,
        origin: RowRef,
    ) -> Self {
        Self {
            relative_time,
            instrument_id: instrument_id.trim().to_lowercase(),
            command: command.trim().to_string(),
            argument_text: argument_text.map(str::to_string),
            origin,
        }
    }

    /// Parsed arguments, `None` meaning "no arguments".
    pub fn arguments(&self) -> Option<Vec<ArgValue>> {
        parse_arguments(self.argument_text.as_deref())
    }

    /// Wait after dispatch. Times past what a `Duration` holds saturate.
    pub fn wait(&self) -> Duration {
        match Duration::try_from_secs_f64(self.relative_time) {
            Ok(wait) => wait,
            Err(_) if self.relative_time > 0.0 => Duration::MAX,
            Err(_) => Duration::ZERO,
        }
    }

    /// True for the `sleep` pseudo-instrument.
    pub fn is_sleep(&self) -> bool {
        self.instrument_id == SLEEP
    }

    /// True for a `sequence` row not yet inlined.
    pub fn is_sequence_ref(&self) -> bool {
        self.instrument_id == SEQUENCE
    }

    /// Short human-readable label used in status text and logs.
    pub fn describe(&self) -> String {
        match self.argument_text.as_deref() {
            Some(text) if !args::is_placeholder(Some(text)) => {
                format!("{} {} {}", self.instrument_id, self.command, text.trim())
            }
            _ => format!("{} {}", self.instrument_id, self.command),
        }
    }
}

/// Ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sequence {
    /// Label of the file or saved sequence this was read from.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

impl Sequence {
    /// Sequence named `name` holding `steps`.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    /// Distinct instruments that need a live binding, in first-use order.
    pub fn referenced_instruments(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if step.is_sleep() || step.is_sequence_ref() {
                continue;
            }
            if !seen.contains(&step.instrument_id) {
                seen.push(step.instrument_id.clone());
            }
        }
        seen
    }

    /// Absolute start offset of each step, in seconds from run start.
    pub fn timeline(&self) -> Vec<f64> {
        let mut offsets = Vec::with_capacity(self.steps.len());
        let mut t = 0.0;
        for step in &self.steps {
            offsets.push(t);
            t += step.relative_time;
        }
        offsets
    }

    /// Nominal run duration, ignoring dispatch latency and pauses.
    pub fn total_duration(&self) -> f64 {
        self.steps.iter().map(|s| s.relative_time).sum()
    }
}

impl<'a> IntoIterator for &'a Sequence {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

#[cfg(test)]
pub(crate) fn step(time: f64, instrument: &str, command: &str, argument: &str) -> Step {
    Step::new(
        time,
        instrument,
        command,
        Some(argument),
        RowRef {
            source: "test".to_string(),
            row: 0,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_normalizes_instrument_and_command() {
        let s = step(1.0, "  DC_Source ", " set_output ", "on");
        assert_eq!(s.instrument_id, "dc_source");
        assert_eq!(s.command, "set_output");
        assert_eq!(s.describe(), "dc_source set_output on");
    }

    #[test]
    fn test_timeline_is_cumulative() {
        let seq = Sequence::new(
            "t",
            vec![
                step(0.0, "sleep", "-", "-"),
                step(5.0, "dc_source", "set_output", "on"),
                step(2.5, "dc_source", "set_voltage", "12"),
            ],
        );
        assert_eq!(seq.timeline(), vec![0.0, 0.0, 5.0]);
        assert_eq!(seq.total_duration(), 7.5);
        assert_eq!(seq.referenced_instruments(), vec!["dc_source".to_string()]);
    }

    #[test]
    fn test_wait_saturates_instead_of_panicking() {
        assert_eq!(step(1e20, "sleep", "-", "-").wait(), Duration::MAX);
        assert_eq!(step(f64::INFINITY, "sleep", "-", "-").wait(), Duration::MAX);
        assert_eq!(step(-3.0, "sleep", "-", "-").wait(), Duration::ZERO);
        assert_eq!(step(f64::NAN, "sleep", "-", "-").wait(), Duration::ZERO);
        assert_eq!(
            step(2.5, "sleep", "-", "-").wait(),
            Duration::from_millis(2500)
        );
    }
}
