//! Custom error types for the sequencer.
//!
//! This module defines the primary error type, `BenchError`, together with the
//! structured error kinds that the sequence pipeline produces. Using the
//! `thiserror` crate, it provides a centralized and consistent way to report
//! problems from loading a sequence file all the way to driving hardware.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: Batched, pre-execution problems (negative times, unknown
//!   instruments or commands, wrong argument counts). Every offending row of a
//!   given kind is listed so the operator can fix the file in one pass.
//! - **`CyclicSequence`**: A saved sub-sequence references itself, directly or
//!   through other saved sequences.
//! - **`Connection`**: One or more instruments required by the sequence could not
//!   be bound before the run started.
//! - **`Dispatch`**: An instrument operation failed while the run was executing.
//!   Always fatal to the current run.
//! - **`Config`**: Configuration could not be loaded or failed validation.
//! - **`Source`** / **`Io`** / **`Yaml`**: Reading or writing sequence files.
//!
//! Argument parsing never fails; malformed literals degrade to plain strings.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the sequencer error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Every failure the sequencer reports.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Batched pre-execution problems of one kind.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A saved sub-sequence reaches itself again.
    #[error("Cyclic sub-sequence reference: {}", .chain.join(" -> "))]
    CyclicSequence {
        /// Sequence names from the top level down to the repeated one.
        chain: Vec<String>,
    },

    /// Instruments could not be bound before the run.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// An instrument operation failed mid-run.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Id is not in the capability registry.
    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    /// Command is not in the instrument's capability table.
    #[error("Command '{command}' is not permitted for instrument '{instrument}'")]
    UnknownCommand {
        /// Instrument id as written in the sequence.
        instrument: String,
        /// Rejected command name.
        command: String,
    },

    /// A sequence file could not be opened or parsed.
    #[error("Failed to read sequence source {path}: {message}")]
    Source {
        /// File that failed.
        path: PathBuf,
        /// Underlying reader error.
        message: String,
    },

    /// Filesystem error outside sequence parsing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Saved sequence document is not valid YAML for a sequence.
    #[error("Sequence document error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// No safe-exit attempt was clean.
    #[error("Safe-exit sequence failed after {attempts} attempts")]
    SafeExitExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// The category of a batched validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// `Time` is negative, not a number, or too large to wait for.
    Time,
    /// `Instrument` is not a registry key nor a reserved id.
    Instrument,
    /// A `sequence` row names a saved sequence that does not exist.
    Sequence,
    /// `Command` is not permitted for the row's instrument.
    Command,
    /// The parsed argument count is outside the command's arity.
    Arity,
    /// A numeric or on/off parameter received an incompatible token.
    ArgumentKind,
}

impl ViolationKind {
    fn describe(&self) -> &'static str {
        match self {
            ViolationKind::Time => "all values in 'Time' must be numbers greater than or equal to 0",
            ViolationKind::Instrument => "unknown value in 'Instrument'",
            ViolationKind::Sequence => "saved sequence not found",
            ViolationKind::Command => "instrument and command do not match",
            ViolationKind::Arity => "wrong number of arguments for command",
            ViolationKind::ArgumentKind => "argument type does not match command parameter",
        }
    }
}

/// Location of a row in the file (or saved sequence) it was read from.
///
/// `row` is 1-based and includes the header line, matching what a spreadsheet
/// shows next to the offending cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowRef {
    /// File name or saved sequence label.
    pub source: String,
    /// 1-based line number, header included.
    pub row: usize,
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.row)
    }
}

/// One offending row, with an optional detail message.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// Where the row came from.
    pub at: RowRef,
    /// What is wrong with it; may be empty.
    pub detail: String,
}

/// All violations of a single kind found in one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The check that failed.
    pub kind: ViolationKind,
    /// Every offending row, in sequence order.
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Error of `kind` covering `violations`.
    pub fn new(kind: ViolationKind, violations: Vec<Violation>) -> Self {
        Self { kind, violations }
    }

    /// Row numbers of every offending row, in sequence order.
    pub fn rows(&self) -> Vec<usize> {
        self.violations.iter().map(|v| v.at.row).collect()
    }

    fn rows_label(&self) -> String {
        let rows: Vec<String> = self.violations.iter().map(|v| v.at.to_string()).collect();
        format!("[{}]", rows.join(", "))
    }

    fn summary(&self) -> String {
        let details: Vec<&str> = self
            .violations
            .iter()
            .map(|v| v.detail.as_str())
            .filter(|d| !d.is_empty())
            .collect();
        details.join("; ")
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation error ({})", self.kind.describe())?;
        let summary = self.summary();
        if !summary.is_empty() {
            write!(f, ": {}", summary)?;
        }
        write!(f, ". Check rows {}", self.rows_label())
    }
}

impl std::error::Error for ValidationError {}

/// Raised when an instrument operation fails during a run.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Dispatch of '{command}' to '{instrument}' failed: {message}")]
pub struct DispatchError {
    /// Instrument that received the command.
    pub instrument: String,
    /// Command that failed.
    pub command: String,
    /// Driver-provided reason.
    pub message: String,
}

impl DispatchError {
    /// Error for `command` on `instrument`.
    pub fn new(instrument: &str, command: &str, message: impl Into<String>) -> Self {
        Self {
            instrument: instrument.to_string(),
            command: command.to_string(),
            message: message.into(),
        }
    }
}

/// Failure to bind one or more instrument handles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// One instrument did not answer or has no driver.
    #[error("Failed to connect to '{instrument}': {message}")]
    Failed {
        /// Instrument id.
        instrument: String,
        /// Transport or driver reason.
        message: String,
    },

    /// Referenced instruments left unbound, all listed at once.
    #[error("Instruments required by the sequence are not connected: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or extract the layered sources.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values loaded but failed `Settings::validate`.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
