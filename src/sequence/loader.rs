//! Reading sequence rows and turning them into steps.
//!
//! Sources only produce rows; `load` checks the two row-local invariants
//! (time and instrument) and reports every offending row at once.

use super::{Sequence, Step, SEQUENCE, SLEEP};
use crate::error::{BenchError, BenchResult, RowRef, ValidationError, Violation, ViolationKind};
use crate::instrument::CapabilityRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Offset between a zero-based data row index and the row number a
/// spreadsheet shows (1-based, plus the header line).
pub const HEADER_OFFSET: usize = 2;

/// One raw row, before any interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// `Time` cell, seconds to wait after the step.
    #[serde(rename = "Time")]
    pub time: String,
    /// `Instrument` cell.
    #[serde(rename = "Instrument")]
    pub instrument: String,
    /// `Command` cell.
    #[serde(rename = "Command")]
    pub command: String,
    /// `Argument` cell, if present.
    #[serde(rename = "Argument", default)]
    pub argument: Option<String>,
}

impl Row {
    /// Row from cell texts.
    pub fn new(time: &str, instrument: &str, command: &str, argument: Option<&str>) -> Self {
        Self {
            time: time.to_string(),
            instrument: instrument.to_string(),
            command: command.to_string(),
            argument: argument.map(str::to_string),
        }
    }

    fn is_blank(&self) -> bool {
        self.time.trim().is_empty()
            && self.instrument.trim().is_empty()
            && self.command.trim().is_empty()
            && self.argument.as_deref().map_or(true, |a| a.trim().is_empty())
    }
}

/// Anything that can produce ordered sequence rows.
pub trait SequenceSource: Send + Sync {
    /// Label used in row references (usually the file name).
    fn label(&self) -> String;

    /// Rows in file order, header excluded.
    fn rows(&self) -> BenchResult<Vec<Row>>;
}

/// Tabular file with a `Time,Instrument,Command,Argument` header.
#[cfg(feature = "source_csv")]
pub struct CsvSource {
    path: PathBuf,
}

#[cfg(feature = "source_csv")]
impl CsvSource {
    /// Source reading the CSV file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse rows from any reader; used for files and in-memory tables.
    pub fn read_from<R: std::io::Read>(reader: R, path: &Path) -> BenchResult<Vec<Row>> {
        let source_err = |message: String| BenchError::Source {
            path: path.to_path_buf(),
            message,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers = reader.headers().map_err(|e| source_err(e.to_string()))?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| source_err(format!("missing '{}' column", name)))
        };
        let time_col = column("Time")?;
        let instrument_col = column("Instrument")?;
        let command_col = column("Command")?;
        let argument_col = column("Argument")?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| source_err(e.to_string()))?;
            let field = |i: usize| record.get(i).unwrap_or("").to_string();
            let argument = record.get(argument_col).map(str::to_string);
            let row = Row {
                time: field(time_col),
                instrument: field(instrument_col),
                command: field(command_col),
                argument: argument.filter(|a| !a.is_empty()),
            };
            if !row.is_blank() {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[cfg(feature = "source_csv")]
impl SequenceSource for CsvSource {
    fn label(&self) -> String {
        file_label(&self.path)
    }

    fn rows(&self) -> BenchResult<Vec<Row>> {
        let file = std::fs::File::open(&self.path).map_err(|e| BenchError::Source {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        Self::read_from(file, &self.path)
    }
}

/// A time or argument cell in a saved document; YAML may carry numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    /// Boolean cell.
    Bool(bool),
    /// Integer cell.
    Int(i64),
    /// Float cell.
    Float(f64),
    /// Anything else.
    Text(String),
}

impl Cell {
    /// Cell text as a CSV file would hold it.
    pub fn into_text(self) -> String {
        match self {
            Cell::Bool(b) => String::from(if b { "True" } else { "False" }),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => f.to_string(),
            Cell::Text(s) => s,
        }
    }
}

/// Row layout inside saved sequence documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRow {
    /// `Time` cell.
    #[serde(rename = "Time")]
    pub time: Cell,
    /// Instrument id.
    #[serde(rename = "Instrument")]
    pub instrument: String,
    /// Command name.
    #[serde(rename = "Command")]
    pub command: String,
    /// `Argument` cell, if present.
    #[serde(rename = "Argument", default)]
    pub argument: Option<Cell>,
}

impl From<DocumentRow> for Row {
    fn from(row: DocumentRow) -> Self {
        Row {
            time: row.time.into_text(),
            instrument: row.instrument,
            command: row.command,
            argument: row.argument.map(Cell::into_text),
        }
    }
}

impl From<&Step> for DocumentRow {
    fn from(step: &Step) -> Self {
        let time = if step.relative_time.fract() == 0.0 && step.relative_time < i64::MAX as f64 {
            Cell::Int(step.relative_time as i64)
        } else {
            Cell::Float(step.relative_time)
        };
        DocumentRow {
            time,
            instrument: step.instrument_id.clone(),
            command: step.command.clone(),
            argument: Some(Cell::Text(
                step.argument_text.clone().unwrap_or_else(|| "-".into()),
            )),
        }
    }
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// A non-negative number of seconds that a wait can actually represent.
fn parse_time(text: &str) -> Option<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|t| Duration::try_from_secs_f64(*t).is_ok())
}

/// Turn rows into a sequence, checking every row's time and instrument.
///
/// Violations are batched per kind: all bad times are reported together, and
/// only once the times are clean are the instruments checked.
pub fn load(
    label: &str,
    rows: &[Row],
    registry: &CapabilityRegistry,
) -> Result<Sequence, ValidationError> {
    let at = |index: usize| RowRef {
        source: label.to_string(),
        row: index + HEADER_OFFSET,
    };

    let bad_times: Vec<Violation> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| parse_time(&row.time).is_none())
        .map(|(i, row)| Violation {
            at: at(i),
            detail: format!("time '{}'", row.time.trim()),
        })
        .collect();
    if !bad_times.is_empty() {
        return Err(ValidationError::new(ViolationKind::Time, bad_times));
    }

    let bad_instruments: Vec<Violation> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            let id = row.instrument.trim().to_lowercase();
            id != SLEEP && id != SEQUENCE && !registry.contains(&id)
        })
        .map(|(i, row)| Violation {
            at: at(i),
            detail: format!("instrument '{}'", row.instrument.trim()),
        })
        .collect();
    if !bad_instruments.is_empty() {
        return Err(ValidationError::new(
            ViolationKind::Instrument,
            bad_instruments,
        ));
    }

    let steps = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            Step::new(
                parse_time(&row.time).unwrap_or_default(),
                &row.instrument,
                &row.command,
                row.argument.as_deref(),
                at(i),
            )
        })
        .collect::<Vec<_>>();

    debug!("Loaded {} rows from {}", steps.len(), label);
    Ok(Sequence::new(label, steps))
}

/// Read a source and load it.
pub fn load_source(
    source: &dyn SequenceSource,
    registry: &CapabilityRegistry,
) -> BenchResult<Sequence> {
    let rows = source.rows()?;
    Ok(load(&source.label(), &rows, registry)?)
}
