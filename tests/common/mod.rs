//! Common test utilities for bench_sequencer integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions against the paused tokio clock
//! - In-memory sequence sources
//! - A throwaway bench (settings, saved-sequence directory, simulated connector)

#![allow(dead_code)] // Not every test binary uses every helper

use bench_sequencer::config::Settings;
use bench_sequencer::error::BenchResult;
use bench_sequencer::execution::Runner;
use bench_sequencer::instrument::SimulatedConnector;
use bench_sequencer::sequence::{Row, SequenceSource};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Safe-exit sequence written into every test bench.
pub const SAFE_EXIT: &str = r#"
command:
  - {Time: 0, Instrument: dc_source, Command: set_output, Argument: "off"}
  - {Time: 0, Instrument: ac_source, Command: set_output, Argument: "off"}
address:
  dc_source: "TCPIP0::10.0.0.12::INSTR"
  ac_source: "TCPIP0::10.0.0.13::INSTR"
"#;

/// Assert that `actual` lies within `slack` of `expected`.
///
/// With `start_paused = true` waits are exact; `slack` covers the one poll
/// interval a pause or skip may take to be noticed.
pub fn assert_duration_within(actual: Duration, expected: Duration, slack: Duration, context: &str) {
    let min = expected.saturating_sub(slack);
    let max = expected + slack;
    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:?}, got {:?}",
        context,
        expected,
        slack,
        actual
    );
}

/// Rows held in memory, as if read from `label`.
pub struct MemorySource {
    pub label: String,
    pub rows: Vec<Row>,
}

impl MemorySource {
    pub fn new(label: &str, rows: &[(&str, &str, &str, &str)]) -> Self {
        Self {
            label: label.to_string(),
            rows: rows
                .iter()
                .map(|(time, instrument, command, argument)| {
                    Row::new(time, instrument, command, Some(*argument))
                })
                .collect(),
        }
    }
}

impl SequenceSource for MemorySource {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn rows(&self) -> BenchResult<Vec<Row>> {
        Ok(self.rows.clone())
    }
}

/// A bench backed by a temporary saved-sequence directory.
pub struct TestBench {
    pub dir: TempDir,
    pub settings: Settings,
    pub connector: SimulatedConnector,
}

impl TestBench {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("safe_exit.yaml"), SAFE_EXIT).unwrap();

        let mut settings = Settings::default();
        settings.sequences.directory = dir.path().to_path_buf();
        settings.scheduler.poll_interval_ms = 10;

        Self {
            dir,
            settings,
            connector: SimulatedConnector::new(),
        }
    }

    /// Write a saved sequence document into the library directory.
    pub fn save(&self, name: &str, yaml: &str) {
        fs::write(self.dir.path().join(format!("{}.yaml", name)), yaml).unwrap();
    }

    pub fn runner(&self) -> Runner {
        Runner::new(self.settings.clone(), Arc::new(self.connector.clone()))
    }
}
