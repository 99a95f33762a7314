//! Safe-shutdown replay after a failed or aborted run.
//!
//! The configured saved sequence is loaded through the normal pipeline and run
//! on fresh connections. Nothing here is fatal: unreachable instruments are
//! left out, failed steps are logged and the replay moves on. Instruments
//! disabled in configuration are never connected and their steps are passed
//! over without counting against the attempt. An attempt that
//! was not clean is repeated, up to the configured number of attempts.

use super::scheduler::{dispatch, Dispatch};
use crate::config::Address;
use crate::error::{BenchError, BenchResult};
use crate::instrument::{CapabilityRegistry, Connector, InstrumentBindings};
use crate::sequence::library::SavedSequence;
use crate::sequence::loader::{self, file_label};
use crate::sequence::ramp::seed_requests;
use crate::sequence::{expand_ramps, validate_commands, Sequence, SequenceLibrary};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// What happened in one safe-exit attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptReport {
    /// 1-based attempt number.
    pub attempt: u32,
    /// `None` when the sequence loaded; the load error otherwise.
    pub load_error: Option<String>,
    /// Instruments bound for this attempt.
    pub connected: Vec<String>,
    /// Enabled instruments that could not be reached.
    pub unreachable: Vec<String>,
    /// Steps sent to an instrument.
    pub dispatched: usize,
    /// Steps the instrument rejected.
    pub failed: usize,
    /// Steps for enabled instruments that were not bound.
    pub skipped: usize,
}

impl AttemptReport {
    /// Loaded, reached everything, and every step went through.
    pub fn is_clean(&self) -> bool {
        self.load_error.is_none() && self.unreachable.is_empty() && self.failed == 0 && self.skipped == 0
    }
}

/// Outcome of the whole safe-exit path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafeExitReport {
    /// Saved sequence that was replayed.
    pub sequence: String,
    /// One entry per attempt, in order.
    pub attempts: Vec<AttemptReport>,
    /// Whether the last attempt was clean.
    pub clean: bool,
}

/// Replays the safe-shutdown sequence.
pub struct SafeExit<'a> {
    /// Where the safe-exit sequence is stored.
    pub library: &'a SequenceLibrary,
    /// Used to load and validate the sequence.
    pub registry: &'a CapabilityRegistry,
    /// Opens fresh connections for each attempt.
    pub connector: &'a dyn Connector,
    /// Addresses from configuration; the document's own map takes precedence.
    pub addresses: &'a BTreeMap<String, Address>,
    /// Lower-cased ids of instruments disabled in configuration.
    pub disabled: &'a BTreeSet<String>,
    /// Name of the saved sequence to replay.
    pub sequence: &'a str,
    /// Attempts before giving up; zero counts as one.
    pub max_attempts: u32,
}

impl SafeExit<'_> {
    /// Replay until an attempt is clean or the attempts run out.
    pub async fn run(&self) -> SafeExitReport {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = Vec::new();
        info!("Running safe-exit sequence '{}'", self.sequence);

        for attempt in 1..=max_attempts {
            let report = self.attempt(attempt).await;
            let clean = report.is_clean();
            attempts.push(report);
            if clean {
                info!("Safe-exit completed on attempt {}", attempt);
                return SafeExitReport {
                    sequence: self.sequence.to_string(),
                    attempts,
                    clean: true,
                };
            }
            warn!("Safe-exit attempt {} was incomplete", attempt);
        }

        error!(
            "{}",
            BenchError::SafeExitExhausted {
                attempts: max_attempts
            }
        );
        SafeExitReport {
            sequence: self.sequence.to_string(),
            attempts,
            clean: false,
        }
    }

    fn prepare(&self) -> BenchResult<(Sequence, BTreeMap<String, Address>)> {
        let path = self.library.path_for(self.sequence);
        let saved = SavedSequence::read(&path)?;
        let seq = loader::load(&file_label(&path), &saved.rows, self.registry)?;
        let seq = self.library.expand_subsequences(&seq, self.registry)?;
        validate_commands(&seq, self.registry)?;

        let mut addresses = self.addresses.clone();
        addresses.extend(saved.address);
        Ok((seq, addresses))
    }

    async fn attempt(&self, attempt: u32) -> AttemptReport {
        let mut report = AttemptReport {
            attempt,
            ..AttemptReport::default()
        };

        let (seq, addresses) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Safe-exit sequence could not be loaded: {}", e);
                report.load_error = Some(e.to_string());
                return report;
            }
        };

        let ids: Vec<String> = seq
            .referenced_instruments()
            .into_iter()
            .filter(|id| {
                let disabled = self.disabled.contains(id);
                if disabled {
                    warn!("Safe-exit leaves out disabled instrument '{}'", id);
                }
                !disabled
            })
            .collect();
        let (mut bindings, failures) =
            InstrumentBindings::connect_all(self.connector, &ids, &addresses).await;
        report.connected = bindings.ids();
        report.unreachable = ids.into_iter().filter(|id| !bindings.contains(id)).collect();
        for failure in failures {
            warn!("Safe-exit continues without: {}", failure);
        }

        let seeds = bindings
            .read_seeds(&seed_requests(&seq, self.registry))
            .await;
        let seq = expand_ramps(&seq, self.registry, &seeds);

        for step in &seq {
            match dispatch(&mut bindings, step).await {
                Ok(Dispatch::Sent) => report.dispatched += 1,
                Ok(Dispatch::Sleep) => {}
                Ok(Dispatch::Unbound) if self.disabled.contains(&step.instrument_id) => {}
                Ok(Dispatch::Unbound) => report.skipped += 1,
                Err(e) => {
                    error!("Safe-exit step {} failed: {}", step.origin, e);
                    report.failed += 1;
                }
            }
            sleep(step.wait()).await;
        }
        report
    }
}
