//! One run from file to report.
//!
//! load -> inline sub-sequences -> validate -> connect -> seed -> ramp-expand
//! -> schedule, then safe-exit if the schedule did not complete.

use super::control::{ExecutionControl, ExecutionStatus, RunState};
use super::safe_exit::{SafeExit, SafeExitReport};
use super::scheduler::{RunOutcome, Scheduler};
use crate::config::Settings;
use crate::error::BenchResult;
use crate::instrument::{CapabilityRegistry, Connector, InstrumentBindings};
use crate::sequence::loader::load_source;
use crate::sequence::ramp::seed_requests;
use crate::sequence::{
    expand_ramps, validate_commands, SeedTable, Sequence, SequenceLibrary, SequenceSource,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Serialisable summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique id for this run.
    pub run_id: Uuid,
    /// Name of the sequence that ran.
    pub sequence: String,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// `Completed` or `Aborted`.
    pub state: RunState,
    /// How the scheduled part ended.
    pub outcome: RunOutcome,
    /// Steps after ramp expansion.
    pub total_steps: usize,
    /// Steps an instrument received.
    pub dispatched_steps: usize,
    /// Present when the run did not complete.
    pub safe_exit: Option<SafeExitReport>,
}

/// Everything a run needs besides the sequence itself.
#[derive(Clone)]
pub struct Runner {
    settings: Settings,
    registry: CapabilityRegistry,
    library: SequenceLibrary,
    connector: Arc<dyn Connector>,
}

impl Runner {
    /// Runner over `settings`, connecting through `connector`.
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Self {
        let library = SequenceLibrary::new(settings.sequences.directory.clone());
        Self {
            settings,
            registry: CapabilityRegistry::standard(),
            library,
            connector,
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Commands each instrument accepts.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Saved sequences.
    pub fn library(&self) -> &SequenceLibrary {
        &self.library
    }

    /// Load, inline and validate a sequence. No instrument is touched.
    pub fn prepare(&self, source: &dyn SequenceSource) -> BenchResult<Sequence> {
        let seq = load_source(source, &self.registry)?;
        self.inline_and_validate(&seq)
    }

    /// Store a sequence in the library under `name`.
    ///
    /// The sequence must pass the same checks as [`Runner::prepare`], but the
    /// file keeps its `sequence` rows rather than their inlined steps.
    pub fn save(&self, source: &dyn SequenceSource, name: &str) -> BenchResult<(Sequence, PathBuf)> {
        let seq = load_source(source, &self.registry)?;
        self.inline_and_validate(&seq)?;
        let path = self.library.save(name, &seq)?;
        Ok((seq, path))
    }

    fn inline_and_validate(&self, seq: &Sequence) -> BenchResult<Sequence> {
        let seq = self.library.expand_subsequences(seq, &self.registry)?;
        validate_commands(&seq, &self.registry)?;
        Ok(seq)
    }

    /// The step list a run would execute, seeded only from the sequence.
    pub fn plan(&self, source: &dyn SequenceSource) -> BenchResult<Sequence> {
        let seq = self.prepare(source)?;
        Ok(expand_ramps(&seq, &self.registry, &SeedTable::new()))
    }

    /// Instruments the run binds: referenced by the sequence and not disabled.
    fn targets(&self, seq: &Sequence) -> Vec<String> {
        seq.referenced_instruments()
            .into_iter()
            .filter(|id| match self.settings.instrument(id) {
                Some(config) if !config.enabled => {
                    warn!("Instrument '{}' is disabled; its steps will be skipped", id);
                    false
                }
                _ => true,
            })
            .collect()
    }

    /// Prepare and execute `source`, running safe-exit if it does not complete.
    pub async fn run(
        &self,
        source: &dyn SequenceSource,
        control: ExecutionControl,
    ) -> BenchResult<RunReport> {
        let seq = self.prepare(source)?;
        self.execute(&seq, control).await
    }

    /// Connect, expand ramps and drive an already prepared sequence.
    pub async fn execute(&self, seq: &Sequence, control: ExecutionControl) -> BenchResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Run {} of '{}' starting", run_id, seq.name);

        let targets = self.targets(seq);
        let addresses = self.settings.addresses();
        let (mut bindings, _failures) =
            InstrumentBindings::connect_all(self.connector.as_ref(), &targets, &addresses).await;
        bindings.require(&targets)?;

        let seeds = bindings
            .read_seeds(&seed_requests(seq, &self.registry))
            .await;
        let expanded = expand_ramps(seq, &self.registry, &seeds);
        control.publish(ExecutionStatus::idle(RunState::Ready, expanded.len()));

        let scheduled = Scheduler::new(
            &mut bindings,
            control.clone(),
            self.settings.scheduler.poll_interval(),
        )
        .run(&expanded)
        .await;
        drop(bindings);

        let (state, safe_exit) = if scheduled.outcome.is_completed() {
            (RunState::Completed, None)
        } else {
            control.publish(ExecutionStatus::idle(RunState::SafeExit, expanded.len()));
            let disabled = self.settings.disabled_instruments();
            let report = SafeExit {
                library: &self.library,
                registry: &self.registry,
                connector: self.connector.as_ref(),
                addresses: &addresses,
                disabled: &disabled,
                sequence: &self.settings.sequences.safe_exit,
                max_attempts: self.settings.scheduler.safe_exit_attempts,
            }
            .run()
            .await;
            control.publish(ExecutionStatus::idle(RunState::Aborted, expanded.len()));
            (RunState::Aborted, Some(report))
        };

        let report = RunReport {
            run_id,
            sequence: seq.name.clone(),
            started_at,
            finished_at: Utc::now(),
            state,
            outcome: scheduled.outcome,
            total_steps: expanded.len(),
            dispatched_steps: scheduled.dispatched,
            safe_exit,
        };
        info!("Run {} finished: {:?}", run_id, report.state);
        Ok(report)
    }
}
