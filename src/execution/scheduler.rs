//! Ordered dispatch with operator-controlled waits.
//!
//! ```text
//! Ready -> Running <-> Paused -> Running -> Completed
//!              \          /
//!               Aborted -> SafeExit
//! ```
//!
//! Steps are dispatched strictly in order, one at a time. After each dispatch
//! the scheduler waits the step's `relative_time`, polling the control flags.
//! A pause freezes the elapsed time of the current wait; on resume the
//! remainder runs from a fresh clock.

use super::control::{ExecutionControl, ExecutionStatus, RunState};
use crate::error::DispatchError;
use crate::instrument::{Binding, InstrumentBindings};
use crate::sequence::{Sequence, Step};
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// What dispatching one step amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// An instrument received the command.
    Sent,
    /// `sleep` step; nothing to send.
    Sleep,
    /// No binding for the step's instrument.
    Unbound,
}

/// Send one step to its instrument.
pub async fn dispatch(bindings: &mut InstrumentBindings, step: &Step) -> Result<Dispatch, DispatchError> {
    if step.is_sleep() {
        return Ok(Dispatch::Sleep);
    }
    let Some(binding) = bindings.get_mut(&step.instrument_id) else {
        return Ok(Dispatch::Unbound);
    };

    debug!("Dispatching {} ({})", step.describe(), step.origin);
    match binding {
        Binding::Charger(charger) => {
            charger
                .run_script(&step.command, step.argument_text.as_deref())
                .await?
        }
        Binding::Device(device) => {
            let args = step.arguments();
            device.invoke(&step.command, args.as_deref()).await?;
        }
    }
    Ok(Dispatch::Sent)
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    Elapsed,
    Skipped,
    Aborted,
}

/// How the scheduled part of a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step was dispatched and waited out.
    Completed,
    /// Dispatch of step `step` failed; later steps were not sent.
    Failed { step: usize, error: String },
    /// Operator abort observed at step `step`.
    Aborted { step: usize },
}

impl RunOutcome {
    /// True for [`RunOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Result of driving one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleResult {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Steps an instrument actually received.
    pub dispatched: usize,
}

/// Drives one sequence against borrowed bindings.
pub struct Scheduler<'a> {
    bindings: &'a mut InstrumentBindings,
    control: ExecutionControl,
    poll_interval: Duration,
}

impl<'a> Scheduler<'a> {
    /// Scheduler polling `control` every `poll_interval` while waiting.
    pub fn new(
        bindings: &'a mut InstrumentBindings,
        control: ExecutionControl,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bindings,
            control,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Dispatch and wait out every step in order.
    pub async fn run(&mut self, seq: &Sequence) -> ScheduleResult {
        let total = seq.len();
        let mut dispatched = 0;
        info!("Starting sequence {} ({} steps)", seq.name, total);

        for (index, step) in seq.iter().enumerate() {
            if self.control.is_aborted() {
                return self.aborted(index, total, dispatched);
            }
            self.control.clear_skip();
            self.publish(RunState::Running, index, total, step, Some(step.relative_time));

            match dispatch(&mut *self.bindings, step).await {
                Ok(Dispatch::Sent) => dispatched += 1,
                Ok(Dispatch::Sleep) => debug!("Waiting {} s", step.relative_time),
                Ok(Dispatch::Unbound) => warn!(
                    "Instrument '{}' is not connected; skipping {} ({})",
                    step.instrument_id, step.command, step.origin
                ),
                Err(e) => {
                    error!("Fatal error at step {} ({}): {}", index + 1, step.origin, e);
                    self.control
                        .publish(ExecutionStatus::idle(RunState::Aborted, total));
                    return ScheduleResult {
                        outcome: RunOutcome::Failed {
                            step: index,
                            error: e.to_string(),
                        },
                        dispatched,
                    };
                }
            }

            match self.wait(index, total, step).await {
                WaitEnd::Elapsed => {}
                WaitEnd::Skipped => info!("Skipped remaining wait of step {}", index + 1),
                WaitEnd::Aborted => return self.aborted(index, total, dispatched),
            }
        }

        info!("Sequence {} completed", seq.name);
        self.control
            .publish(ExecutionStatus::idle(RunState::Completed, total));
        ScheduleResult {
            outcome: RunOutcome::Completed,
            dispatched,
        }
    }

    /// Wait out `step.relative_time`, honouring pause, skip and abort.
    ///
    /// A skip requested while paused stays pending and ends the wait as soon
    /// as the run resumes.
    async fn wait(&self, index: usize, total: usize, step: &Step) -> WaitEnd {
        let target = step.wait();
        let mut elapsed = Duration::ZERO;
        let mut clock = Instant::now();

        loop {
            if self.control.is_aborted() {
                return WaitEnd::Aborted;
            }

            if self.control.is_paused() {
                elapsed += clock.elapsed();
                let left = target.saturating_sub(elapsed).as_secs_f64();
                info!("Paused at step {}", index + 1);
                self.publish(RunState::Paused, index, total, step, Some(left));
                while self.control.is_paused() {
                    if self.control.is_aborted() {
                        return WaitEnd::Aborted;
                    }
                    sleep(self.poll_interval).await;
                }
                info!("Resumed at step {}", index + 1);
                self.publish(RunState::Running, index, total, step, Some(left));
                clock = Instant::now();
                continue;
            }

            if self.control.take_skip() {
                return WaitEnd::Skipped;
            }

            let done = elapsed + clock.elapsed();
            if done >= target {
                return WaitEnd::Elapsed;
            }
            let remaining = target - done;
            self.publish(
                RunState::Running,
                index,
                total,
                step,
                Some(remaining.as_secs_f64()),
            );
            sleep(remaining.min(self.poll_interval)).await;
        }
    }

    fn aborted(&self, index: usize, total: usize, dispatched: usize) -> ScheduleResult {
        warn!("Run aborted by operator at step {}", index + 1);
        self.control
            .publish(ExecutionStatus::idle(RunState::Aborted, total));
        ScheduleResult {
            outcome: RunOutcome::Aborted { step: index },
            dispatched,
        }
    }

    fn publish(
        &self,
        state: RunState,
        index: usize,
        total: usize,
        step: &Step,
        remaining: Option<f64>,
    ) {
        self.control.publish(ExecutionStatus {
            state,
            step_index: Some(index),
            total_steps: total,
            instrument: Some(step.instrument_id.clone()),
            command: Some(step.command.clone()),
            arguments: step.argument_text.clone(),
            remaining,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{CallLog, Charger, InstrumentKind, SimulatedInstrument, SimulatedShell};
    use crate::sequence::step;
    use tracing_test::traced_test;

    fn bench(log: &CallLog) -> InstrumentBindings {
        let mut bindings = InstrumentBindings::new();
        bindings.insert(Binding::Device(Box::new(SimulatedInstrument::new(
            "dc_source",
            InstrumentKind::DcSource,
            log.clone(),
        ))));
        bindings
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_relative_time() {
        let log = CallLog::new();
        let mut bindings = bench(&log);
        let seq = Sequence::new(
            "t",
            vec![
                step(0.0, "sleep", "-", "-"),
                step(5.0, "dc_source", "set_output", "on"),
                step(0.0, "dc_source", "set_voltage", "12"),
            ],
        );
        let start = Instant::now();
        let result = Scheduler::new(&mut bindings, ExecutionControl::new(), Duration::from_millis(100))
            .run(&seq)
            .await;

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.dispatched, 2);
        let calls = log.snapshot();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].at - start, Duration::ZERO);
        assert_eq!(calls[1].at - start, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_charger_steps_go_to_the_shell() {
        let log = CallLog::new();
        let mut bindings = bench(&log);
        let shell = SimulatedShell::new().with_log("armxl", log.clone());
        let lines = shell.lines();
        bindings.insert(Binding::Charger(Charger::new("armxl", Box::new(shell))));

        let seq = Sequence::new(
            "t",
            vec![
                step(2.0, "armxl", "set_power.sh", "7000"),
                step(0.0, "armxl", "stop_charge_session.sh", "-"),
                step(0.0, "dc_source", "set_output", "on"),
            ],
        );
        let start = Instant::now();
        let result = Scheduler::new(&mut bindings, ExecutionControl::new(), Duration::from_millis(100))
            .run(&seq)
            .await;

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.dispatched, 3);
        assert_eq!(
            lines.snapshot(),
            vec![
                "nohup ./set_power.sh 7000 & >/dev/null\n".to_string(),
                "nohup ./stop_charge_session.sh & >/dev/null\n".to_string(),
            ]
        );
        let calls = log.snapshot();
        assert_eq!(
            log.labels(),
            vec![
                "armxl.set_power.sh",
                "armxl.stop_charge_session.sh",
                "dc_source.set_output"
            ]
        );
        assert_eq!(calls[0].at - start, Duration::ZERO);
        assert_eq!(calls[2].at - start, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_instrument_still_waits() {
        let log = CallLog::new();
        let mut bindings = bench(&log);
        let seq = Sequence::new(
            "t",
            vec![
                step(3.0, "ac_source", "europe_grid", "-"),
                step(0.0, "dc_source", "set_output", "on"),
            ],
        );
        let start = Instant::now();
        let result = Scheduler::new(&mut bindings, ExecutionControl::new(), Duration::from_millis(100))
            .run(&seq)
            .await;
        assert_eq!(result.dispatched, 1);
        assert_eq!(log.snapshot()[0].at - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_unbound_instrument_is_logged() {
        let log = CallLog::new();
        let mut bindings = bench(&log);
        let seq = Sequence::new("t", vec![step(1.0, "oscilloscope", "save_screen", "-")]);
        Scheduler::new(&mut bindings, ExecutionControl::new(), Duration::from_millis(100))
            .run(&seq)
            .await;
        assert!(logs_contain("Instrument 'oscilloscope' is not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_start() {
        let log = CallLog::new();
        let mut bindings = bench(&log);
        let control = ExecutionControl::new();
        control.request_abort();
        let seq = Sequence::new("t", vec![step(0.0, "dc_source", "set_output", "on")]);
        let result = Scheduler::new(&mut bindings, control.clone(), Duration::from_millis(100))
            .run(&seq)
            .await;
        assert_eq!(result.outcome, RunOutcome::Aborted { step: 0 });
        assert!(log.is_empty());
        assert_eq!(control.status().state, RunState::Aborted);
    }
}
