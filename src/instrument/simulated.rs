//! In-process stand-ins for the bench hardware.
//!
//! Used by the CLI's `--simulate` mode and by the test suite. Provides:
//! - A shared, ordered call log across every simulated instrument
//! - Controllable failure injection per instrument/command
//! - Setpoint tracking so ramps can be seeded from "hardware"

use super::capabilities::CapabilityEntry;
use super::charger::RemoteShell;
use super::{Instrument, InstrumentKind};
use crate::error::DispatchError;
use crate::sequence::ramp::setpoint_channel;
use crate::sequence::ArgValue;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One recorded dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Instrument id.
    pub instrument: String,
    /// Command name.
    pub command: String,
    /// Arguments, `None` for a no-argument call.
    pub args: Option<Vec<ArgValue>>,
    /// Clock reading at dispatch.
    pub at: Instant,
}

/// Ordered record of dispatches, shared between instruments.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one call.
    pub fn record(&self, instrument: &str, command: &str, args: Option<&[ArgValue]>) {
        lock(&self.calls).push(Invocation {
            instrument: instrument.to_string(),
            command: command.to_string(),
            args: args.map(<[ArgValue]>::to_vec),
            at: Instant::now(),
        });
    }

    /// Every call so far.
    pub fn snapshot(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls.
    pub fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    /// True when nothing was called.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `instrument.command` labels, in dispatch order.
    pub fn labels(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|c| format!("{}.{}", c.instrument, c.command))
            .collect()
    }
}

/// Failure rules keyed by `(instrument, command)`.
///
/// `None` fails forever; `Some(n)` fails the next `n` calls.
#[derive(Debug, Clone, Default)]
pub struct FailurePlan {
    rules: Arc<Mutex<HashMap<(String, String), Option<u32>>>>,
}

impl FailurePlan {
    /// Fail every call of `command` on `instrument`.
    pub fn always(&self, instrument: &str, command: &str) {
        lock(&self.rules).insert((instrument.to_lowercase(), command.to_string()), None);
    }

    /// Fail the next `count` calls of `command` on `instrument`.
    pub fn times(&self, instrument: &str, command: &str, count: u32) {
        lock(&self.rules).insert(
            (instrument.to_lowercase(), command.to_string()),
            Some(count),
        );
    }

    /// Consume one failure if a rule matches.
    pub fn should_fail(&self, instrument: &str, command: &str) -> bool {
        let mut rules = lock(&self.rules);
        let key = (instrument.to_string(), command.to_string());
        match rules.get_mut(&key) {
            Some(None) => true,
            Some(Some(0)) | None => false,
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
        }
    }
}

/// A simulated instrument of any non-charger kind.
pub struct SimulatedInstrument {
    id: String,
    kind: InstrumentKind,
    capabilities: CapabilityEntry,
    log: CallLog,
    failures: FailurePlan,
    fail_next: Arc<AtomicBool>,
    setpoints: HashMap<String, f64>,
}

impl SimulatedInstrument {
    /// Simulated `kind` logging into `log`.
    pub fn new(id: &str, kind: InstrumentKind, log: CallLog) -> Self {
        Self {
            id: id.to_lowercase(),
            kind,
            capabilities: CapabilityEntry::for_kind(kind),
            log,
            failures: FailurePlan::default(),
            fail_next: Arc::new(AtomicBool::new(false)),
            setpoints: HashMap::new(),
        }
    }

    /// Apply `failures` to calls.
    pub fn with_failures(mut self, failures: FailurePlan) -> Self {
        self.failures = failures;
        self
    }

    /// Report `value` for `channel` until a setpoint changes it.
    pub fn with_setpoint(mut self, channel: &str, value: f64) -> Self {
        self.setpoints.insert(channel.to_lowercase(), value);
        self
    }

    /// Inject a failure for the next invocation.
    pub fn inject_next_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn track_setpoint(&mut self, command: &str, args: Option<&[ArgValue]>) {
        let Some(args) = args else { return };
        if let Some((channel, value_idx)) = setpoint_channel(self.kind, command, args) {
            if let Some(value) = args.get(value_idx).and_then(ArgValue::as_f64) {
                self.setpoints.insert(channel, value);
            }
        }
    }
}

#[async_trait]
impl Instrument for SimulatedInstrument {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> InstrumentKind {
        self.kind
    }

    async fn invoke(
        &mut self,
        command: &str,
        args: Option<&[ArgValue]>,
    ) -> Result<Option<ArgValue>, DispatchError> {
        if !self.capabilities.permits(command) {
            return Err(DispatchError::new(
                &self.id,
                command,
                format!("{} has no command '{}'", self.kind, command),
            ));
        }

        self.log.record(&self.id, command, args);

        if self.fail_next.swap(false, Ordering::SeqCst)
            || self.failures.should_fail(&self.id, command)
        {
            return Err(DispatchError::new(&self.id, command, "Injected failure"));
        }

        debug!("Simulated {} executed {}", self.id, command);
        self.track_setpoint(command, args);
        Ok(None)
    }

    async fn read_setpoint(&mut self, channel: &str) -> Option<f64> {
        self.setpoints.get(&channel.to_lowercase()).copied()
    }
}

/// Shell lines written to a simulated charger.
#[derive(Debug, Clone, Default)]
pub struct ShellLines {
    lines: Arc<Mutex<Vec<String>>>,
}

impl ShellLines {
    /// Copy of everything recorded.
    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

/// A remote shell that only records what it is sent.
pub struct SimulatedShell {
    id: String,
    lines: ShellLines,
    log: Option<CallLog>,
    failures: FailurePlan,
}

impl Default for SimulatedShell {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedShell {
    /// Shell for the default charger id.
    pub fn new() -> Self {
        Self {
            id: InstrumentKind::Charger.default_id().to_string(),
            lines: ShellLines::default(),
            log: None,
            failures: FailurePlan::default(),
        }
    }

    /// Also record each line into a shared call log under `id`.
    pub fn with_log(mut self, id: &str, log: CallLog) -> Self {
        self.id = id.to_lowercase();
        self.log = Some(log);
        self
    }

    /// Fail sends according to `failures`.
    pub fn with_failures(mut self, failures: FailurePlan) -> Self {
        self.failures = failures;
        self
    }

    /// Handle on the recorded lines.
    pub fn lines(&self) -> ShellLines {
        self.lines.clone()
    }
}

#[async_trait]
impl RemoteShell for SimulatedShell {
    async fn send(&mut self, line: &str) -> Result<(), DispatchError> {
        let script = line
            .trim_start_matches("nohup ./")
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        if let Some(log) = &self.log {
            log.record(&self.id, &script, None);
        }
        if self.failures.should_fail(&self.id, &script) {
            return Err(DispatchError::new(&self.id, &script, "Shell closed"));
        }
        lock(&self.lines.lines).push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invocations_are_logged_in_order() {
        let log = CallLog::new();
        let mut dc = SimulatedInstrument::new("dc_source", InstrumentKind::DcSource, log.clone());
        let mut ac = SimulatedInstrument::new("ac_source", InstrumentKind::AcSource, log.clone());

        dc.invoke("set_output", Some(&[ArgValue::from("on")]))
            .await
            .unwrap();
        ac.invoke("europe_grid", None).await.unwrap();

        assert_eq!(
            log.labels(),
            vec!["dc_source.set_output", "ac_source.europe_grid"]
        );
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let log = CallLog::new();
        let mut dc = SimulatedInstrument::new("dc_source", InstrumentKind::DcSource, log);
        dc.inject_next_failure();
        assert!(dc.invoke("set_function", None).await.is_err());
        assert!(dc.invoke("set_function", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_counted_failures() {
        let failures = FailurePlan::default();
        failures.times("powersupply", "set_output", 2);
        let mut ps =
            SimulatedInstrument::new("powersupply", InstrumentKind::PowerSupply, CallLog::new())
                .with_failures(failures);
        let off = [ArgValue::Int(0)];
        assert!(ps.invoke("set_output", Some(&off)).await.is_err());
        assert!(ps.invoke("set_output", Some(&off)).await.is_err());
        assert!(ps.invoke("set_output", Some(&off)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_command_is_a_dispatch_error() {
        let mut scope =
            SimulatedInstrument::new("oscilloscope", InstrumentKind::Oscilloscope, CallLog::new());
        let err = scope.invoke("fire", None).await.unwrap_err();
        assert_eq!(err.command, "fire");
    }

    #[tokio::test]
    async fn test_setpoints_follow_commands() {
        let mut dc = SimulatedInstrument::new("dc_source", InstrumentKind::DcSource, CallLog::new())
            .with_setpoint("voltage", 5.0);
        assert_eq!(dc.read_setpoint("voltage").await, Some(5.0));
        dc.invoke("set_voltage", Some(&[ArgValue::Int(48)]))
            .await
            .unwrap();
        assert_eq!(dc.read_setpoint("voltage").await, Some(48.0));
        assert_eq!(dc.read_setpoint("current").await, None);
    }

    #[tokio::test]
    async fn test_shell_records_script_name() {
        let log = CallLog::new();
        let mut shell = SimulatedShell::new().with_log("armxl", log.clone());
        shell
            .send("nohup ./set_power.sh 7000 & >/dev/null\n")
            .await
            .unwrap();
        assert_eq!(log.labels(), vec!["armxl.set_power.sh"]);
        assert_eq!(shell.lines().snapshot().len(), 1);
    }
}
