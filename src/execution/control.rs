//! Operator control surface shared between the scheduler and a UI.
//!
//! Three independent flags travel from the operator to the scheduler; status
//! snapshots travel back over a watch channel. Nothing else is shared.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Prepared and connected, nothing dispatched yet.
    Ready,
    /// Dispatching or waiting.
    Running,
    /// Wait frozen by the operator.
    Paused,
    /// Every step ran.
    Completed,
    /// Stopped by abort or a dispatch failure.
    Aborted,
    /// Replaying the safe-exit sequence.
    SafeExit,
}

/// Snapshot published after every transition and wait poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatus {
    /// Current lifecycle state.
    pub state: RunState,
    /// Zero-based index of the current step.
    pub step_index: Option<usize>,
    /// Steps in the expanded sequence.
    pub total_steps: usize,
    /// Instrument of the current step.
    pub instrument: Option<String>,
    /// Command of the current step.
    pub command: Option<String>,
    /// Raw argument text of the current step.
    pub arguments: Option<String>,
    /// Seconds left in the current wait.
    pub remaining: Option<f64>,
}

impl ExecutionStatus {
    /// Status with no current step.
    pub fn idle(state: RunState, total_steps: usize) -> Self {
        Self {
            state,
            step_index: None,
            total_steps,
            instrument: None,
            command: None,
            arguments: None,
            remaining: None,
        }
    }

    /// One-line text for terminals and logs.
    pub fn summary(&self) -> String {
        let position = match self.step_index {
            Some(i) => format!("[{}/{}]", i + 1, self.total_steps),
            None => format!("[-/{}]", self.total_steps),
        };
        let mut text = format!("{:?} {}", self.state, position);
        if let (Some(instrument), Some(command)) = (&self.instrument, &self.command) {
            text.push_str(&format!(" {} {}", instrument, command));
        }
        if let Some(args) = &self.arguments {
            text.push_str(&format!(" {}", args));
        }
        if let Some(remaining) = self.remaining {
            text.push_str(&format!(" ({:.1}s left)", remaining));
        }
        text
    }
}

struct Inner {
    pause: AtomicBool,
    skip: AtomicBool,
    abort: AtomicBool,
    status: watch::Sender<ExecutionStatus>,
}

/// Cloneable handle; every clone controls the same run.
#[derive(Clone)]
pub struct ExecutionControl {
    inner: Arc<Inner>,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionControl {
    /// Fresh control: not paused, not aborted, status `Ready`.
    pub fn new() -> Self {
        let (status, _) = watch::channel(ExecutionStatus::idle(RunState::Ready, 0));
        Self {
            inner: Arc::new(Inner {
                pause: AtomicBool::new(false),
                skip: AtomicBool::new(false),
                abort: AtomicBool::new(false),
                status,
            }),
        }
    }

    /// Freeze the current wait.
    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Continue a paused wait.
    pub fn request_resume(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
    }

    /// End the current wait early.
    pub fn request_skip(&self) {
        self.inner.skip.store(true, Ordering::SeqCst);
    }

    /// Stop the run. Takes effect at the next poll.
    pub fn request_abort(&self) {
        self.inner.abort.store(true, Ordering::SeqCst);
    }

    /// True while a pause is in effect.
    pub fn is_paused(&self) -> bool {
        self.inner.pause.load(Ordering::SeqCst)
    }

    /// True once an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.inner.abort.load(Ordering::SeqCst)
    }

    /// Consume a pending skip request.
    pub(crate) fn take_skip(&self) -> bool {
        self.inner.skip.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn clear_skip(&self) {
        self.inner.skip.store(false, Ordering::SeqCst);
    }

    /// Latest published status.
    pub fn status(&self) -> ExecutionStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver that sees every published status.
    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.inner.status.subscribe()
    }

    pub(crate) fn publish(&self, status: ExecutionStatus) {
        self.inner.status.send_replace(status);
    }
}
