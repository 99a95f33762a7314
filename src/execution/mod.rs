//! Run execution: operator control, the step scheduler, safe-exit and the
//! runner that ties a sequence file to a finished report.

pub mod control;
pub mod runner;
pub mod safe_exit;
pub mod scheduler;

pub use control::{ExecutionControl, ExecutionStatus, RunState};
pub use runner::{RunReport, Runner};
pub use safe_exit::{AttemptReport, SafeExit, SafeExitReport};
pub use scheduler::{dispatch, Dispatch, RunOutcome, ScheduleResult, Scheduler};
