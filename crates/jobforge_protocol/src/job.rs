//! The `Job` record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use jobforge_ids::JobId;

/// A job's position in its lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Scheduled,
    Queued,
    Running,
    Completed,
    Failed,
    Canceling,
    Canceled,
}

impl JobState {
    /// Terminal states are absorbing: no further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Canceled)
    }

    /// Whether `self -> next` is an edge in the state graph.
    ///
    /// `CANCELING` is reachable from any non-terminal state; every other edge
    /// is the straight-line pipeline `SCHEDULED -> QUEUED -> RUNNING ->
    /// {COMPLETED,FAILED}`, plus `CANCELING -> CANCELED`. A job already
    /// `CANCELING` may still land on `COMPLETED`/`FAILED`: cancellation is
    /// cooperative, so a non-cancellable (or already-finished) job keeps
    /// running to its natural outcome despite a pending cancel request.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Canceling) => true,
            (Scheduled, Queued) => true,
            (Queued, Running) => true,
            (Running, Completed) => true,
            (Running, Failed) => true,
            (Canceling, Canceled) => true,
            (Canceling, Completed) => true,
            (Canceling, Failed) => true,
            _ => false,
        }
    }

    /// Validate and return the transition, or an `IllegalTransition` error.
    pub fn transition(self, next: JobState) -> Result<JobState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ProtocolError::IllegalTransition { from: self, to: next })
        }
    }
}

/// The sentinel exception string a worker reports for a handler that raised
/// cancellation rather than failing normally. The scheduler's update loop
/// rewrites a `JobFailed` carrying this string into `mark_job_as_canceled`
/// instead of `mark_job_as_failed`.
pub const USER_CANCELLED_EXCEPTION: &str = "UserCancelledError";

/// A registered handler id plus its serialized arguments. The engine never
/// holds an arbitrary pickled closure; `handler` is looked up in a process
/// wide `HandlerRegistry` (see `jobforge_worker`), so a job record is always
/// safe to pass across a process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncRef {
    pub handler: String,
    pub args: Value,
    pub kwargs: Value,
}

impl FuncRef {
    pub fn new(handler: impl Into<String>, args: Value, kwargs: Value) -> Self {
        Self {
            handler: handler.into(),
            args,
            kwargs,
        }
    }
}

/// The central entity: a scheduled unit of work and its current lifecycle
/// state, progress, and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub func: FuncRef,
    pub state: JobState,
    pub progress: f64,
    pub total_progress: f64,
    pub stage: Option<String>,
    pub result: Option<Value>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub track_progress: bool,
    pub cancellable: bool,
    pub extra_metadata: Value,
    pub scheduled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh job in the `SCHEDULED` state. `job_id` is normally left
    /// to the storage backend to assign; a caller-supplied handle is
    /// accepted as-is (the backend never reuses one it already holds).
    pub fn new(func: FuncRef) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            func,
            state: JobState::Scheduled,
            progress: 0.0,
            total_progress: 0.0,
            stage: None,
            result: None,
            exception: None,
            traceback: None,
            track_progress: false,
            cancellable: false,
            extra_metadata: Value::Null,
            scheduled_at: now,
            updated_at: now,
        }
    }

    /// Clamp a reported progress pair into `[0, total]`. A progress report
    /// never fails the job; it is just clamped at write time.
    pub fn clamp_progress(progress: f64, total_progress: f64) -> (f64, f64) {
        if total_progress <= 0.0 {
            return (0.0, total_progress.max(0.0));
        }
        (progress.clamp(0.0, total_progress), total_progress)
    }
}
