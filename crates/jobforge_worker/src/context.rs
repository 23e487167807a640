//! The argument every handler receives as its first parameter.

use std::sync::Arc;

use jobforge_protocol::JobId;

use crate::cancel::CancellationToken;
use crate::error::HandlerError;

/// Where a handler's progress reports go. Thread-mode workers publish
/// straight to the scheduler mailbox; process-mode workers frame the report
/// onto their stdout for the parent to forward.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: f64, total_progress: f64, stage: Option<String>);
}

pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _progress: f64, _total_progress: f64, _stage: Option<String>) {}
}

/// Handed to user handlers. Opting into `update_progress`/`check_for_cancel`
/// is always safe: a handler that never calls either runs to completion
/// unaffected, exactly as if it took no context at all.
#[derive(Clone)]
pub struct ExecutionContext {
    job_id: JobId,
    track_progress: bool,
    cancellable: bool,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl ExecutionContext {
    pub fn new(
        job_id: JobId,
        track_progress: bool,
        cancellable: bool,
        cancel: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id,
            track_progress,
            cancellable,
            cancel,
            sink,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// No-op unless the job was scheduled with `track_progress = true`.
    pub fn update_progress(&self, progress: f64, total_progress: f64, stage: Option<&str>) {
        if !self.track_progress {
            return;
        }
        self.sink.report(progress, total_progress, stage.map(str::to_string));
    }

    /// Returns `Err(HandlerError::Cancelled)` once cancellation has been
    /// requested. A non-cancellable job never observes a cancel request,
    /// regardless of how many times the client calls `cancel`.
    pub fn check_for_cancel(&self) -> Result<(), HandlerError> {
        if self.cancellable && self.cancel.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
