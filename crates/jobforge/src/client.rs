//! The thin facade a host application actually talks to. Holds nothing
//! beyond a reference to the engine; every operation is a direct
//! pass-through to storage.

use std::sync::Arc;
use std::time::Duration;

use jobforge_protocol::{FuncRef, Job, JobId};
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{EngineError, Result};

/// Options recognized when scheduling a job, beyond the handler id and its
/// arguments.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub track_progress: bool,
    pub cancellable: bool,
    pub extra_metadata: Value,
}

pub struct Client {
    engine: Arc<Engine>,
}

impl Client {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Schedule `handler(args, kwargs)` and return the assigned job id.
    pub async fn schedule(
        &self,
        handler: impl Into<String>,
        args: Value,
        kwargs: Value,
        options: ScheduleOptions,
    ) -> Result<JobId> {
        let mut job = Job::new(FuncRef::new(handler, args, kwargs));
        job.track_progress = options.track_progress;
        job.cancellable = options.cancellable;
        job.extra_metadata = options.extra_metadata;
        Ok(self.engine.storage.schedule_job(job).await?)
    }

    /// Request cancellation. Always accepted and idempotent; whether the job
    /// actually stops depends on whether it is `cancellable` and whether its
    /// handler calls `check_for_cancel`.
    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        self.engine
            .storage
            .mark_job_as_canceling(job_id)
            .await
            .map_err(|e| self.not_found_or(job_id, e))
    }

    pub async fn status(&self, job_id: &JobId) -> Result<Job> {
        self.engine
            .storage
            .get_job(job_id)
            .await
            .map_err(|e| self.not_found_or(job_id, e))
    }

    pub async fn all_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.engine.storage.get_all_jobs().await?)
    }

    /// Wait for the job's next update (or `timeout`), whichever comes first.
    pub async fn wait(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<Job> {
        self.engine
            .storage
            .wait_for_job_update(job_id, timeout)
            .await
            .map_err(|e| self.timeout_or(job_id, e))
    }

    /// Poll until the job reaches a terminal state or `timeout` elapses.
    pub async fn wait_for_completion(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<Job> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            let job = self.status(job_id).await?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(EngineError::Timeout(job_id.clone()));
                }
                let _ = self.wait(job_id, Some(remaining.min(Duration::from_millis(200)))).await;
            } else {
                let _ = self.wait(job_id, Some(Duration::from_millis(200))).await;
            }
        }
    }

    /// Remove terminal jobs (`force=false`) or every job (`force=true`).
    /// A forced clear also requests cancellation of every still-running job,
    /// since its storage row is about to disappear out from under it.
    pub async fn clear(&self, force: bool) -> Result<()> {
        if force {
            self.engine.cancel_all_running().await?;
        }
        Ok(self.engine.storage.clear(force).await?)
    }

    fn not_found_or(&self, job_id: &JobId, err: jobforge_storage::StorageError) -> EngineError {
        match err {
            jobforge_storage::StorageError::NotFound(_) => EngineError::JobNotFound(job_id.clone()),
            other => EngineError::Storage(other),
        }
    }

    fn timeout_or(&self, job_id: &JobId, err: jobforge_storage::StorageError) -> EngineError {
        match err {
            jobforge_storage::StorageError::Timeout { .. } => EngineError::Timeout(job_id.clone()),
            jobforge_storage::StorageError::NotFound(_) => EngineError::JobNotFound(job_id.clone()),
            other => EngineError::Storage(other),
        }
    }
}
