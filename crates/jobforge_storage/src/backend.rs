//! The storage backend contract.

use std::time::Duration;

use async_trait::async_trait;
use jobforge_protocol::{Job, JobId};
use serde_json::Value;

use crate::error::Result;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist a new job with state `SCHEDULED`. The job's own `job_id` is
    /// used as-is; callers are expected to construct it via `Job::new`,
    /// which already assigns a fresh id.
    async fn schedule_job(&self, job: Job) -> Result<JobId>;

    /// Fetch a job snapshot, or `NotFound`.
    async fn get_job(&self, job_id: &JobId) -> Result<Job>;

    /// Snapshot of every job, in any state.
    async fn get_all_jobs(&self) -> Result<Vec<Job>>;

    /// The oldest `SCHEDULED` job by schedule time (ties broken by
    /// lexicographic `job_id`), or `None` if the queue is empty.
    async fn get_next_scheduled_job(&self) -> Result<Option<Job>>;

    async fn mark_job_as_queued(&self, job_id: &JobId) -> Result<()>;
    async fn mark_job_as_running(&self, job_id: &JobId) -> Result<()>;
    async fn mark_job_as_canceling(&self, job_id: &JobId) -> Result<()>;
    async fn mark_job_as_canceled(&self, job_id: &JobId) -> Result<()>;
    async fn complete_job(&self, job_id: &JobId, result: Value) -> Result<()>;
    async fn mark_job_as_failed(
        &self,
        job_id: &JobId,
        exception: String,
        traceback: String,
    ) -> Result<()>;
    async fn update_job_progress(
        &self,
        job_id: &JobId,
        progress: f64,
        total_progress: f64,
        stage: Option<String>,
    ) -> Result<()>;

    /// Block until the job's next update, or `timeout` elapses. Wake-ups
    /// between calls are coalesced: a waiter always observes the latest
    /// state, never the missed intermediate ones.
    async fn wait_for_job_update(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<Job>;

    /// Remove jobs in a terminal state; with `force`, remove everything.
    async fn clear(&self, force: bool) -> Result<()>;
}
