//! The in-memory storage backend: process-lifetime, no persistence.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobforge_protocol::{Job, JobId, JobState};
use serde_json::Value;
use tracing::info;

use crate::backend::StorageBackend;
use crate::error::{Result, StorageError};
use crate::notify::JobNotifier;

#[derive(Default)]
pub struct InMemoryStorage {
    jobs: Mutex<HashMap<JobId, Job>>,
    notifier: JobNotifier,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and apply `target` to the stored job, publish the new
    /// snapshot, and return it. Centralizing this keeps every `mark_*`
    /// method a one-liner and guarantees the "wake any waiters on every
    /// mutation" guarantee can't be forgotten in one of them.
    fn transition(&self, job_id: &JobId, target: JobState, mutate: impl FnOnce(&mut Job)) -> Result<()> {
        let job = {
            let mut jobs = self.jobs.lock().expect("job map lock poisoned");
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| StorageError::not_found(job_id.clone()))?;
            job.state = job.state.transition(target)?;
            mutate(job);
            job.updated_at = Utc::now();
            job.clone()
        };
        self.notifier.publish(&job);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn schedule_job(&self, job: Job) -> Result<JobId> {
        let job_id = job.job_id.clone();
        self.notifier.register(&job);
        self.jobs
            .lock()
            .expect("job map lock poisoned")
            .insert(job_id.clone(), job);
        Ok(job_id)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Job> {
        self.jobs
            .lock()
            .expect("job map lock poisoned")
            .get(job_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(job_id.clone()))
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.lock().expect("job map lock poisoned").values().cloned().collect())
    }

    async fn get_next_scheduled_job(&self) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let next = jobs
            .values()
            .filter(|job| job.state == JobState::Scheduled)
            .min_by(|a, b| {
                a.scheduled_at
                    .cmp(&b.scheduled_at)
                    .then_with(|| a.job_id.as_str().cmp(b.job_id.as_str()))
            })
            .cloned();
        Ok(next)
    }

    async fn mark_job_as_queued(&self, job_id: &JobId) -> Result<()> {
        self.transition(job_id, JobState::Queued, |_| {})
    }

    async fn mark_job_as_running(&self, job_id: &JobId) -> Result<()> {
        self.transition(job_id, JobState::Running, |_| {})
    }

    async fn mark_job_as_canceling(&self, job_id: &JobId) -> Result<()> {
        // Idempotent: calling this on an already-CANCELING job is a no-op,
        // not an error, since the client may call `cancel` more than once.
        let mut jobs = self.jobs.lock().expect("job map lock poisoned");
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::not_found(job_id.clone()))?;
        if job.state == JobState::Canceling {
            return Ok(());
        }
        job.state = job.state.transition(JobState::Canceling)?;
        job.updated_at = Utc::now();
        let snapshot = job.clone();
        drop(jobs);
        self.notifier.publish(&snapshot);
        Ok(())
    }

    async fn mark_job_as_canceled(&self, job_id: &JobId) -> Result<()> {
        self.transition(job_id, JobState::Canceled, |_| {})
    }

    async fn complete_job(&self, job_id: &JobId, result: Value) -> Result<()> {
        self.transition(job_id, JobState::Completed, |job| job.result = Some(result))
    }

    async fn mark_job_as_failed(&self, job_id: &JobId, exception: String, traceback: String) -> Result<()> {
        self.transition(job_id, JobState::Failed, |job| {
            job.exception = Some(exception);
            job.traceback = Some(traceback);
        })
    }

    async fn update_job_progress(
        &self,
        job_id: &JobId,
        progress: f64,
        total_progress: f64,
        stage: Option<String>,
    ) -> Result<()> {
        let (progress, total_progress) = Job::clamp_progress(progress, total_progress);
        let job = {
            let mut jobs = self.jobs.lock().expect("job map lock poisoned");
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| StorageError::not_found(job_id.clone()))?;
            job.progress = progress;
            job.total_progress = total_progress;
            if stage.is_some() {
                job.stage = stage;
            }
            job.updated_at = Utc::now();
            job.clone()
        };
        self.notifier.publish(&job);
        Ok(())
    }

    async fn wait_for_job_update(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<Job> {
        self.notifier.wait(job_id, timeout).await
    }

    async fn clear(&self, force: bool) -> Result<()> {
        let removed_ids: Vec<JobId> = {
            let mut jobs = self.jobs.lock().expect("job map lock poisoned");
            let to_remove: Vec<JobId> = jobs
                .values()
                .filter(|job| force || job.state.is_terminal())
                .map(|job| job.job_id.clone())
                .collect();
            for job_id in &to_remove {
                jobs.remove(job_id);
            }
            to_remove
        };
        for job_id in &removed_ids {
            self.notifier.forget(job_id);
        }
        info!(removed = removed_ids.len(), force, "cleared jobs");
        Ok(())
    }
}
