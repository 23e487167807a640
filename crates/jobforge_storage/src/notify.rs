//! Per-job wake-up primitive shared by every storage backend.
//!
//! SQL engines give no portable "tell me when this row changes" hook, so
//! both the in-memory and the SQLite backend pair their row mutations with
//! this same in-process notifier. A `tokio::sync::watch` channel naturally
//! coalesces wake-ups: a waiter that misses several intermediate updates
//! still observes the latest value the next time it is polled, it just
//! never sees the values in between.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use jobforge_protocol::{Job, JobId};
use tokio::sync::watch;

use crate::error::{Result, StorageError};

pub struct JobNotifier {
    channels: Mutex<HashMap<JobId, watch::Sender<Job>>>,
}

impl Default for JobNotifier {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl JobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly scheduled job so waiters have something to
    /// subscribe to.
    pub fn register(&self, job: &Job) {
        let (tx, _rx) = watch::channel(job.clone());
        self.channels
            .lock()
            .expect("notifier lock poisoned")
            .insert(job.job_id.clone(), tx);
    }

    /// Publish the job's latest snapshot, waking any current and future
    /// waiters. A no-op if nobody ever registered this job_id (should not
    /// happen in practice since `schedule_job` always registers first).
    pub fn publish(&self, job: &Job) {
        let channels = self.channels.lock().expect("notifier lock poisoned");
        if let Some(tx) = channels.get(&job.job_id) {
            // `send` only errors when there are no receivers left, which is
            // harmless here: it just means nobody is currently waiting.
            let _ = tx.send(job.clone());
        }
    }

    pub fn forget(&self, job_id: &JobId) {
        self.channels
            .lock()
            .expect("notifier lock poisoned")
            .remove(job_id);
    }

    /// Block until the job's next update (or `timeout` elapses).
    pub async fn wait(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<Job> {
        let mut rx = {
            let channels = self.channels.lock().expect("notifier lock poisoned");
            channels
                .get(job_id)
                .ok_or_else(|| StorageError::not_found(job_id.clone()))?
                .subscribe()
        };

        let wait_for_change = rx.changed();
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, wait_for_change).await {
                Ok(Ok(())) => Ok(rx.borrow().clone()),
                Ok(Err(_)) => Err(StorageError::not_found(job_id.clone())),
                Err(_) => Err(StorageError::Timeout { job_id: job_id.clone() }),
            },
            None => {
                wait_for_change
                    .await
                    .map_err(|_| StorageError::not_found(job_id.clone()))?;
                Ok(rx.borrow().clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_protocol::FuncRef;
    use serde_json::Value;

    fn sample_job() -> Job {
        Job::new(FuncRef::new("identity", Value::Null, Value::Null))
    }

    #[tokio::test]
    async fn wait_times_out_with_no_publish() {
        let notifier = JobNotifier::new();
        let job = sample_job();
        notifier.register(&job);

        let result = notifier.wait(&job.job_id, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(StorageError::Timeout { .. })));
    }

    #[tokio::test]
    async fn wait_returns_latest_after_coalesced_publishes() {
        let notifier = JobNotifier::new();
        let mut job = sample_job();
        notifier.register(&job);

        let job_id = job.job_id.clone();
        let notifier = std::sync::Arc::new(notifier);
        let waiter = {
            let notifier = notifier.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move { notifier.wait(&job_id, Some(Duration::from_secs(1))).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        job.progress = 1.0;
        notifier.publish(&job);
        job.progress = 2.0;
        notifier.publish(&job);

        let observed = waiter.await.unwrap().unwrap();
        assert_eq!(observed.progress, 2.0);
    }
}
