//! The scheduler: two cooperative loops sharing no mutable state beyond
//! storage and the mailboxes.

mod error;

pub use error::{Result, SchedulerError};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jobforge_messaging::MessagingBackend;
use jobforge_protocol::{JobState, Message, USER_CANCELLED_EXCEPTION};
use jobforge_storage::StorageBackend;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const DISPATCH_BACKOFF_BASE_MS: u64 = 50;
const DISPATCH_BACKOFF_MAX_MS: u64 = 1_000;
const DISPATCH_BACKOFF_JITTER_MS: u64 = 50;

const UPDATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SchedulerConfig {
    /// Mailbox the worker pool consumes `StartJob`/`CancelJob` from.
    pub worker_mailbox: String,
    /// Mailbox the scheduler itself consumes worker lifecycle events from.
    pub scheduler_mailbox: String,
}

pub struct Scheduler {
    config: SchedulerConfig,
    storage: Arc<dyn StorageBackend>,
    bus: Arc<MessagingBackend>,
    shutdown: Arc<AtomicBool>,
    dispatch_backoff_ms: AtomicU64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, storage: Arc<dyn StorageBackend>, bus: Arc<MessagingBackend>) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            bus,
            shutdown: Arc::new(AtomicBool::new(false)),
            dispatch_backoff_ms: AtomicU64::new(0),
        })
    }

    /// Start both control loops. Returns their join handles so a caller can
    /// await an orderly shutdown.
    pub fn start(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let dispatch = Arc::clone(self);
        let update = Arc::clone(self);
        (
            tokio::spawn(async move { dispatch.dispatch_loop().await }),
            tokio::spawn(async move { update.update_loop().await }),
        )
    }

    /// Stop both loops after their current iteration. Does not itself wait
    /// for in-flight jobs; that is the worker pool's responsibility.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.storage.get_next_scheduled_job().await {
                Ok(Some(job)) => match self.storage.mark_job_as_queued(&job.job_id).await {
                    Ok(()) => {
                        self.bus.send(
                            &self.config.worker_mailbox,
                            Message::StartJob {
                                job_id: job.job_id.clone(),
                                handler: job.func.handler.clone(),
                                args: job.func.args.clone(),
                                kwargs: job.func.kwargs.clone(),
                                track_progress: job.track_progress,
                                cancellable: job.cancellable,
                            },
                        );
                        self.dispatch_backoff_ms.store(0, Ordering::SeqCst);
                    }
                    Err(e) => {
                        error!(job_id = %job.job_id, error = %e, "failed to promote job to QUEUED");
                        self.backoff().await;
                    }
                },
                Ok(None) => self.backoff().await,
                Err(e) => {
                    error!(error = %e, "failed to fetch next scheduled job");
                    self.backoff().await;
                }
            }
        }
    }

    async fn backoff(&self) {
        let previous = self.dispatch_backoff_ms.load(Ordering::SeqCst);
        let next = if previous == 0 {
            DISPATCH_BACKOFF_BASE_MS
        } else {
            (previous * 2).min(DISPATCH_BACKOFF_MAX_MS)
        };
        self.dispatch_backoff_ms.store(next, Ordering::SeqCst);

        let jitter_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 % DISPATCH_BACKOFF_JITTER_MS)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(next + jitter_ms)).await;
    }

    async fn update_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.bus.pop(&self.config.scheduler_mailbox) {
                Some(Message::JobStarted { job_id }) => {
                    if let Err(e) = self.storage.mark_job_as_running(&job_id).await {
                        error!(job_id = %job_id, error = %e, "failed to mark job as running");
                    }
                }
                Some(Message::JobUpdated { job_id, progress, total_progress, stage }) => {
                    let stage = if stage.is_empty() { None } else { Some(stage) };
                    if let Err(e) = self.storage.update_job_progress(&job_id, progress, total_progress, stage).await {
                        error!(job_id = %job_id, error = %e, "failed to record job progress");
                    }
                }
                Some(Message::JobCompleted { job_id, result }) => {
                    if let Err(e) = self.storage.complete_job(&job_id, result).await {
                        error!(job_id = %job_id, error = %e, "failed to record job completion");
                    }
                }
                Some(Message::JobFailed { job_id, exception, traceback }) => {
                    let outcome = if exception == USER_CANCELLED_EXCEPTION {
                        self.storage.mark_job_as_canceled(&job_id).await
                    } else {
                        self.storage.mark_job_as_failed(&job_id, exception, traceback).await
                    };
                    if let Err(e) = outcome {
                        error!(job_id = %job_id, error = %e, "failed to record job failure");
                    }
                }
                Some(other) => {
                    // The scheduler mailbox only ever carries worker
                    // lifecycle events; anything else is a programmer error.
                    panic!("programmer error: unexpected message on scheduler mailbox: {other:?}");
                }
                None => {
                    self.scan_for_cancellations().await;
                    tokio::time::sleep(UPDATE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Emit `CancelJob` for every job that is `CANCELING` and has already
    /// transitioned to `RUNNING`. Idempotent: a worker with no matching
    /// running job ignores the message.
    async fn scan_for_cancellations(&self) {
        let jobs = match self.storage.get_all_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to scan jobs for cancellation");
                return;
            }
        };
        for job in jobs.into_iter().filter(|job| job.state == JobState::Canceling) {
            self.bus.send(&self.config.worker_mailbox, Message::CancelJob { job_id: job.job_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_protocol::{FuncRef, Job};
    use jobforge_storage::InMemoryStorage;
    use serde_json::Value;
    use std::time::Duration as StdDuration;

    fn scheduler() -> (Arc<Scheduler>, Arc<dyn StorageBackend>, Arc<MessagingBackend>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let bus = Arc::new(MessagingBackend::new());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                worker_mailbox: "worker".to_string(),
                scheduler_mailbox: "scheduler".to_string(),
            },
            storage.clone(),
            bus.clone(),
        );
        (scheduler, storage, bus)
    }

    async fn wait_for(bus: &MessagingBackend, mailbox: &str, mut predicate: impl FnMut(&Message) -> bool) -> Message {
        for _ in 0..200 {
            if let Some(msg) = bus.pop_matching(mailbox, |m| predicate(m)) {
                return msg;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("timed out waiting for expected message on {mailbox}");
    }

    #[tokio::test]
    async fn dispatch_loop_promotes_scheduled_job_and_sends_start_job() {
        let (scheduler, storage, bus) = scheduler();
        let job = Job::new(FuncRef::new("identity", Value::Null, Value::Null));
        let job_id = job.job_id.clone();
        storage.schedule_job(job).await.unwrap();

        let (dispatch_handle, update_handle) = scheduler.start();

        let started = wait_for(&bus, "worker", |m| matches!(m, Message::StartJob { .. })).await;
        assert!(matches!(started, Message::StartJob { job_id: id, .. } if id == job_id));
        assert_eq!(storage.get_job(&job_id).await.unwrap().state, JobState::Queued);

        scheduler.shutdown();
        dispatch_handle.abort();
        update_handle.abort();
    }

    #[tokio::test]
    async fn update_loop_applies_lifecycle_messages() {
        let (scheduler, storage, bus) = scheduler();
        let job = Job::new(FuncRef::new("identity", Value::Null, Value::Null));
        let job_id = job.job_id.clone();
        storage.schedule_job(job).await.unwrap();
        storage.mark_job_as_queued(&job_id).await.unwrap();

        let (dispatch_handle, update_handle) = scheduler.start();
        dispatch_handle.abort();

        bus.send("scheduler", Message::JobStarted { job_id: job_id.clone() });
        wait_until(&storage, &job_id, JobState::Running).await;

        bus.send(
            "scheduler",
            Message::JobCompleted { job_id: job_id.clone(), result: Value::from(9) },
        );
        wait_until(&storage, &job_id, JobState::Completed).await;

        scheduler.shutdown();
        update_handle.abort();
    }

    #[tokio::test]
    async fn job_failed_with_cancelled_sentinel_is_rewritten_to_canceled() {
        let (scheduler, storage, bus) = scheduler();
        let job = Job::new(FuncRef::new("identity", Value::Null, Value::Null));
        let job_id = job.job_id.clone();
        storage.schedule_job(job).await.unwrap();
        storage.mark_job_as_queued(&job_id).await.unwrap();
        storage.mark_job_as_running(&job_id).await.unwrap();
        storage.mark_job_as_canceling(&job_id).await.unwrap();

        let (dispatch_handle, update_handle) = scheduler.start();
        dispatch_handle.abort();

        bus.send(
            "scheduler",
            Message::JobFailed {
                job_id: job_id.clone(),
                exception: USER_CANCELLED_EXCEPTION.to_string(),
                traceback: String::new(),
            },
        );
        wait_until(&storage, &job_id, JobState::Canceled).await;

        scheduler.shutdown();
        update_handle.abort();
    }

    #[tokio::test]
    async fn scans_for_canceling_running_jobs_and_emits_cancel_job() {
        let (scheduler, storage, bus) = scheduler();
        let job = Job::new(FuncRef::new("identity", Value::Null, Value::Null));
        let job_id = job.job_id.clone();
        storage.schedule_job(job).await.unwrap();
        storage.mark_job_as_queued(&job_id).await.unwrap();
        storage.mark_job_as_running(&job_id).await.unwrap();
        storage.mark_job_as_canceling(&job_id).await.unwrap();

        let (dispatch_handle, update_handle) = scheduler.start();
        dispatch_handle.abort();

        let cancel = wait_for(&bus, "worker", |m| matches!(m, Message::CancelJob { .. })).await;
        assert!(matches!(cancel, Message::CancelJob { job_id: id } if id == job_id));

        scheduler.shutdown();
        update_handle.abort();
    }

    async fn wait_until(storage: &Arc<dyn StorageBackend>, job_id: &jobforge_protocol::JobId, state: JobState) {
        for _ in 0..200 {
            if storage.get_job(job_id).await.unwrap().state == state {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("timed out waiting for job to reach {state:?}");
    }
}
