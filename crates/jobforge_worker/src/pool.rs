//! The worker pool: owns a fixed number of execution slots and runs jobs
//! either as blocking tokio tasks (THREAD) or host-binary subprocesses
//! (PROCESS).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobforge_messaging::MessagingBackend;
use jobforge_protocol::{pack_frame, Header, JobId, Message, OpCode, HEADER_SIZE};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::context::{ExecutionContext, ProgressSink};
use crate::error::HandlerError;
use crate::framing::{ErrorPayload, ProgressPayload};
use crate::registry::HandlerRegistry;
use crate::subprocess::SUBPROCESS_FLAG;

/// Which execution substrate the pool uses for every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerType {
    Thread,
    Process,
}

pub struct WorkerPoolConfig {
    pub worker_type: WorkerType,
    pub num_workers: usize,
    pub worker_mailbox: String,
    pub scheduler_mailbox: String,
}

trait RunningJob: Send + Sync {
    fn request_cancel(&self);
}

struct ThreadRunningJob(CancellationToken);

impl RunningJob for ThreadRunningJob {
    fn request_cancel(&self) {
        self.0.cancel();
    }
}

struct ProcessRunningJob(tokio::sync::mpsc::UnboundedSender<()>);

impl RunningJob for ProcessRunningJob {
    fn request_cancel(&self) {
        let _ = self.0.send(());
    }
}

/// Publishes progress reports straight to the scheduler mailbox. Used by
/// THREAD-mode jobs, which share the process with the rest of the engine.
struct MailboxProgressSink {
    bus: Arc<MessagingBackend>,
    mailbox: String,
    job_id: JobId,
}

impl ProgressSink for MailboxProgressSink {
    fn report(&self, progress: f64, total_progress: f64, stage: Option<String>) {
        self.bus.send(
            &self.mailbox,
            Message::JobUpdated {
                job_id: self.job_id.clone(),
                progress,
                total_progress,
                stage: stage.unwrap_or_default(),
            },
        );
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    bus: Arc<MessagingBackend>,
    registry: Arc<HandlerRegistry>,
    free_slots: Arc<AtomicUsize>,
    running: Arc<Mutex<HashMap<JobId, Arc<dyn RunningJob>>>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, bus: Arc<MessagingBackend>, registry: Arc<HandlerRegistry>) -> Arc<Self> {
        let num_workers = config.num_workers;
        Arc::new(Self {
            config,
            bus,
            registry,
            free_slots: Arc::new(AtomicUsize::new(num_workers)),
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Begin consuming the incoming mailbox. Returns the dispatch task's
    /// handle so a caller can join it during an orderly shutdown.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.dispatch_loop().await })
    }

    /// Stop accepting new jobs. With `wait`, block until every running job
    /// reaches a terminal state; otherwise signal cancel to all of them and
    /// return promptly.
    pub async fn shutdown(&self, wait: bool) {
        self.shutdown.store(true, Ordering::SeqCst);
        if wait {
            while !self.running.lock().expect("running jobs lock poisoned").is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        } else {
            let running = self.running.lock().expect("running jobs lock poisoned");
            for job in running.values() {
                job.request_cancel();
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.bus.pop(&self.config.worker_mailbox) {
                Some(Message::StartJob { job_id, handler, args, kwargs, track_progress, cancellable }) => {
                    self.handle_start(job_id, handler, args, kwargs, track_progress, cancellable).await;
                }
                Some(Message::CancelJob { job_id }) => {
                    self.handle_cancel(&job_id);
                }
                Some(other) => {
                    // The worker mailbox only ever carries StartJob/CancelJob;
                    // anything else reaching here is a programmer error.
                    panic!("programmer error: unexpected message on worker mailbox: {other:?}");
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }

    fn handle_cancel(&self, job_id: &JobId) {
        // Idempotent: a cancel for a job with no matching running handle
        // (already finished, or never dispatched here) is simply ignored.
        if let Some(job) = self.running.lock().expect("running jobs lock poisoned").get(job_id) {
            job.request_cancel();
        }
    }

    async fn handle_start(
        &self,
        job_id: JobId,
        handler: String,
        args: Value,
        kwargs: Value,
        track_progress: bool,
        cancellable: bool,
    ) {
        let acquired = self
            .free_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |slots| {
                if slots > 0 {
                    Some(slots - 1)
                } else {
                    None
                }
            })
            .is_ok();

        if !acquired {
            // No free slot: push the job back onto our own mailbox so a
            // later dispatch-loop tick retries it once a slot frees up.
            self.bus.send(
                &self.config.worker_mailbox,
                Message::StartJob { job_id, handler, args, kwargs, track_progress, cancellable },
            );
            return;
        }

        self.bus.send(
            &self.config.scheduler_mailbox,
            Message::JobStarted { job_id: job_id.clone() },
        );

        match self.config.worker_type {
            WorkerType::Thread => self.spawn_thread_job(job_id, handler, args, kwargs, track_progress, cancellable),
            WorkerType::Process => self.spawn_process_job(job_id, handler, args, kwargs, track_progress, cancellable).await,
        }
    }

    fn release_slot(&self, job_id: &JobId) {
        self.free_slots.fetch_add(1, Ordering::SeqCst);
        self.running.lock().expect("running jobs lock poisoned").remove(job_id);
    }

    fn spawn_thread_job(
        &self,
        job_id: JobId,
        handler_id: String,
        args: Value,
        kwargs: Value,
        track_progress: bool,
        cancellable: bool,
    ) {
        let Some(handler) = self.registry.get(&handler_id) else {
            self.bus.send(
                &self.config.scheduler_mailbox,
                Message::JobFailed {
                    job_id: job_id.clone(),
                    exception: format!("no handler registered with id {handler_id:?}"),
                    traceback: String::new(),
                },
            );
            self.free_slots.fetch_add(1, Ordering::SeqCst);
            return;
        };

        let cancel = CancellationToken::new();
        self.running
            .lock()
            .expect("running jobs lock poisoned")
            .insert(job_id.clone(), Arc::new(ThreadRunningJob(cancel.clone())));

        let sink = Arc::new(MailboxProgressSink {
            bus: self.bus.clone(),
            mailbox: self.config.scheduler_mailbox.clone(),
            job_id: job_id.clone(),
        });
        let ctx = ExecutionContext::new(job_id.clone(), track_progress, cancellable, cancel, sink);

        let bus = self.bus.clone();
        let scheduler_mailbox = self.config.scheduler_mailbox.clone();
        let free_slots = self.free_slots.clone();
        let running = self.running.clone();
        let job_id_for_task = job_id.clone();

        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&ctx, args, kwargs)))
            })
            .await;

            let message = match outcome {
                Ok(Ok(Ok(value))) => Message::JobCompleted { job_id: job_id_for_task.clone(), result: value },
                Ok(Ok(Err(HandlerError::Cancelled))) => Message::JobFailed {
                    job_id: job_id_for_task.clone(),
                    exception: jobforge_protocol::USER_CANCELLED_EXCEPTION.to_string(),
                    traceback: String::new(),
                },
                Ok(Ok(Err(HandlerError::Failed { message, traceback }))) => {
                    Message::JobFailed { job_id: job_id_for_task.clone(), exception: message, traceback }
                }
                Ok(Err(panic)) => Message::JobFailed {
                    job_id: job_id_for_task.clone(),
                    exception: panic_message(&panic),
                    traceback: String::new(),
                },
                Err(join_err) => Message::JobFailed {
                    job_id: job_id_for_task.clone(),
                    exception: format!("worker thread died: {join_err}"),
                    traceback: String::new(),
                },
            };

            bus.send(&scheduler_mailbox, message);
            free_slots.fetch_add(1, Ordering::SeqCst);
            running.lock().expect("running jobs lock poisoned").remove(&job_id_for_task);
        });
    }

    async fn spawn_process_job(
        &self,
        job_id: JobId,
        handler_id: String,
        args: Value,
        kwargs: Value,
        track_progress: bool,
        cancellable: bool,
    ) {
        let exe = match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => {
                self.fail_without_dispatch(&job_id, &format!("could not resolve host binary path: {e}"));
                return;
            }
        };

        let mut child = match tokio::process::Command::new(exe)
            .arg(SUBPROCESS_FLAG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.fail_without_dispatch(&job_id, &format!("failed to spawn worker subprocess: {e}"));
                return;
            }
        };

        let start_message = Message::StartJob {
            job_id: job_id.clone(),
            handler: handler_id,
            args,
            kwargs,
            track_progress,
            cancellable,
        };
        let start_frame = match pack_frame(OpCode::Start, &start_message) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail_without_dispatch(&job_id, &format!("failed to encode start frame: {e}"));
                return;
            }
        };

        let mut stdin = child.stdin.take().expect("child stdin was piped");
        let stdout = child.stdout.take().expect("child stdout was piped");

        let (cancel_tx, mut cancel_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        self.running
            .lock()
            .expect("running jobs lock poisoned")
            .insert(job_id.clone(), Arc::new(ProcessRunningJob(cancel_tx)));

        tokio::spawn(async move {
            if stdin.write_all(&start_frame).await.is_err() {
                return;
            }
            let _ = stdin.flush().await;
            while cancel_rx.recv().await.is_some() {
                if let Ok(frame) = pack_frame(OpCode::Cancel, &serde_json::json!({})) {
                    let _ = stdin.write_all(&frame).await;
                    let _ = stdin.flush().await;
                }
            }
        });

        let bus = self.bus.clone();
        let scheduler_mailbox = self.config.scheduler_mailbox.clone();
        let free_slots = self.free_slots.clone();
        let running = self.running.clone();
        let job_id_for_task = job_id.clone();

        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut got_terminal = false;

            loop {
                match read_frame_async(&mut stdout).await {
                    Ok((OpCode::Progress, payload)) => {
                        if let Ok(p) = serde_json::from_slice::<ProgressPayload>(&payload) {
                            bus.send(
                                &scheduler_mailbox,
                                Message::JobUpdated {
                                    job_id: job_id_for_task.clone(),
                                    progress: p.progress,
                                    total_progress: p.total_progress,
                                    stage: p.stage.unwrap_or_default(),
                                },
                            );
                        }
                    }
                    Ok((OpCode::Result, payload)) => {
                        if let Ok(value) = serde_json::from_slice::<Value>(&payload) {
                            bus.send(
                                &scheduler_mailbox,
                                Message::JobCompleted { job_id: job_id_for_task.clone(), result: value },
                            );
                        }
                        got_terminal = true;
                        break;
                    }
                    Ok((OpCode::Error, payload)) => {
                        if let Ok(err) = serde_json::from_slice::<ErrorPayload>(&payload) {
                            let exception =
                                if err.cancelled { jobforge_protocol::USER_CANCELLED_EXCEPTION.to_string() } else { err.message };
                            bus.send(
                                &scheduler_mailbox,
                                Message::JobFailed { job_id: job_id_for_task.clone(), exception, traceback: err.traceback },
                            );
                        }
                        got_terminal = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }

            let _ = child.wait().await;
            if !got_terminal {
                warn!(job_id = %job_id_for_task, "worker subprocess exited without a result");
                bus.send(
                    &scheduler_mailbox,
                    Message::JobFailed {
                        job_id: job_id_for_task.clone(),
                        exception: "worker process died".to_string(),
                        traceback: String::new(),
                    },
                );
            }

            free_slots.fetch_add(1, Ordering::SeqCst);
            running.lock().expect("running jobs lock poisoned").remove(&job_id_for_task);
        });
    }

    fn fail_without_dispatch(&self, job_id: &JobId, message: &str) {
        error!(job_id = %job_id, error = message, "failed to start job");
        self.bus.send(
            &self.config.scheduler_mailbox,
            Message::JobFailed { job_id: job_id.clone(), exception: message.to_string(), traceback: String::new() },
        );
        self.free_slots.fetch_add(1, Ordering::SeqCst);
    }
}

async fn read_frame_async(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
) -> std::io::Result<(OpCode, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = Header::unpack(&header_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;
    Ok((header.opcode, payload))
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use std::time::Duration as StdDuration;

    fn pool_with(worker_type: WorkerType, num_workers: usize, registry: HandlerRegistry) -> (Arc<WorkerPool>, Arc<MessagingBackend>) {
        let bus = Arc::new(MessagingBackend::new());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                worker_type,
                num_workers,
                worker_mailbox: "worker".to_string(),
                scheduler_mailbox: "scheduler".to_string(),
            },
            bus.clone(),
            Arc::new(registry),
        );
        (pool, bus)
    }

    #[tokio::test]
    async fn thread_mode_happy_path_emits_started_then_completed() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", |_ctx, args, _kwargs| {
            let n = args.as_i64().unwrap_or(0);
            Ok(Value::from(n * 2))
        });
        let (pool, bus) = pool_with(WorkerType::Thread, 2, registry);
        let _handle = pool.start();

        let job_id = JobId::new();
        bus.send(
            "worker",
            Message::StartJob {
                job_id: job_id.clone(),
                handler: "double".to_string(),
                args: Value::from(21),
                kwargs: Value::Null,
                track_progress: false,
                cancellable: false,
            },
        );

        let started = wait_for(&bus, |m| matches!(m, Message::JobStarted { .. })).await;
        assert!(matches!(started, Message::JobStarted { job_id: id } if id == job_id));

        let completed = wait_for(&bus, |m| matches!(m, Message::JobCompleted { .. })).await;
        match completed {
            Message::JobCompleted { result, .. } => assert_eq!(result, Value::from(42)),
            other => panic!("expected JobCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn thread_mode_handler_failure_is_reported() {
        let mut registry = HandlerRegistry::new();
        registry.register("boom", |_ctx, _args, _kwargs| Err(HandlerError::failed("kaboom")));
        let (pool, bus) = pool_with(WorkerType::Thread, 1, registry);
        let _handle = pool.start();

        bus.send(
            "worker",
            Message::StartJob {
                job_id: JobId::new(),
                handler: "boom".to_string(),
                args: Value::Null,
                kwargs: Value::Null,
                track_progress: false,
                cancellable: false,
            },
        );

        let _ = wait_for(&bus, |m| matches!(m, Message::JobStarted { .. })).await;
        let failed = wait_for(&bus, |m| matches!(m, Message::JobFailed { .. })).await;
        match failed {
            Message::JobFailed { exception, .. } => assert_eq!(exception, "kaboom"),
            other => panic!("expected JobFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_handler_fails_without_consuming_a_slot_permanently() {
        let (pool, bus) = pool_with(WorkerType::Thread, 1, HandlerRegistry::new());
        let _handle = pool.start();

        bus.send(
            "worker",
            Message::StartJob {
                job_id: JobId::new(),
                handler: "does-not-exist".to_string(),
                args: Value::Null,
                kwargs: Value::Null,
                track_progress: false,
                cancellable: false,
            },
        );

        let failed = wait_for(&bus, |m| matches!(m, Message::JobFailed { .. })).await;
        assert!(matches!(failed, Message::JobFailed { .. }));
        assert_eq!(pool.free_slots.load(Ordering::SeqCst), 1);
    }

    async fn wait_for(bus: &MessagingBackend, mut predicate: impl FnMut(&Message) -> bool) -> Message {
        for _ in 0..200 {
            if let Some(msg) = bus.pop_matching("scheduler", |m| predicate(m)) {
                return msg;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("timed out waiting for expected message on scheduler mailbox");
    }
}
