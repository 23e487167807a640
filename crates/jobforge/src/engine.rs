//! The engine: owns storage, the mailbox bus, the worker pool, and the
//! scheduler as one explicitly constructed value. There is no global
//! singleton; an application can run more than one `Engine` side by side,
//! each with its own pair of mailbox names.

use std::sync::Arc;

use jobforge_ids::MailboxName;
use jobforge_messaging::MessagingBackend;
use jobforge_protocol::Message;
use jobforge_scheduler::{Scheduler, SchedulerConfig};
use jobforge_storage::{InMemoryStorage, SqliteStorage, StorageBackend};
use jobforge_worker::{HandlerRegistry, WorkerPool, WorkerPoolConfig};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{EngineConfig, StorageKind};

/// A running instance of the job engine. Construct with [`Engine::new`],
/// tear down with [`Engine::shutdown`]; there is nothing else to manage.
pub struct Engine {
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) bus: Arc<MessagingBackend>,
    pub(crate) worker_mailbox: String,
    scheduler: Arc<Scheduler>,
    worker_pool: Arc<WorkerPool>,
    scheduler_handles: std::sync::Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    worker_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the storage backend, wire the two mailbox names together, and
    /// start the scheduler's and worker pool's background loops.
    pub async fn new(config: EngineConfig, registry: HandlerRegistry) -> crate::error::Result<Arc<Self>> {
        let storage: Arc<dyn StorageBackend> = match config.storage {
            StorageKind::Memory => Arc::new(InMemoryStorage::new()),
            StorageKind::Sqlite(path) => {
                let url = format!("sqlite:{}?mode=rwc", path.display());
                Arc::new(SqliteStorage::connect(&url).await?)
            }
        };
        let bus = Arc::new(MessagingBackend::new());

        // Two random mailbox names, one per direction, owned by this engine
        // instance rather than any process-global state.
        let worker_mailbox = MailboxName::new().to_string();
        let worker_mailbox_for_field = worker_mailbox.clone();
        let scheduler_mailbox = MailboxName::new().to_string();

        let worker_pool = WorkerPool::new(
            WorkerPoolConfig {
                worker_type: config.worker_type,
                num_workers: config.num_workers,
                worker_mailbox: worker_mailbox.clone(),
                scheduler_mailbox: scheduler_mailbox.clone(),
            },
            bus.clone(),
            Arc::new(registry),
        );

        let scheduler = Scheduler::new(
            SchedulerConfig { worker_mailbox, scheduler_mailbox },
            storage.clone(),
            bus.clone(),
        );

        info!(num_workers = config.num_workers, "starting jobforge engine");
        let worker_handle = worker_pool.start();
        let scheduler_handles = scheduler.start();

        Ok(Arc::new(Self {
            storage,
            bus,
            worker_mailbox: worker_mailbox_for_field,
            scheduler,
            worker_pool,
            scheduler_handles: std::sync::Mutex::new(Some(scheduler_handles)),
            worker_handle: std::sync::Mutex::new(Some(worker_handle)),
        }))
    }

    /// Stop accepting new dispatch. With `wait`, block until every running
    /// job reaches a terminal state before returning; otherwise request
    /// cancellation of all of them and return once the control loops exit.
    pub async fn shutdown(&self, wait: bool) {
        self.scheduler.shutdown();
        self.worker_pool.shutdown(wait).await;

        if let Some((dispatch, update)) = self.scheduler_handles.lock().expect("poisoned").take() {
            let _ = dispatch.await;
            let _ = update.await;
        }
        if let Some(handle) = self.worker_handle.lock().expect("poisoned").take() {
            let _ = handle.await;
        }
    }

    /// Send an immediate cancel request to every job still in a non-terminal
    /// state, without waiting for the scheduler's own CANCELING scan tick.
    /// Used by `Client::clear(force=true)`, which clears storage out from
    /// under any running job and needs its execution stopped promptly too.
    pub(crate) async fn cancel_all_running(&self) -> jobforge_storage::Result<()> {
        for job in self.storage.get_all_jobs().await? {
            if !job.state.is_terminal() {
                self.bus.send(&self.worker_mailbox, Message::CancelJob { job_id: job.job_id });
            }
        }
        Ok(())
    }
}
