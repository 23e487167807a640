use std::path::PathBuf;

pub use jobforge_worker::WorkerType;

/// Which storage backend an [`crate::Engine`] persists jobs to.
#[derive(Debug, Clone)]
pub enum StorageKind {
    Memory,
    Sqlite(PathBuf),
}

/// Construction-time configuration for an [`crate::Engine`]. Plain data, no
/// environment-driven magic; a caller builds one explicitly and hands it to
/// `Engine::new`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_type: WorkerType,
    pub storage: StorageKind,
    pub num_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_type: WorkerType::Thread,
            storage: StorageKind::Memory,
            num_workers: 4,
        }
    }
}
