//! The engine's own error seam. Crate-level errors from each collaborator
//! are wrapped here; `anyhow` takes over at the demo binary and tests, per
//! the library-uses-thiserror / binary-uses-anyhow split.

use jobforge_ids::JobId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no job found with id {0}")]
    JobNotFound(JobId),

    #[error("timed out waiting for job {0}")]
    Timeout(JobId),

    #[error(transparent)]
    Storage(#[from] jobforge_storage::StorageError),
}
