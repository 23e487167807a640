//! Errors from the storage backend.

use jobforge_protocol::JobId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("timed out waiting for job {job_id} to update")]
    Timeout { job_id: JobId },

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A storage write attempted an illegal state transition. This is a
    /// programmer error (the scheduler/worker pool is the only caller and is
    /// expected to only ever request legal transitions) and is surfaced
    /// loudly rather than retried.
    #[error("illegal state transition: {0}")]
    IllegalTransition(#[from] jobforge_protocol::ProtocolError),
}

impl StorageError {
    pub fn not_found(job_id: JobId) -> Self {
        Self::NotFound(job_id)
    }
}
