//! Payload shapes framed over the PROCESS-mode subprocess pipe. Shared by
//! the child entry point (`subprocess.rs`) and the parent-side reader
//! (`pool.rs`) so both sides agree on the wire shape without duplicating it.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub(crate) struct ProgressPayload {
    pub progress: f64,
    pub total_progress: f64,
    pub stage: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct ErrorPayload {
    pub message: String,
    pub traceback: String,
    pub cancelled: bool,
}
