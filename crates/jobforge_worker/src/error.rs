//! Errors surfaced by handler execution.

use thiserror::Error;

/// The outcome a handler reports when it does not simply return a value.
///
/// `Cancelled` is distinct from `Failed`: a handler that notices
/// `ctx.check_for_cancel()` and unwinds is not a bug, it is cooperating with
/// a cancellation request, and the job is recorded as `CANCELED`, not
/// `FAILED`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("{message}")]
    Failed { message: String, traceback: String },
}

impl HandlerError {
    /// Build a `Failed` outcome, capturing the current call stack as its
    /// `traceback` so a `FAILED` job never stores an empty one. Host code
    /// has no Python-style exception traceback to forward, so this is a
    /// Rust backtrace taken at the point of failure instead.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            traceback: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}
