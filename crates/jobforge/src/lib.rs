//! In-process job queue and execution engine: schedule registered handlers,
//! run them on a pool of threads or subprocesses, and track their lifecycle
//! through a pluggable storage backend.

mod client;
mod config;
mod engine;
mod error;
pub mod handlers;

pub use client::{Client, ScheduleOptions};
pub use config::{EngineConfig, StorageKind, WorkerType};
pub use engine::Engine;
pub use error::{EngineError, Result};

pub use jobforge_protocol::{FuncRef, Job, JobId, JobState};
pub use jobforge_worker::{run_subprocess_entrypoint, ExecutionContext, HandlerError, HandlerRegistry, SUBPROCESS_FLAG};
