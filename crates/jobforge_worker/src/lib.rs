//! The worker pool: executes registered handlers on THREAD or PROCESS
//! substrates and reports lifecycle events back to the scheduler mailbox.

mod cancel;
mod context;
mod error;
mod framing;
mod pool;
mod registry;
mod subprocess;

pub use cancel::CancellationToken;
pub use context::{ExecutionContext, NullProgressSink, ProgressSink};
pub use error::HandlerError;
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerType};
pub use registry::{Handler, HandlerRegistry};
pub use subprocess::{run_subprocess_entrypoint, SUBPROCESS_FLAG};
