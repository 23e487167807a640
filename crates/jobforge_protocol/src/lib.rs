//! Wire types and job data model shared between the scheduler, the worker
//! pool, and the storage backend.

pub mod error;
pub mod job;
pub mod message;

pub use error::{ProtocolError, Result};
pub use job::{FuncRef, Job, JobState, USER_CANCELLED_EXCEPTION};
pub use message::{pack_frame, unpack_frame, Header, Message, OpCode, HEADER_SIZE, PROTOCOL_VERSION};

pub use jobforge_ids::{JobId, MailboxName};
