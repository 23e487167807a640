//! Errors for the wire protocol and job data model.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode: {0}")]
    InvalidOpCode(u8),

    #[error("header too short: expected at least {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An unknown message variant reached a place that cannot legally handle
    /// it. This can only happen through a deserialization bug and is treated
    /// as a programmer error: callers are expected to panic on it, not retry.
    #[error("programmer error: unexpected message variant reached {0}")]
    UnexpectedVariant(&'static str),

    /// A job state transition outside the legal lifecycle graph was attempted.
    #[error("illegal job state transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: crate::job::JobState,
        to: crate::job::JobState,
    },
}
