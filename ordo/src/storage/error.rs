use crate::core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type.
///
/// Wraps the underlying database and serialization errors while preserving
/// the full error chain for debugging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// An I/O operation failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The requested invocation was not found in storage.
    #[error("invocation not found: id={id}, step={step}")]
    InvocationNotFound { id: Uuid, step: i32 },

    /// No queue entry exists for the given task id.
    #[error("scheduled flow not found: task_id={0}")]
    ScheduledFlowNotFound(Uuid),

    /// An instance with the same flow id is already queued.
    #[error("flow already exists: flow_id={0}")]
    DuplicateFlow(Uuid),

    /// Opening the store or decoding a stored row failed.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
