use thiserror::Error;
use uuid::Uuid;

/// Core error type for the ordo orchestration engine.
///
/// Uses `thiserror` with `#[source]` annotations so error chains survive
/// into logs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization failed when encoding a value to bytes.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding bytes to a value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// A replayed step does not match what the history recorded.
    #[error("incompatible flow structure at step {step}: expected {expected}, got {actual}")]
    IncompatibleFlowStructure {
        step: i32,
        expected: String,
        actual: String,
    },

    /// The requested invocation was not found in storage.
    #[error("invocation not found: id={id}, step={step}")]
    InvocationNotFound { id: Uuid, step: i32 },

    /// The requested flow was not found in storage.
    #[error("flow not found: id={0}")]
    FlowNotFound(Uuid),

    /// An invalid status string was encountered during parsing.
    #[error("invalid invocation status: {0}")]
    InvalidStatus(String),

    /// An invalid step kind string was encountered during parsing.
    #[error("invalid step kind: {0}")]
    InvalidStepKind(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
