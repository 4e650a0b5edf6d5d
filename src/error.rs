//! Error taxonomy for the engine: a failing operation's forward call, a
//! failed compensation pass, the aggregate surfaced when `continue_on_error`
//! is set, structural misuse of a frozen pipeline, cooperative cancellation,
//! and options validation.

use thiserror::Error;

use crate::workflow::OperationId;

/// Core error type for engine operations.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// An operation's `forward` call returned an error. Carries the failing
    /// operation's identity and the input it was given so the caller can
    /// reconstruct what happened without re-threading state.
    #[error("operation '{operation_name}' ({operation_id}) failed: {source}")]
    OperationFailure {
        operation_id: OperationId,
        operation_name: String,
        input: serde_json::Value,
        #[source]
        source: Box<ForgeError>,
    },

    /// One or more compensation handlers failed while unwinding a run.
    /// Only raised when `throw_on_compensation_error` is set; otherwise
    /// compensation failures are logged and swallowed.
    #[error("compensation failed for {} operation(s): {}", .failed.len(), .failed.iter().map(|f| f.operation_name.as_str()).collect::<Vec<_>>().join(", "))]
    CompensationFailure { failed: Vec<FailedCompensation> },

    /// Surfaced only under `continue_on_error`: the workflow completed its
    /// ordered traversal, but one or more steps recorded an error along the
    /// way. No compensation was performed.
    #[error("workflow completed with {} recorded error(s)", .errors.len())]
    AggregateRunFailure { errors: Vec<ForgeError> },

    /// A mutation (`add_middleware`, `add_operation`, `replace_operations`)
    /// was attempted on a Foundry while a Smith is executing against it.
    #[error("pipeline is frozen: cannot mutate while a run is in progress")]
    PipelineFrozen,

    /// Cooperative cancellation was observed. Not treated as an ordinary
    /// error by callers that distinguish cancellation from failure.
    #[error("operation cancelled")]
    Cancelled,

    /// Options failed validation at construction time.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A for-each `Split` data strategy received an input sequence whose
    /// length did not match the number of child operations.
    #[error("for-each split strategy expected {expected} input elements, got {actual}")]
    SplitArityMismatch { expected: usize, actual: usize },

    /// Generic persistence-provider failure (load/save/delete).
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A value could not be serialized to/from the opaque transport type.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An operation, middleware, or workflow was looked up and not found.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Outcome of a single failed compensation, retained for `CompensationFailure`.
#[derive(Debug, Clone)]
pub struct FailedCompensation {
    pub operation_id: OperationId,
    pub operation_name: String,
    pub error: String,
}

impl From<serde_json::Error> for ForgeError {
    fn from(e: serde_json::Error) -> Self {
        ForgeError::Serialization(e.to_string())
    }
}

/// Result type alias using [`ForgeError`].
pub type Result<T> = std::result::Result<T, ForgeError>;
