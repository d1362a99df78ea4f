//! Execution error types
//!
//! Error codes:
//! - SHX_CONTRACT_VIOLATION: programming error, fails the stage, never retried
//! - SHX_MEMORY_LIMIT: stage buffers exceeded the job's memory budget
//! - SHX_TRANSPORT_FAILED: a whole bulk/fetch request failed
//! - SHX_EVALUATION_FAILED: expression or aggregate evaluation failed
//! - SHX_IO_FAILED: file export failed
//! - SHX_INTERNAL: cancelled or crashed sub-task

use std::fmt;

use thiserror::Error;

/// Result type for execution operations
pub type ExecResult<T> = Result<T, ExecutionError>;

/// Coarse error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unsupported stage, missing shard identity, mixed-relation assignment
    ContractViolation,
    /// Memory budget exceeded
    Resource,
    /// Failure of an entire remote request
    Transport,
    /// Type or arithmetic error while evaluating a row
    Evaluation,
    /// Local I/O failure
    Io,
    /// Cancellation or crashed sub-task
    Internal,
}

impl ErrorCategory {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::ContractViolation => "SHX_CONTRACT_VIOLATION",
            ErrorCategory::Resource => "SHX_MEMORY_LIMIT",
            ErrorCategory::Transport => "SHX_TRANSPORT_FAILED",
            ErrorCategory::Evaluation => "SHX_EVALUATION_FAILED",
            ErrorCategory::Io => "SHX_IO_FAILED",
            ErrorCategory::Internal => "SHX_INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Execution errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    // ==================
    // Contract violations
    // ==================
    #[error("Unsupported projection: {0}")]
    UnsupportedStage(String),

    #[error("{0} projection can only be executed on a shard")]
    ShardIdentityMissing(&'static str),

    #[error("Mixed table assignments found: {first} and {second}")]
    MixedTableAssignment { first: String, second: String },

    #[error("Invalid projection parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown relation: {0}")]
    UnknownRelation(String),

    #[error("Invalid projector state: {0}")]
    InvalidState(String),

    // ==================
    // Resource errors
    // ==================
    #[error(
        "Memory limit exceeded for [{label}]: requested {requested} bytes, used {used} of {limit} bytes"
    )]
    MemoryLimitExceeded {
        label: String,
        requested: u64,
        used: u64,
        limit: u64,
    },

    // ==================
    // Request errors
    // ==================
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Returns the taxonomy category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecutionError::UnsupportedStage(_)
            | ExecutionError::ShardIdentityMissing(_)
            | ExecutionError::MixedTableAssignment { .. }
            | ExecutionError::InvalidParameter(_)
            | ExecutionError::UnknownRelation(_)
            | ExecutionError::InvalidState(_) => ErrorCategory::ContractViolation,
            ExecutionError::MemoryLimitExceeded { .. } => ErrorCategory::Resource,
            ExecutionError::Transport(_) => ErrorCategory::Transport,
            ExecutionError::Evaluation(_) => ErrorCategory::Evaluation,
            ExecutionError::Io(_) => ErrorCategory::Io,
            ExecutionError::Cancelled | ExecutionError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns the string code of the category
    pub fn code(&self) -> &'static str {
        self.category().code()
    }

    /// Whether this error is a programming-contract violation
    pub fn is_contract_violation(&self) -> bool {
        self.category() == ErrorCategory::ContractViolation
    }

    /// Splits off errors that only concern the row being processed.
    ///
    /// `Ok(message)` for an evaluation failure, which a batched write
    /// records against that one item; any other error is returned as is
    /// and fails the stage.
    pub fn into_item_failure(self) -> Result<String, Self> {
        match self {
            ExecutionError::Evaluation(message) => Ok(message),
            other => Err(other),
        }
    }

    pub fn evaluation(reason: impl Into<String>) -> Self {
        ExecutionError::Evaluation(reason.into())
    }

    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        ExecutionError::InvalidParameter(reason.into())
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        ExecutionError::Io(err.to_string())
    }
}
