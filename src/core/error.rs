//! Error types for stackpar.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Surface shape and allocation problems before any OS resource exists
//! - Aggregate worker failures into a single error per dispatch call
//! - Keep the failing transform's error chain via `source()`

use thiserror::Error;

/// Top-level error type for the engine.
#[derive(Error, Debug)]
pub enum StackError {
    /// A shape or element size that cannot describe an array.
    #[error("Invalid shape {shape:?}: {reason}")]
    InvalidShape {
        /// The offending shape.
        shape: Vec<usize>,
        /// Why it was rejected.
        reason: String,
    },

    /// The array does not have the rank or extent the operation expects.
    #[error("Shape error: {0}")]
    Shape(String),

    /// A shared allocation would not fit into free system memory.
    #[error("Insufficient memory: need {required} bytes, have {available} bytes")]
    OutOfMemory {
        /// Bytes the allocation needs.
        required: u64,
        /// Bytes reported free by the memory probe.
        available: u64,
    },

    /// A transform failed on at least one unit of work.
    #[error("Worker failed on index {index} ({failed_units} unit(s) failed): {source}")]
    WorkerFailure {
        /// Lowest index whose transform failed.
        index: usize,
        /// Number of indices that failed before the pool drained.
        failed_units: usize,
        /// The error produced by the transform at `index`.
        #[source]
        source: anyhow::Error,
    },

    /// The progress sink was cancelled before the dispatch was scheduled.
    #[error("Execution cancelled before dispatch")]
    Cancelled,

    /// The OS refused to create or map a shared segment.
    #[error("Shared memory allocation failed: {0}")]
    Allocation(String),

    /// The worker pool could not be built.
    #[error("Worker pool error: {0}")]
    Pool(String),

    /// Configuration could not be parsed or contains invalid values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackError {
    /// Build an [`StackError::InvalidShape`] from a shape slice.
    pub fn invalid_shape(shape: &[usize], reason: impl Into<String>) -> Self {
        StackError::InvalidShape {
            shape: shape.to_vec(),
            reason: reason.into(),
        }
    }

    /// Check if the caller can retry the same call after changing its inputs
    /// (fewer cores, smaller stack). Worker failures require re-running the
    /// whole operation, never resuming it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StackError::InvalidShape { .. }
                | StackError::Shape(_)
                | StackError::WorkerFailure { .. }
                | StackError::Cancelled
        )
    }

    /// Index of the failing unit, if this is a worker failure.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            StackError::WorkerFailure { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl From<rustix::io::Errno> for StackError {
    fn from(errno: rustix::io::Errno) -> Self {
        StackError::Io(errno.into())
    }
}

/// Result type alias for engine operations.
pub type StackResult<T> = Result<T, StackError>;
