//! Error types for the parity engine
//!
//! Two kinds of failure exist. Recoverable conditions are values of [`Error`]
//! and travel up the call stack as `Result`s. Broken internal invariants are
//! [`InvariantViolation`]s: they are never converted into an `Error`, they
//! terminate the current execution path instead.

use std::fmt;

use thiserror::Error;

use crate::raid::state::ChunkState;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the parity engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid volume configuration
    #[error("Invalid volume configuration: {0}")]
    InvalidConfig(String),

    /// Logical request rejected before any I/O was issued
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Volume has lost more than one chunk
    #[error("Volume {volume} is offline")]
    VolumeOffline { volume: String },

    /// Write targets a chunk that is offline (no degraded writes)
    #[error("Write rejected: chunk {chunk} is offline")]
    RejectedWrite { chunk: usize },

    /// Chunk is not in a state that allows the requested operation
    #[error("Chunk {chunk} is unavailable ({state})")]
    ChunkUnavailable { chunk: usize, state: ChunkState },

    /// Logical I/O failed after recovery was exhausted
    #[error("I/O failed: {reason}")]
    IoFailed { reason: String },

    /// Work unit, sub-operation or scratch buffer could not be acquired
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    /// Chunk rebuild did not complete
    #[error("Rebuild of chunk {chunk} failed: {reason}")]
    RebuildFailed { chunk: usize, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Invariant Violations
// =============================================================================

/// A condition that can only arise from a programming error or corrupted
/// state: an unlisted chunk or volume transition, or an internal bound that
/// was exceeded.
///
/// There is no conversion into [`Error`]. Callers cannot catch and retry
/// these; [`InvariantViolation::raise`] ends the execution path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Component that detected the violation
    pub component: &'static str,

    /// What was violated
    pub detail: String,
}

impl InvariantViolation {
    pub fn new(component: &'static str, detail: impl Into<String>) -> Self {
        Self {
            component,
            detail: detail.into(),
        }
    }

    /// Log the violation and terminate the current execution path.
    #[track_caller]
    pub fn raise(self) -> ! {
        tracing::error!(component = self.component, "{}", self);
        panic!("{}", self)
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violation: {}: {}", self.component, self.detail)
    }
}
