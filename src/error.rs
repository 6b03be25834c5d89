//! Error types for trackproof.
//!
//! Errors are strongly typed using thiserror and split by the stage that
//! produces them:
//! - `ValidationError`: construction and proposal time. Fatal for the input
//!   that caused it; the correction log is left untouched.
//! - `ExecutionError`: resolution and materialization time. Fatal only for the
//!   offending correction, which is rejected and reported.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vertex::TrackId;

/// Errors raised while validating inputs and proposals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Schema error in column '{column}': {reason}")]
    Schema {
        column: String,
        reason: String,
    },

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid correction kind '{kind}'")]
    InvalidKind {
        kind: String,
    },

    #[error("Malformed '{kind}' payload: {reason}")]
    MalformedPayload {
        kind: String,
        reason: String,
    },

    #[error("Too many proposed corrections (max: {max})")]
    TooManyProposals {
        max: usize,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn schema(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while resolving or materializing corrections.
///
/// Serializable so conflict reports can travel to editing surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("Cycle detected in lineage graph at track {track}")]
    CycleDetected {
        track: TrackId,
    },

    #[error("Out-of-order merge into track {track} at t={t}")]
    OutOfOrderMerge {
        track: TrackId,
        t: i64,
    },

    #[error("Vertex not found: track {track} at t={t}")]
    VertexNotFound {
        track: TrackId,
        t: i64,
    },

    #[error("Vertex collision: track {track} already has a vertex at t={t}")]
    VertexCollision {
        track: TrackId,
        t: i64,
    },

    #[error("Unknown track: {track}")]
    UnknownTrack {
        track: TrackId,
    },

    #[error("Track {track} was joined into track {into}")]
    TrackAbsorbed {
        track: TrackId,
        into: TrackId,
    },

    #[error("Parent link {parent} -> {child} already exists")]
    EdgeExists {
        child: TrackId,
        parent: TrackId,
    },

    #[error("Parent link {parent} -> {child} not found")]
    EdgeNotFound {
        child: TrackId,
        parent: TrackId,
    },

    #[error("Correction not found: {id}")]
    CorrectionNotFound {
        id: u64,
    },

    #[error("Correction {id} is not implemented and cannot be retracted")]
    NotImplemented {
        id: u64,
    },

    #[error("Correction kind '{kind}' has no inverse")]
    NoInverse {
        kind: String,
    },

    #[error("Recompute queue full (capacity: {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Recompute worker disconnected")]
    Disconnected,

    #[error("Recompute timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Collaborator failed: {message}")]
    Collaborator {
        message: String,
    },
}

/// Top-level error type for trackproof.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ProofError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns the validation error, if any.
    #[must_use]
    pub const fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the execution error, if any.
    #[must_use]
    pub const fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            Self::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for trackproof operations.
pub type ProofResult<T> = Result<T, ProofError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_message() {
        let err = ValidationError::schema("t", "expected integer column");
        let msg = format!("{err}");
        assert!(msg.contains("'t'"));
        assert!(msg.contains("expected integer column"));
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = ValidationError::DimensionMismatch {
            what: "labels".to_string(),
            expected: "[4, 1, 8, 8]".to_string(),
            actual: "[3, 1, 8, 8]".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("labels"));
        assert!(msg.contains("[3, 1, 8, 8]"));
    }

    #[test]
    fn test_cycle_message() {
        let err = ExecutionError::CycleDetected { track: TrackId(3) };
        assert!(err.to_string().contains("track 3"));
    }

    #[test]
    fn test_proof_error_from_validation() {
        let err: ProofError = ValidationError::InvalidKind {
            kind: "teleport".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_execution());
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::InvalidKind { .. })
        ));
    }

    #[test]
    fn test_proof_error_from_execution() {
        let err: ProofError = ExecutionError::OutOfOrderMerge {
            track: TrackId(9),
            t: 4,
        }
        .into();
        assert!(err.is_execution());
        assert_eq!(
            err.as_execution(),
            Some(&ExecutionError::OutOfOrderMerge {
                track: TrackId(9),
                t: 4
            })
        );
    }

    #[test]
    fn test_internal() {
        let err = ProofError::internal("poisoned lock");
        assert!(err.is_internal());
        assert!(err.to_string().contains("poisoned lock"));
    }
}
