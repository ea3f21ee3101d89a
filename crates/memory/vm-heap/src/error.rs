//! Error types for the managed heap

use crate::object::{Address, Generation};
use crate::oom::OomReason;

/// Heap operation result type
pub type GcResult<T> = Result<T, GcError>;

/// Errors that can occur while allocating, collecting or inspecting the heap
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GcError {
    /// Allocation could not be satisfied even after a last-chance collection
    #[error("out of memory ({reason}): requested {requested} bytes in {generation:?}")]
    OutOfMemory {
        /// Failure cause
        reason: OomReason,
        /// Requested bytes
        requested: usize,
        /// Target generation
        generation: Generation,
    },

    /// The virtual-memory provider could not reserve address space
    #[error("address space reservation of {size} bytes failed")]
    ReserveFailed {
        /// Requested reservation size
        size: usize,
    },

    /// The virtual-memory provider refused to commit a range
    #[error("commit of {size} bytes at {start} failed")]
    CommitFailed {
        /// Start of the range
        start: Address,
        /// Size of the range
        size: usize,
    },

    /// A background mark cycle was cancelled; the collector falls back to a blocking mark
    #[error("concurrent mark aborted: {reason}")]
    ConcurrentMarkAborted {
        /// Why the cycle was abandoned
        reason: String,
    },

    /// Heap verification found a broken invariant after compaction
    #[error("compaction invariant violated: {0}")]
    CompactionInvariantViolation(String),

    /// The field exists in the catalogue but is not available in this configuration
    #[error("diagnostic field `{0}` is missing in this configuration")]
    DiagnosticFieldMissing(String),

    /// The field name is not part of the catalogue
    #[error("unknown diagnostic field `{0}`")]
    UnknownDiagnosticField(String),

    /// The field exists but carries a different type tag
    #[error("diagnostic field `{name}` has type {actual}, expected {expected}")]
    DiagnosticTypeMismatch {
        /// Field name
        name: String,
        /// Type tag requested by the reader
        expected: String,
        /// Type tag in the catalogue
        actual: String,
    },

    /// A finalizer returned an error or panicked
    #[error("finalizer for {object} failed: {message}")]
    FinalizerFault {
        /// Object being finalized
        object: Address,
        /// Failure description
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid GC configuration: {0}")]
    InvalidConfig(String),

    /// Address does not name a live object
    #[error("no object at {0}")]
    InvalidAddress(Address),

    /// Handle was freed or never existed
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    /// Segment handle is stale
    #[error("invalid segment handle {0}")]
    InvalidSegment(u32),

    /// Heap index out of range
    #[error("invalid heap index {0}")]
    InvalidHeap(usize),

    /// Reference slot index out of range for the object
    #[error("object {object} has no reference slot {slot}")]
    InvalidSlot {
        /// Object address
        object: Address,
        /// Slot index
        slot: usize,
    },

    /// Snapshot (de)serialization failed
    #[error("diagnostic snapshot error: {0}")]
    Snapshot(String),
}

impl GcError {
    /// Create an out-of-memory error
    pub fn out_of_memory(reason: OomReason, requested: usize, generation: Generation) -> Self {
        Self::OutOfMemory {
            reason,
            requested,
            generation,
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a compaction invariant error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::CompactionInvariantViolation(msg.into())
    }

    /// Create a concurrent mark abort error
    pub fn mark_aborted(reason: impl Into<String>) -> Self {
        Self::ConcurrentMarkAborted {
            reason: reason.into(),
        }
    }

    /// Whether this is an allocation failure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl From<serde_json::Error> for GcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GcError::invalid_config("card size");
        assert!(err.to_string().contains("card size"));
    }

    #[test]
    fn test_out_of_memory_display() {
        let err = GcError::out_of_memory(OomReason::CommitFailed, 4096, Generation::Gen0);
        assert!(err.is_out_of_memory());
        let text = err.to_string();
        assert!(text.contains("4096"));
        assert!(text.contains("commit"));
    }

    #[test]
    fn test_missing_field_display() {
        let err = GcError::DiagnosticFieldMissing("mark_array".into());
        assert!(err.to_string().contains("mark_array"));
    }
}
