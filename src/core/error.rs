//! Error types and handling for the repository
//!
//! This module defines all error types used throughout the system. Storage
//! faults, commit conflicts, protocol violations, stale references and commit
//! timeouts are kept distinguishable so callers can react to each class.

use crate::core::types::{ObjectId, Version};
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store faults, never retried by this crate
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Malformed or out-of-sequence wire data
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Delta bookkeeping errors
    #[error("Delta error: {0}")]
    Delta(#[from] DeltaError),

    /// The committed base version is stale relative to the branch head
    #[error("Commit conflict on {id}: base {base}, head {head}")]
    CommitConflict {
        /// Conflicting object
        id: ObjectId,
        /// Version the client edited
        base: Version,
        /// Current head version on the branch
        head: Version,
    },

    /// The response did not arrive in time. For a commit the server may or
    /// may not have applied it.
    #[error("Timed out after {millis} ms; outcome unknown")]
    Timeout {
        /// Configured bound in milliseconds
        millis: u64,
    },

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The channel or session is closed
    #[error("Session closed: {0}")]
    Closed(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing store rejected or failed an operation
    #[error("Store fault: {0}")]
    Fault(String),

    /// A unique key was written twice
    #[error("Duplicate row for {0}")]
    DuplicateKey(String),

    /// Stored data does not match what the mapping expects
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// A statement handle was used after release
    #[error("Statement {0} is not prepared")]
    StatementReleased(String),
}

/// Wire protocol errors. Any of these tears the owning session down.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Input ended before a complete value could be read
    #[error("Unexpected end of input: need {needed} bytes, have {remaining}")]
    UnexpectedEof {
        /// Bytes required by the read
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Unknown tag byte for an enum-like value
    #[error("Invalid {what} tag {tag}")]
    InvalidTag {
        /// Which kind of tag
        what: &'static str,
        /// Offending tag
        tag: u32,
    },

    /// String payload was not UTF-8
    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,

    /// Structurally invalid data such as a negative count
    #[error("Malformed {0}")]
    Malformed(&'static str),

    /// Signal id not known to the receiver
    #[error("Unknown signal {0}")]
    UnknownSignal(u16),

    /// Message arrived in a state where it is not allowed
    #[error("Out of sequence: {0}")]
    OutOfSequence(String),

    /// Frame exceeds the configured maximum
    #[error("Frame too large: {size} bytes (max: {max_size})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed frame size
        max_size: usize,
    },
}

/// Delta bookkeeping errors
#[derive(Error, Debug)]
pub enum DeltaError {
    /// A delta references an object the view does not know. This indicates a
    /// defect in delta bookkeeping rather than a recoverable condition.
    #[error("Stale reference to {0}")]
    StaleReference(ObjectId),

    /// A list operation addressed an index outside the list
    #[error("Index {index} out of bounds for list of size {size}")]
    IndexOutOfBounds {
        /// Requested index
        index: i32,
        /// Current list size
        size: usize,
    },

    /// A list operation targeted a single-valued feature or vice versa
    #[error("Feature {0} has the wrong multiplicity for this delta")]
    Multiplicity(u16),

    /// Delta addressed to a different object or version
    #[error("Delta for {delta_id} {delta_version} applied to {revision_id} {revision_version}")]
    Mismatch {
        /// Object the delta targets
        delta_id: ObjectId,
        /// Version the delta was computed against
        delta_version: Version,
        /// Object of the revision
        revision_id: ObjectId,
        /// Version of the revision
        revision_version: Version,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stale reference error
    pub fn stale_reference(id: ObjectId) -> Self {
        Self::Delta(DeltaError::StaleReference(id))
    }

    /// Check if this is a commit conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::CommitConflict { .. })
    }

    /// Check if this is a commit timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if the caller may retry after refreshing its state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CommitConflict { .. } | Error::Timeout { .. })
    }

    /// Errors after which the owning session must be torn down
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Closed(_))
    }

    /// Errors signalling an implementation defect rather than a runtime condition
    pub fn is_implementation_error(&self) -> bool {
        matches!(
            self,
            Error::Internal(_) | Error::Delta(DeltaError::StaleReference(_))
        )
    }
}

impl StorageError {
    /// Create a store fault
    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let conflict = Error::CommitConflict {
            id: ObjectId::Persistent(1),
            base: Version(1),
            head: Version(2),
        };
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());
        assert!(!conflict.is_fatal_to_session());

        let protocol: Error = ProtocolError::UnknownSignal(99).into();
        assert!(protocol.is_fatal_to_session());

        assert!(Error::stale_reference(ObjectId::Temp(1)).is_implementation_error());
        assert!(Error::Timeout { millis: 10 }.is_timeout());
    }

    #[test]
    fn storage_error_converts() {
        let err: Error = StorageError::fault("disk gone").into();
        assert!(matches!(err, Error::Storage(StorageError::Fault(_))));
        assert_eq!(err.to_string(), "Storage error: Store fault: disk gone");
    }
}
