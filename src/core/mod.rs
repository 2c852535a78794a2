//! Core system types and foundations
//!
//! This module contains the fundamental building blocks of the repository:
//! identifier and value types, error handling and configuration.

pub mod types;
pub mod error;
pub mod config;

// Re-export commonly used items
pub use types::{
    BranchId, BranchPoint, ClassId, Feature, FeatureId, FeatureKind, ObjectId, SessionId,
    Timestamp, Value, Version, ViewId,
};
pub use error::{DeltaError, Error, ProtocolError, Result, StorageError};
pub use config::Config;
