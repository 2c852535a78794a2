//! Delta module for revision versioning.
//!
//! This module provides the change records exchanged between clients and the
//! repository:
//! - Feature deltas describe one change to one feature
//! - List feature deltas collect ordered changes to one multi-valued feature and
//!   reconstruct where each added entry ended up
//! - Revision deltas group every change turning one revision into the next

pub mod feature;
pub mod list;
pub mod revision_delta;

// Re-export main types for convenience
pub use feature::{DeltaType, FeatureDelta, IndexEffect, NO_INDEX};
pub use list::{AddedIndices, ListFeatureDelta};
pub use revision_delta::RevisionDelta;
