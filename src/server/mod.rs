//! Server side of the repository
//!
//! Sessions own views; views track which objects their client holds and which
//! it subscribed to. The repository serialises commits and broadcasts
//! invalidations to the sessions that care.

/// Session registry and invalidation broadcast
pub mod manager;
/// Commit and load entry points
pub mod repository;
/// Server sessions and their views
pub mod session;
/// Counted change subscriptions
pub mod subscription;
/// Server views
pub mod view;

pub use manager::{RemoteSessionInfo, SessionManager};
pub use repository::{CommitRequest, CommitResult, Repository};
pub use session::{Invalidation, Session};
pub use subscription::HashBag;
pub use view::{View, ViewKind};

#[cfg(test)]
mod tests;
