//! Client side of the repository
//!
//! A [`ClientSession`] talks to the repository over a
//! [`Channel`](crate::protocol::Channel), caches the revisions its views read
//! and evicts them when the repository reports changes. [`Transaction`]s
//! record edits as deltas and commit them.

pub mod session;
pub mod transaction;
pub mod view;

pub use session::ClientSession;
pub use transaction::Transaction;
pub use view::ClientView;

#[cfg(test)]
mod tests;
