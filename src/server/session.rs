//! Server-side sessions

use crate::core::error::{Error, Result};
use crate::core::types::{BranchId, ObjectId, SessionId, Timestamp, ViewId};
use crate::server::view::{View, ViewKind};
use crate::system::metrics::Metrics;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Changes committed by another session that a client must act on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invalidation {
    /// Commit time
    pub timestamp: Timestamp,
    /// Branch the commit went to
    pub branch: BranchId,
    /// Session that committed
    pub committer: SessionId,
    /// Changed ids the receiving session is interested in
    pub ids: Vec<ObjectId>,
}

/// One connected client
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    user: String,
    views: DashMap<ViewId, Arc<View>>,
    subscribed: AtomicBool,
    invalidations: Sender<Invalidation>,
    closed: AtomicBool,
}

impl Session {
    /// Create a session and the receiving end of its invalidation queue
    pub fn new(id: SessionId, user: impl Into<String>) -> (Self, Receiver<Invalidation>) {
        let (sender, receiver) = flume::unbounded();
        let session = Self {
            id,
            user: user.into(),
            views: DashMap::new(),
            subscribed: AtomicBool::new(false),
            invalidations: sender,
            closed: AtomicBool::new(false),
        };
        (session, receiver)
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Authenticated user
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Whether the session listens for remote session events
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Change the remote session subscription flag
    pub fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::SeqCst);
    }

    /// Open a view with a client-chosen id
    pub fn open_view(&self, view_id: ViewId, kind: ViewKind, branch: BranchId) -> Result<Arc<View>> {
        self.ensure_open()?;
        let view = Arc::new(View::new(view_id, kind, branch));
        match self.views.entry(view_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::invalid_input(format!("view {} already open in session {}", view_id, self.id)))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(view.clone());
                Metrics::global().sessions.views_opened.inc();
                debug!(session = self.id, view = view_id, ?kind, "view opened");
                Ok(view)
            }
        }
    }

    /// Open a read-only view of the current state
    pub fn open_read_only(&self, view_id: ViewId, branch: BranchId) -> Result<Arc<View>> {
        self.open_view(view_id, ViewKind::ReadOnly, branch)
    }

    /// Open an audit view at `timestamp`
    pub fn open_audit(&self, view_id: ViewId, branch: BranchId, timestamp: Timestamp) -> Result<Arc<View>> {
        self.open_view(view_id, ViewKind::Audit(timestamp), branch)
    }

    /// Open a transaction view
    pub fn open_transaction(&self, view_id: ViewId, branch: BranchId) -> Result<Arc<View>> {
        self.open_view(view_id, ViewKind::Transaction, branch)
    }

    /// Look up an open view
    pub fn view(&self, view_id: ViewId) -> Result<Arc<View>> {
        self.views
            .get(&view_id)
            .map(|view| view.clone())
            .ok_or_else(|| Error::not_found(format!("view {} of session {}", view_id, self.id)))
    }

    /// Close a view, returning whether it was open
    pub fn close_view(&self, view_id: ViewId) -> bool {
        let closed = self.views.remove(&view_id).is_some();
        if closed {
            debug!(session = self.id, view = view_id, "view closed");
        }
        closed
    }

    /// Number of open views
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Subset of `ids` changed on `branch` that some non-audit view of this session is interested in
    pub fn interesting_ids(&self, branch: BranchId, ids: &[ObjectId]) -> Vec<ObjectId> {
        ids.iter()
            .copied()
            .filter(|id| self.views.iter().any(|view| view.is_interested(*id, branch)))
            .collect()
    }

    /// Queue an invalidation for the client. Returns `false` if nobody listens anymore.
    pub fn notify(&self, invalidation: Invalidation) -> bool {
        self.invalidations.send(invalidation).is_ok()
    }

    /// Whether the session was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.views.clear();
            info!(session = self.id, user = %self.user, "session closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed(format!("session {}", self.id)))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_are_tracked_by_id() {
        let (session, _rx) = Session::new(1, "alice");
        session.open_read_only(1, BranchId::MAIN).unwrap();
        session.open_audit(2, BranchId::MAIN, Timestamp(10)).unwrap();
        assert!(session.open_transaction(1, BranchId::MAIN).is_err());
        assert_eq!(session.view_count(), 2);

        assert!(session.view(2).unwrap().is_audit());
        assert!(session.close_view(2));
        assert!(!session.close_view(2));
        assert!(matches!(session.view(2), Err(Error::NotFound(_))));
    }

    #[test]
    fn interesting_ids_skip_audit_views() {
        let (session, _rx) = Session::new(1, "alice");
        let current = session.open_read_only(1, BranchId::MAIN).unwrap();
        let audit = session.open_audit(2, BranchId::MAIN, Timestamp(10)).unwrap();
        current.mark_loaded(ObjectId::Persistent(1));
        audit.mark_loaded(ObjectId::Persistent(2));

        let ids = [ObjectId::Persistent(1), ObjectId::Persistent(2), ObjectId::Persistent(3)];
        assert_eq!(session.interesting_ids(BranchId::MAIN, &ids), vec![ObjectId::Persistent(1)]);
    }

    #[test]
    fn interesting_ids_follow_the_view_branch() {
        let (session, _rx) = Session::new(1, "alice");
        let main = session.open_read_only(1, BranchId::MAIN).unwrap();
        let other = session.open_read_only(2, BranchId(3)).unwrap();
        main.mark_loaded(ObjectId::Persistent(1));
        other.mark_loaded(ObjectId::Persistent(2));

        let ids = [ObjectId::Persistent(1), ObjectId::Persistent(2)];
        assert_eq!(session.interesting_ids(BranchId(3), &ids), vec![ObjectId::Persistent(2)]);
        assert_eq!(session.interesting_ids(BranchId::MAIN, &ids), vec![ObjectId::Persistent(1)]);
    }

    #[test]
    fn closed_session_rejects_views_and_drops_notifications() {
        let (session, rx) = Session::new(1, "alice");
        session.close();
        assert!(matches!(session.open_read_only(1, BranchId::MAIN), Err(Error::Closed(_))));

        drop(rx);
        assert!(!session.notify(Invalidation {
            timestamp: Timestamp(1),
            branch: BranchId::MAIN,
            committer: 2,
            ids: vec![],
        }));
    }
}
