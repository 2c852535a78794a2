//! Session registry and invalidation broadcast

use crate::core::types::{BranchId, ObjectId, SessionId, Timestamp};
use crate::server::session::{Invalidation, Session};
use crate::system::metrics::Metrics;
use dashmap::DashMap;
use flume::Receiver;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry of a remote sessions listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSessionInfo {
    /// Session id
    pub session_id: SessionId,
    /// User of the session
    pub user: String,
    /// Whether the session listens for remote session events
    pub subscribed: bool,
}

/// Registry of the open sessions of one repository
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicI32,
}

impl SessionManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicI32::new(1),
        }
    }

    /// Open a session for `user`
    pub fn open_session(&self, user: impl Into<String>) -> (Arc<Session>, Receiver<Invalidation>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (session, receiver) = Session::new(id, user);
        let session = Arc::new(session);
        self.sessions.insert(id, session.clone());

        let metrics = Metrics::global();
        metrics.sessions.sessions_opened.inc();
        metrics.sessions.active_sessions.inc();
        info!(session = id, user = session.user(), "session opened");
        (session, receiver)
    }

    /// Close and forget a session
    pub fn close_session(&self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.close();
                let metrics = Metrics::global();
                metrics.sessions.sessions_closed.inc();
                metrics.sessions.active_sessions.dec();
                true
            }
            None => false,
        }
    }

    /// Look up a session
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|session| session.clone())
    }

    /// Open sessions ordered by id
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every session except `requester`, then set the requester's subscription flag
    pub fn remote_sessions(&self, requester: SessionId, subscribe: bool) -> Vec<RemoteSessionInfo> {
        let listing = self
            .sessions()
            .into_iter()
            .filter(|session| session.id() != requester)
            .map(|session| RemoteSessionInfo {
                session_id: session.id(),
                user: session.user().to_string(),
                subscribed: session.is_subscribed(),
            })
            .collect();

        if let Some(session) = self.session(requester) {
            session.set_subscribed(subscribe);
        }
        listing
    }

    /// Send one invalidation per interested session other than the committer.
    ///
    /// Never blocks: queues are unbounded and a session whose client went away
    /// is skipped. Returns the number of events sent.
    pub fn broadcast_invalidation(
        &self,
        committer: SessionId,
        branch: BranchId,
        timestamp: Timestamp,
        changed: &[ObjectId],
    ) -> usize {
        if changed.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for session in self.sessions() {
            if session.id() == committer || session.is_closed() {
                continue;
            }
            let ids = session.interesting_ids(branch, changed);
            if ids.is_empty() {
                continue;
            }

            debug!(session = session.id(), count = ids.len(), %timestamp, "sending invalidation");
            let delivered = session.notify(Invalidation { timestamp, branch, committer, ids });
            if delivered {
                sent += 1;
            } else {
                warn!(session = session.id(), "invalidation receiver gone");
            }
        }

        Metrics::global().sessions.invalidations_sent.inc_by(sent as u64);
        sent
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_sessions_exclude_requester_and_set_flag() {
        let manager = SessionManager::new();
        let (a, _ra) = manager.open_session("alice");
        let (b, _rb) = manager.open_session("bob");
        b.set_subscribed(true);

        let listing = manager.remote_sessions(a.id(), true);
        assert_eq!(listing, vec![RemoteSessionInfo { session_id: b.id(), user: "bob".into(), subscribed: true }]);
        assert!(a.is_subscribed());
    }

    #[test]
    fn broadcast_reaches_only_interested_sessions() {
        let manager = SessionManager::new();
        let (s1, r1) = manager.open_session("s1");
        let (s2, r2) = manager.open_session("s2");
        let (s3, r3) = manager.open_session("s3");
        let o = ObjectId::Persistent(1);

        s1.open_transaction(1, BranchId::MAIN).unwrap().mark_loaded(o);
        let view = s2.open_read_only(1, BranchId::MAIN).unwrap();
        view.subscribe(o);
        view.subscribe(o);
        s3.open_audit(1, BranchId::MAIN, Timestamp(5)).unwrap().mark_loaded(o);

        let sent = manager.broadcast_invalidation(s1.id(), BranchId::MAIN, Timestamp(42), &[o]);
        assert_eq!(sent, 1);
        assert!(r1.try_recv().is_err());
        assert!(r3.try_recv().is_err());

        let event = r2.try_recv().unwrap();
        assert_eq!(event.ids, vec![o]);
        assert_eq!(event.timestamp, Timestamp(42));
        assert!(r2.try_recv().is_err());
    }

    #[test]
    fn close_session_removes_it() {
        let manager = SessionManager::new();
        let (s, _r) = manager.open_session("x");
        assert_eq!(manager.session_count(), 1);
        assert!(manager.close_session(s.id()));
        assert!(s.is_closed());
        assert!(manager.session(s.id()).is_none());
        assert!(!manager.close_session(s.id()));
    }
}
