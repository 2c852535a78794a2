//! Client session: revision cache and invalidation processing

use crate::client::transaction::Transaction;
use crate::client::view::{ClientView, ViewState};
use crate::core::config::SessionConfig;
use crate::core::error::Result;
use crate::core::types::{BranchId, ObjectId, SessionId, Timestamp, ViewId};
use crate::protocol::requests::{self, OpenSessionRequest, RemoteSessionsRequest, Request, SessionInfo};
use crate::protocol::{Channel, LocalChannel};
use crate::revision::Revision;
use crate::server::{Invalidation, RemoteSessionInfo, Repository, ViewKind};
use dashmap::DashMap;
use flume::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// State shared by a session and its views
pub(crate) struct SessionShared {
    channel: Arc<dyn Channel>,
    info: SessionInfo,
    user: String,
    config: SessionConfig,
    revisions: DashMap<(ObjectId, BranchId), Revision>,
    views: DashMap<ViewId, Arc<ViewState>>,
    next_view_id: AtomicI32,
    invalidations: Option<Receiver<Invalidation>>,
    last_update: Mutex<Timestamp>,
}

impl SessionShared {
    pub(crate) fn send<R: Request>(&self, request: &mut R) -> Result<R::Response> {
        requests::send(self.channel.as_ref(), request, self.config.request_timeout)
    }

    pub(crate) fn send_with_timeout<R: Request>(
        &self,
        request: &mut R,
        timeout: std::time::Duration,
    ) -> Result<R::Response> {
        requests::send(self.channel.as_ref(), request, timeout)
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn cached(&self, id: ObjectId, branch: BranchId) -> Option<Revision> {
        self.revisions.get(&(id, branch)).map(|entry| entry.value().clone())
    }

    pub(crate) fn install(&self, revision: Revision) {
        let key = (revision.id(), revision.branch_point().branch);
        self.revisions.insert(key, revision);
    }

    pub(crate) fn evict(&self, id: ObjectId, branch: BranchId) {
        self.revisions.remove(&(id, branch));
    }

    pub(crate) fn register_view(&self, state: Arc<ViewState>) {
        self.views.insert(state.id(), state);
    }

    pub(crate) fn forget_view(&self, id: ViewId) {
        self.views.remove(&id);
    }

    /// Apply every pushed invalidation that has arrived so far
    pub(crate) fn process_invalidations(&self) -> usize {
        let Some(receiver) = &self.invalidations else {
            return 0;
        };

        let mut processed = 0;
        for event in receiver.try_iter() {
            trace!(session = self.info.session_id, committer = event.committer, count = event.ids.len(), "invalidation");
            for id in &event.ids {
                self.evict(*id, event.branch);
            }
            for view in self.views.iter() {
                view.value().invalidate(&event);
            }
            let mut last_update = self.last_update.lock();
            if event.timestamp > *last_update {
                *last_update = event.timestamp;
            }
            processed += 1;
        }
        if processed > 0 {
            debug!(session = self.info.session_id, processed, "invalidations processed");
        }
        processed
    }
}

/// A client's connection to one repository.
///
/// Revisions of current-state views are cached per session; invalidations
/// pushed by the repository evict them before the next read.
pub struct ClientSession {
    shared: Arc<SessionShared>,
}

impl ClientSession {
    /// Open a session over `channel`
    pub fn open(channel: Arc<dyn Channel>, user: impl Into<String>, config: &SessionConfig) -> Result<Self> {
        let user = user.into();
        let info = requests::send(
            channel.as_ref(),
            &mut OpenSessionRequest { user: user.clone() },
            config.request_timeout,
        )?;
        let invalidations = channel.invalidations();
        info!(session = info.session_id, repository = %info.repository_name, %user, "session opened");

        Ok(Self {
            shared: Arc::new(SessionShared {
                channel,
                info,
                user,
                config: config.clone(),
                revisions: DashMap::new(),
                views: DashMap::new(),
                next_view_id: AtomicI32::new(1),
                invalidations,
                last_update: Mutex::new(Timestamp::UNSPECIFIED),
            }),
        })
    }

    /// Open a session on an in-process repository
    pub fn connect_local(repository: Arc<Repository>, user: impl Into<String>, config: &SessionConfig) -> Result<Self> {
        let channel: Arc<dyn Channel> = Arc::new(LocalChannel::connect(repository)?);
        Self::open(channel, user, config)
    }

    /// Session id assigned by the repository
    pub fn id(&self) -> SessionId {
        self.shared.info.session_id
    }

    /// User of the session
    pub fn user(&self) -> &str {
        &self.shared.user
    }

    /// Name of the repository
    pub fn repository_name(&self) -> &str {
        &self.shared.info.repository_name
    }

    /// Open a view of the current state of `branch`
    pub fn open_view(&self, branch: BranchId) -> Result<ClientView> {
        self.open_client_view(ViewKind::ReadOnly, branch)
    }

    /// Open a view of `branch` as it was at `timestamp`
    pub fn open_audit(&self, branch: BranchId, timestamp: Timestamp) -> Result<ClientView> {
        self.open_client_view(ViewKind::Audit(timestamp), branch)
    }

    /// Open a transaction on `branch`
    pub fn open_transaction(&self, branch: BranchId) -> Result<Transaction> {
        let view = self.open_client_view(ViewKind::Transaction, branch)?;
        Ok(Transaction::new(view))
    }

    fn open_client_view(&self, kind: ViewKind, branch: BranchId) -> Result<ClientView> {
        let view_id = self.shared.next_view_id.fetch_add(1, Ordering::SeqCst);
        ClientView::open(self.shared.clone(), view_id, kind, branch)
    }

    /// Number of open views
    pub fn view_count(&self) -> usize {
        self.shared.views.len()
    }

    /// Cached current revision of `id` on `branch`
    pub fn cached_revision(&self, id: ObjectId, branch: BranchId) -> Option<Revision> {
        self.shared.cached(id, branch)
    }

    /// Apply pending invalidations now; returns how many events were processed
    pub fn process_invalidations(&self) -> usize {
        self.shared.process_invalidations()
    }

    /// Timestamp of the latest invalidation processed
    pub fn last_update_timestamp(&self) -> Timestamp {
        *self.shared.last_update.lock()
    }

    /// The other sessions of the repository; also sets this session's
    /// remote session subscription
    pub fn remote_sessions(&self, subscribe: bool) -> Result<Vec<RemoteSessionInfo>> {
        self.shared.send(&mut RemoteSessionsRequest { subscribe })
    }

    /// Whether the channel is closed
    pub fn is_closed(&self) -> bool {
        self.shared.channel.is_closed()
    }

    /// Close the session
    pub fn close(&self) {
        if !self.shared.channel.is_closed() {
            // Best effort, the channel close below ends the session anyway
            let _ = self.shared.send(&mut requests::CloseSessionRequest);
        }
        self.shared.channel.close();
        self.shared.views.clear();
        info!(session = self.id(), "session closed");
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id())
            .field("user", &self.shared.user)
            .field("cached", &self.shared.revisions.len())
            .finish()
    }
}
