//! Client views

use crate::client::session::SessionShared;
use crate::core::error::{Error, Result};
use crate::core::types::{BranchId, BranchPoint, FeatureId, ObjectId, Timestamp, Value, ViewId};
use crate::protocol::requests::{
    ChangeSubscriptionRequest, CloseViewRequest, LoadChunkRequest, LoadRevisionRequest, OpenViewRequest,
};
use crate::revision::Revision;
use crate::server::{Invalidation, ViewKind};
use crate::storage::UNCHUNKED;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Per-view bookkeeping reachable from the session
#[derive(Debug)]
pub(crate) struct ViewState {
    id: ViewId,
    kind: ViewKind,
    branch: BranchId,
    invalidated: DashSet<ObjectId>,
    notifications_enabled: AtomicBool,
    notifications: Mutex<Vec<Invalidation>>,
}

impl ViewState {
    pub(crate) fn id(&self) -> ViewId {
        self.id
    }

    /// Record an invalidation that concerns this view
    pub(crate) fn invalidate(&self, event: &Invalidation) {
        if matches!(self.kind, ViewKind::Audit(_)) || event.branch != self.branch {
            return;
        }
        for id in &event.ids {
            self.invalidated.insert(*id);
        }
        if self.notifications_enabled.load(Ordering::SeqCst) {
            self.notifications.lock().push(event.clone());
        }
    }
}

/// Client-side view of one branch, current or at a past timestamp
pub struct ClientView {
    session: Arc<SessionShared>,
    state: Arc<ViewState>,
    list_chunk: AtomicI32,
    // Audit views read history and bypass the session cache
    audit_cache: DashMap<ObjectId, Revision>,
    closed: AtomicBool,
}

impl ClientView {
    pub(crate) fn open(session: Arc<SessionShared>, id: ViewId, kind: ViewKind, branch: BranchId) -> Result<Self> {
        session.send(&mut OpenViewRequest { view_id: id, kind, branch })?;
        let state = Arc::new(ViewState {
            id,
            kind,
            branch,
            invalidated: DashSet::new(),
            notifications_enabled: AtomicBool::new(session.config().invalidation_notifications),
            notifications: Mutex::new(Vec::new()),
        });
        session.register_view(state.clone());
        debug!(view = id, ?kind, branch = branch.0, "client view opened");

        Ok(Self {
            session,
            state,
            list_chunk: AtomicI32::new(UNCHUNKED),
            audit_cache: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn session(&self) -> &Arc<SessionShared> {
        &self.session
    }

    /// View id
    pub fn id(&self) -> ViewId {
        self.state.id
    }

    /// View kind
    pub fn kind(&self) -> ViewKind {
        self.state.kind
    }

    /// Branch of the view
    pub fn branch(&self) -> BranchId {
        self.state.branch
    }

    /// Point in history the view reads
    pub fn branch_point(&self) -> BranchPoint {
        match self.state.kind {
            ViewKind::Audit(timestamp) => BranchPoint::new(self.state.branch, timestamp),
            ViewKind::ReadOnly | ViewKind::Transaction => BranchPoint::new(self.state.branch, Timestamp::UNSPECIFIED),
        }
    }

    /// Whether this view reads a past timestamp
    pub fn is_audit(&self) -> bool {
        matches!(self.state.kind, ViewKind::Audit(_))
    }

    /// List chunk size used when loading revisions, -1 for complete lists
    pub fn list_chunk(&self) -> i32 {
        self.list_chunk.load(Ordering::SeqCst)
    }

    /// Change the list chunk size used by later loads
    pub fn set_list_chunk(&self, list_chunk: i32) {
        self.list_chunk.store(list_chunk, Ordering::SeqCst);
    }

    /// Whether invalidations are queued as notifications for this view
    pub fn is_invalidation_notification_enabled(&self) -> bool {
        self.state.notifications_enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable invalidation notifications
    pub fn set_invalidation_notification_enabled(&self, enabled: bool) {
        self.state.notifications_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Take the invalidation notifications queued so far
    pub fn take_notifications(&self) -> Vec<Invalidation> {
        self.session.process_invalidations();
        std::mem::take(&mut *self.state.notifications.lock())
    }

    /// Whether `id` was invalidated since this view last read it
    pub fn is_invalidated(&self, id: ObjectId) -> bool {
        self.session.process_invalidations();
        self.state.invalidated.contains(&id)
    }

    /// Revision of `id` as this view sees it, `None` if it does not exist there
    pub fn get_revision(&self, id: ObjectId) -> Result<Option<Revision>> {
        Ok(self.get_revisions(&[id])?.pop().flatten())
    }

    /// Revisions of `ids`, served from the cache where still valid
    pub fn get_revisions(&self, ids: &[ObjectId]) -> Result<Vec<Option<Revision>>> {
        self.ensure_open()?;
        self.session.process_invalidations();

        let mut revisions: Vec<Option<Revision>> = ids.iter().map(|id| self.cached(*id)).collect();
        let missing: Vec<ObjectId> = ids
            .iter()
            .zip(&revisions)
            .filter(|(_, cached)| cached.is_none())
            .map(|(id, _)| *id)
            .collect();
        if missing.is_empty() {
            return Ok(revisions);
        }
        if let Some(id) = missing.iter().find(|id| id.is_temporary()) {
            return Err(Error::stale_reference(*id));
        }

        let loaded = self.session.send(&mut LoadRevisionRequest {
            view_id: self.id(),
            list_chunk: self.list_chunk(),
            ids: missing.clone(),
        })?;
        let mut loaded = missing.into_iter().zip(loaded);
        for slot in revisions.iter_mut().filter(|slot| slot.is_none()) {
            if let Some((id, revision)) = loaded.next() {
                self.state.invalidated.remove(&id);
                if let Some(revision) = &revision {
                    self.install(revision.clone());
                }
                *slot = revision;
            }
        }
        Ok(revisions)
    }

    /// Load `[from, to)` of a list of the revision of `id` into the cache.
    /// Returns the loaded values.
    pub fn load_chunk(&self, id: ObjectId, feature: FeatureId, from: i32, to: i32) -> Result<Vec<Value>> {
        let mut revision = self
            .get_revision(id)?
            .ok_or_else(|| Error::not_found(format!("object {} in view {}", id, self.id())))?;

        let chunks = self.session.send(&mut LoadChunkRequest {
            id,
            branch: revision.branch_point().branch,
            version: revision.version(),
            feature,
            ranges: vec![(from, to)],
        })?;

        let mut values = Vec::new();
        let list = revision.list_mut(feature);
        for chunk in chunks {
            for (offset, value) in chunk.values().iter().enumerate() {
                let index = chunk.start_index() as usize + offset;
                if let Some(slot) = list.get_mut(index) {
                    *slot = value.clone();
                }
                values.push(value.clone());
            }
        }
        self.install(revision);
        Ok(values)
    }

    /// Subscribe to changes of `ids`
    pub fn subscribe(&self, ids: &[ObjectId]) -> Result<()> {
        self.change_subscription(false, true, ids)
    }

    /// Drop one subscription to each of `ids`
    pub fn unsubscribe(&self, ids: &[ObjectId]) -> Result<()> {
        self.change_subscription(false, false, ids)
    }

    /// Drop every change subscription
    pub fn clear_subscriptions(&self) -> Result<()> {
        self.change_subscription(true, true, &[])
    }

    fn change_subscription(&self, clear: bool, subscribe: bool, ids: &[ObjectId]) -> Result<()> {
        self.ensure_open()?;
        self.session.send(&mut ChangeSubscriptionRequest {
            view_id: self.id(),
            clear,
            subscribe,
            ids: ids.to_vec(),
        })?;
        Ok(())
    }

    /// Close the view
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.forget_view(self.id());
        self.session.send(&mut CloseViewRequest { view_id: self.id() })?;
        Ok(())
    }

    /// Whether the view was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed(format!("view {}", self.id())))
        } else {
            Ok(())
        }
    }

    fn cached(&self, id: ObjectId) -> Option<Revision> {
        if self.is_audit() {
            self.audit_cache.get(&id).map(|entry| entry.value().clone())
        } else if self.state.invalidated.contains(&id) {
            None
        } else {
            self.session.cached(id, self.state.branch)
        }
    }

    pub(crate) fn install(&self, revision: Revision) {
        if self.is_audit() {
            self.audit_cache.insert(revision.id(), revision);
        } else {
            self.session.install(revision);
        }
    }
}

impl std::fmt::Debug for ClientView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientView")
            .field("id", &self.state.id)
            .field("kind", &self.state.kind)
            .field("branch", &self.state.branch)
            .finish()
    }
}
