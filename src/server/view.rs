//! Server-side views
//!
//! A view is one client window onto the repository: the current state of a
//! branch, an audit of the branch at a past timestamp, or a transaction. Its
//! kind is fixed at creation.

use crate::core::types::{BranchId, BranchPoint, ObjectId, Timestamp, ViewId};
use crate::server::subscription::HashBag;
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// What a view reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewKind {
    /// Current state of the branch
    ReadOnly,
    /// State of the branch as it was at the given timestamp
    Audit(Timestamp),
    /// Current state, plus the right to commit
    Transaction,
}

impl ViewKind {
    /// Wire tag
    pub fn tag(&self) -> u8 {
        match self {
            ViewKind::ReadOnly => 0,
            ViewKind::Audit(_) => 1,
            ViewKind::Transaction => 2,
        }
    }
}

/// One view of one session
#[derive(Debug)]
pub struct View {
    id: ViewId,
    kind: ViewKind,
    branch: BranchId,
    loaded: DashSet<ObjectId>,
    subscriptions: HashBag<ObjectId>,
    subscribe_all: AtomicBool,
}

impl View {
    /// Create a view
    pub fn new(id: ViewId, kind: ViewKind, branch: BranchId) -> Self {
        Self {
            id,
            kind,
            branch,
            loaded: DashSet::new(),
            subscriptions: HashBag::new(),
            subscribe_all: AtomicBool::new(false),
        }
    }

    /// View id, unique within its session
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// View kind
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// Branch the view reads
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Point in history the view reads
    pub fn branch_point(&self) -> BranchPoint {
        match self.kind {
            ViewKind::Audit(timestamp) => BranchPoint::new(self.branch, timestamp),
            ViewKind::ReadOnly | ViewKind::Transaction => BranchPoint::new(self.branch, Timestamp::UNSPECIFIED),
        }
    }

    /// Whether this view reads a fixed point in the past
    pub fn is_audit(&self) -> bool {
        matches!(self.kind, ViewKind::Audit(_))
    }

    /// Whether this view may commit
    pub fn is_transaction(&self) -> bool {
        self.kind == ViewKind::Transaction
    }

    /// Record that the client now holds a revision of `id`
    pub fn mark_loaded(&self, id: ObjectId) {
        self.loaded.insert(id);
    }

    /// Whether the client holds a revision of `id`
    pub fn has_loaded(&self, id: ObjectId) -> bool {
        self.loaded.contains(&id)
    }

    /// Subscribe to changes of `id`
    pub fn subscribe(&self, id: ObjectId) {
        let count = self.subscriptions.add(id);
        trace!(view = self.id, %id, count, "subscribed");
    }

    /// Drop one subscription to `id`; unknown ids are ignored
    pub fn unsubscribe(&self, id: ObjectId) {
        if !self.subscriptions.remove(&id) {
            trace!(view = self.id, %id, "unsubscribe of unknown id ignored");
        }
    }

    /// Drop every change subscription
    pub fn clear_change_subscription(&self) {
        self.subscriptions.clear();
        self.subscribe_all.store(false, Ordering::SeqCst);
    }

    /// Subscribe to every object
    pub fn set_subscribe_all(&self, all: bool) {
        self.subscribe_all.store(all, Ordering::SeqCst);
    }

    /// Whether a change subscription covers `id`
    pub fn is_subscribed(&self, id: ObjectId) -> bool {
        self.subscribe_all.load(Ordering::SeqCst) || self.subscriptions.contains(&id)
    }

    /// Number of distinct subscribed ids
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether a change of `id` on `branch` must be reported to this view's client.
    ///
    /// Audit views read a fixed past and are never invalidated.
    pub fn is_interested(&self, id: ObjectId, branch: BranchId) -> bool {
        !self.is_audit() && self.branch() == branch && (self.has_loaded(id) || self.is_subscribed(id))
    }
}
