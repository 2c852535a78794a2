//! Repository: commit processing and revision loading
//!
//! Commits are serialised by a repository-wide lock. A commit is validated
//! completely (base versions against the branch head, temporary ids) before
//! anything is written; then new ids are assigned, the new revisions written,
//! their predecessors revised and interested sessions invalidated.

use crate::core::config::RepositoryConfig;
use crate::core::error::{Error, Result};
use crate::core::types::{BranchId, BranchPoint, FeatureId, ObjectId, SessionId, Timestamp, Version};
use crate::delta::RevisionDelta;
use crate::revision::Revision;
use crate::server::manager::SessionManager;
use crate::server::view::View;
use crate::storage::{Chunk, Store, StoreAccessor, UNCHUNKED};
use crate::system::metrics::Metrics;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Everything a transaction sends on commit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitRequest {
    /// Branch the transaction works on
    pub branch: BranchId,
    /// Objects created by the transaction, under temporary ids
    pub new_objects: Vec<Revision>,
    /// Changes to existing objects, each against the version the client edited
    pub dirty: Vec<RevisionDelta>,
    /// Objects removed from the model, with the version the client saw
    pub detached: Vec<(ObjectId, Version)>,
}

impl CommitRequest {
    /// Whether the commit carries no change
    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty() && self.dirty.is_empty() && self.detached.is_empty()
    }
}

/// Outcome of a successful commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResult {
    /// Commit time, also the creation time of every new revision
    pub timestamp: Timestamp,
    /// Temporary id to permanent id
    pub id_mappings: Vec<(ObjectId, ObjectId)>,
    /// Revisions written by the commit, new objects first
    pub revisions: Vec<Revision>,
}

/// One repository: store, sessions and commit serialisation
pub struct Repository {
    name: String,
    store: Store,
    sessions: SessionManager,
    commit_lock: Mutex<Timestamp>,
    next_id: AtomicU64,
}

impl Repository {
    /// Create a repository over `store`
    pub fn new(store: Store, config: &RepositoryConfig) -> Self {
        info!(repository = %config.name, "repository created");
        Self {
            name: config.name.clone(),
            store,
            sessions: SessionManager::new(),
            commit_lock: Mutex::new(Timestamp::UNSPECIFIED),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a repository over a fresh in-memory store
    pub fn in_memory(config: &RepositoryConfig) -> Self {
        let (store, _) = Store::in_memory(config);
        Self::new(store, config)
    }

    /// Repository name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing store
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Session registry
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Load the revisions `view` sees for `ids`, marking them loaded.
    ///
    /// Unknown ids, and ids not alive at the view's point in history, yield `None`.
    pub fn load_revisions(
        &self,
        accessor: &StoreAccessor,
        view: &View,
        ids: &[ObjectId],
        list_chunk: i32,
    ) -> Result<Vec<Option<Revision>>> {
        let branch_point = view.branch_point();
        let mut revisions = Vec::with_capacity(ids.len());
        for &id in ids {
            if id.is_temporary() || id.is_null() {
                return Err(Error::invalid_input(format!("cannot load {}", id)));
            }
            let revision = accessor.read_revision(id, branch_point, list_chunk)?;
            if revision.is_some() {
                view.mark_loaded(id);
                Metrics::global().repository.revisions_loaded.inc();
            }
            revisions.push(revision);
        }
        debug!(view = view.id(), count = ids.len(), list_chunk, "revisions loaded");
        Ok(revisions)
    }

    /// Read `ranges` of one list of a stored revision
    pub fn load_chunks(
        &self,
        accessor: &StoreAccessor,
        id: ObjectId,
        branch: BranchId,
        version: Version,
        feature: FeatureId,
        ranges: &[(i32, i32)],
    ) -> Result<Vec<Chunk>> {
        let mut reader = accessor.chunk_reader(id, branch, version, feature);
        for &(from, to) in ranges {
            reader.add_range(from, to);
        }
        let chunks = reader.execute_read()?;
        Metrics::global().repository.chunks_loaded.inc_by(chunks.len() as u64);
        Ok(chunks)
    }

    /// Commit the changes of a transaction of session `committer`
    pub fn commit(&self, committer: SessionId, request: CommitRequest) -> Result<CommitResult> {
        let metrics = Metrics::global();
        let outcome = crate::time_operation!(metrics.repository.commit_duration, self.commit_locked(request));

        match &outcome {
            Ok((result, _, _)) => {
                metrics.repository.commits.inc();
                info!(
                    session = committer,
                    timestamp = %result.timestamp,
                    revisions = result.revisions.len(),
                    "commit succeeded"
                );
            }
            Err(err) if err.is_conflict() => {
                metrics.repository.commit_conflicts.inc();
                warn!(session = committer, error = %err, "commit rejected");
            }
            Err(err) => {
                metrics.repository.commits_failed.inc();
                warn!(session = committer, error = %err, "commit failed");
            }
        }

        let (result, branch, changed) = outcome?;
        self.sessions
            .broadcast_invalidation(committer, branch, result.timestamp, &changed);
        Ok(result)
    }

    /// Returns the result with the branch and the ids whose revisions were revised
    fn commit_locked(&self, request: CommitRequest) -> Result<(CommitResult, BranchId, Vec<ObjectId>)> {
        let mut last_commit = self.commit_lock.lock();
        let accessor = self.store.accessor();
        let branch = request.branch;

        // Validate everything before the first write
        let mut named = HashSet::with_capacity(request.dirty.len() + request.detached.len());
        let touched = request.dirty.iter().map(|delta| delta.id()).chain(request.detached.iter().map(|(id, _)| *id));
        for id in touched {
            if !named.insert(id) {
                return Err(Error::invalid_input(format!("object {} changed twice in one commit", id)));
            }
        }

        let mut bases = Vec::with_capacity(request.dirty.len());
        for delta in &request.dirty {
            if delta.branch() != branch {
                return Err(Error::invalid_input(format!("delta for {} targets another branch", delta.id())));
            }
            let base = self.current_base(&accessor, delta.id(), branch, delta.version())?;
            bases.push(base);
        }
        for &(id, version) in &request.detached {
            self.current_base(&accessor, id, branch, version)?;
        }

        let mut mapping: HashMap<ObjectId, ObjectId> = HashMap::new();
        for revision in &request.new_objects {
            if !revision.id().is_temporary() {
                return Err(Error::invalid_input(format!("new object {} has no temporary id", revision.id())));
            }
            let id = ObjectId::Persistent(self.next_id.fetch_add(1, Ordering::SeqCst));
            if mapping.insert(revision.id(), id).is_some() {
                return Err(Error::invalid_input(format!("temporary id {} used twice", revision.id())));
            }
        }
        let adjuster = |id: ObjectId| mapping.get(&id).copied().unwrap_or(id);

        let now = Timestamp::now();
        let timestamp = if now > *last_commit { now } else { Timestamp(last_commit.0 + 1) };
        let created = BranchPoint::new(branch, timestamp);

        let mut revisions = Vec::with_capacity(request.new_objects.len() + request.dirty.len());
        for mut revision in request.new_objects {
            revision.adjust_references(&adjuster);
            revision.set_version(Version::FIRST);
            revision.set_branch_point(created);
            revision.set_revised(Timestamp::UNSPECIFIED);
            revisions.push(revision);
        }

        let mut revised = Vec::with_capacity(bases.len() + request.detached.len());
        for (delta, base) in request.dirty.iter().zip(&bases) {
            let mut delta = delta.copy();
            delta.adjust_references(&adjuster);
            let mut next = base.apply_delta(&delta)?;
            next.set_branch_point(created);
            revised.push((base.id(), base.version()));
            revisions.push(next);
        }
        revised.extend(request.detached.iter().copied());

        let mut undo = CommitUndo::default();
        if let Err(err) = Self::write_commit(&accessor, branch, timestamp, &revised, &revisions, &mut undo) {
            undo.roll_back(&accessor, branch);
            return Err(err);
        }
        *last_commit = timestamp;

        let changed: Vec<ObjectId> = revised.iter().map(|(id, _)| *id).collect();
        let result = CommitResult {
            timestamp,
            id_mappings: mapping.into_iter().collect(),
            revisions,
        };
        Ok((result, branch, changed))
    }

    fn write_commit(
        accessor: &StoreAccessor,
        branch: BranchId,
        timestamp: Timestamp,
        revised: &[(ObjectId, Version)],
        revisions: &[Revision],
        undo: &mut CommitUndo,
    ) -> Result<()> {
        for &(id, version) in revised {
            accessor.revise(id, branch, version, timestamp.previous())?;
            undo.revised.push((id, version));
        }
        for revision in revisions {
            accessor.write_revision(revision)?;
            undo.written.push((revision.id(), revision.version()));
        }
        Ok(())
    }

    /// Current revision of `id`, checked against the version the client edited
    fn current_base(&self, accessor: &StoreAccessor, id: ObjectId, branch: BranchId, base: Version) -> Result<Revision> {
        let current = accessor.read_revision(id, BranchPoint::new(branch, Timestamp::UNSPECIFIED), UNCHUNKED)?;
        match current {
            Some(revision) if revision.version() == base => Ok(revision),
            Some(revision) => Err(Error::CommitConflict { id, base, head: revision.version() }),
            None => {
                let head = accessor.head_version(id, branch)?;
                match head {
                    // Detached since the client loaded it
                    Some(head) => Err(Error::CommitConflict { id, base, head }),
                    None => Err(Error::not_found(format!("object {}", id))),
                }
            }
        }
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("sessions", &self.sessions.session_count())
            .finish()
    }
}

/// Writes of a commit in progress, undone when a later write fails
#[derive(Default)]
struct CommitUndo {
    revised: Vec<(ObjectId, Version)>,
    written: Vec<(ObjectId, Version)>,
}

impl CommitUndo {
    fn roll_back(self, accessor: &StoreAccessor, branch: BranchId) {
        for (id, version) in self.written.into_iter().rev() {
            if let Err(err) = accessor.discard_revision(id, branch, version) {
                error!(%id, %version, error = %err, "commit rollback could not remove revision");
            }
        }
        for (id, version) in self.revised.into_iter().rev() {
            if let Err(err) = accessor.revise(id, branch, version, Timestamp::UNSPECIFIED) {
                error!(%id, %version, error = %err, "commit rollback could not reopen revision");
            }
        }
        debug!(branch = branch.0, "commit rolled back");
    }
}
