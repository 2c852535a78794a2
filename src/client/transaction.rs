//! Client transactions
//!
//! A transaction edits working copies of revisions and records every change
//! as a [`FeatureDelta`] in a per-object [`RevisionDelta`]. New objects get
//! temporary ids that the repository replaces on commit.

use crate::client::view::ClientView;
use crate::core::error::{Error, Result};
use crate::core::types::{BranchPoint, ClassId, Feature, ObjectId, Timestamp, Value, Version};
use crate::delta::{FeatureDelta, RevisionDelta, NO_INDEX};
use crate::protocol::requests::{CommitConfirmation, CommitTransactionRequest};
use crate::revision::Revision;
use crate::server::CommitRequest;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

struct DirtyObject {
    working: Revision,
    delta: RevisionDelta,
}

/// Unit of change against one branch
pub struct Transaction {
    view: ClientView,
    new_objects: BTreeMap<ObjectId, Revision>,
    dirty: BTreeMap<ObjectId, DirtyObject>,
    detached: BTreeMap<ObjectId, Version>,
    next_temp_id: u32,
    commit_timeout: Duration,
}

impl Transaction {
    /// Commit timeout used unless the session configuration says otherwise
    pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_millis(100_000);

    pub(crate) fn new(view: ClientView) -> Self {
        let commit_timeout = view.session().config().commit_timeout;
        Self {
            view,
            new_objects: BTreeMap::new(),
            dirty: BTreeMap::new(),
            detached: BTreeMap::new(),
            next_temp_id: 1,
            commit_timeout,
        }
    }

    /// The transaction's view
    pub fn view(&self) -> &ClientView {
        &self.view
    }

    /// How long `commit` waits for the acknowledgement
    pub fn commit_timeout(&self) -> Duration {
        self.commit_timeout
    }

    /// Change how long `commit` waits for the acknowledgement
    pub fn set_commit_timeout(&mut self, timeout: Duration) {
        self.commit_timeout = timeout;
    }

    /// Whether there is anything to commit
    pub fn is_dirty(&self) -> bool {
        !self.new_objects.is_empty() || !self.dirty.is_empty() || !self.detached.is_empty()
    }

    /// Create an object; its id stays temporary until commit
    pub fn new_object(&mut self, class: ClassId) -> ObjectId {
        let id = ObjectId::Temp(self.next_temp_id);
        self.next_temp_id += 1;
        let mut revision = Revision::new(id, class);
        revision.set_branch_point(BranchPoint::new(self.view.branch(), Timestamp::UNSPECIFIED));
        self.new_objects.insert(id, revision);
        debug!(%id, class = class.0, "object created");
        id
    }

    /// Revision of `id` including the changes of this transaction
    pub fn get_revision(&self, id: ObjectId) -> Result<Option<Revision>> {
        if let Some(revision) = self.new_objects.get(&id) {
            return Ok(Some(revision.clone()));
        }
        if let Some(dirty) = self.dirty.get(&id) {
            return Ok(Some(dirty.working.clone()));
        }
        if self.detached.contains_key(&id) {
            return Ok(None);
        }
        self.view.get_revision(id)
    }

    /// Set a single-valued feature
    pub fn set(&mut self, id: ObjectId, feature: Feature, value: impl Into<Value>) -> Result<()> {
        self.change(id, FeatureDelta::Set { feature, index: NO_INDEX, value: value.into() })
    }

    /// Replace the list entry at `index`
    pub fn set_at(&mut self, id: ObjectId, feature: Feature, index: i32, value: impl Into<Value>) -> Result<()> {
        self.change(id, FeatureDelta::Set { feature, index, value: value.into() })
    }

    /// Insert into a list at `index`
    pub fn add(&mut self, id: ObjectId, feature: Feature, index: i32, value: impl Into<Value>) -> Result<()> {
        self.change(id, FeatureDelta::Add { feature, index, value: value.into() })
    }

    /// Append to a list
    pub fn append(&mut self, id: ObjectId, feature: Feature, value: impl Into<Value>) -> Result<()> {
        let len = self
            .get_revision(id)?
            .map(|revision| revision.list(feature.id).len())
            .ok_or_else(|| Error::not_found(format!("object {}", id)))?;
        self.add(id, feature, len as i32, value)
    }

    /// Remove the list entry at `index`
    pub fn remove(&mut self, id: ObjectId, feature: Feature, index: i32) -> Result<()> {
        self.change(id, FeatureDelta::Remove { feature, index })
    }

    /// Move a list entry
    pub fn move_entry(&mut self, id: ObjectId, feature: Feature, from: i32, to: i32) -> Result<()> {
        self.change(id, FeatureDelta::Move { feature, old_position: from, new_position: to })
    }

    /// Empty a list, or drop the value of a single-valued feature
    pub fn clear(&mut self, id: ObjectId, feature: Feature) -> Result<()> {
        self.change(id, FeatureDelta::Clear { feature })
    }

    /// Return a feature to its unset state
    pub fn unset(&mut self, id: ObjectId, feature: Feature) -> Result<()> {
        self.change(id, FeatureDelta::Unset { feature })
    }

    /// Move the object into a new container
    pub fn set_container(
        &mut self,
        id: ObjectId,
        resource: ObjectId,
        container: ObjectId,
        containing_feature: i32,
    ) -> Result<()> {
        self.change(id, FeatureDelta::Container { resource, container, containing_feature })
    }

    /// Remove an object from the model
    pub fn detach(&mut self, id: ObjectId) -> Result<()> {
        if self.new_objects.remove(&id).is_some() {
            return Ok(());
        }
        let version = match self.dirty.remove(&id) {
            Some(dirty) => dirty.delta.version(),
            None => self
                .view
                .get_revision(id)?
                .ok_or_else(|| Error::not_found(format!("object {}", id)))?
                .version(),
        };
        self.detached.insert(id, version);
        Ok(())
    }

    fn change(&mut self, id: ObjectId, delta: FeatureDelta) -> Result<()> {
        if self.detached.contains_key(&id) {
            return Err(Error::invalid_input(format!("object {} is detached", id)));
        }
        if let Some(revision) = self.new_objects.get_mut(&id) {
            // New objects travel whole, no delta needed
            return delta.apply(revision);
        }

        if !self.dirty.contains_key(&id) {
            if id.is_temporary() {
                return Err(Error::stale_reference(id));
            }
            let base = self
                .view
                .get_revision(id)?
                .ok_or_else(|| Error::not_found(format!("object {}", id)))?;
            let delta = RevisionDelta::new(&base);
            self.dirty.insert(id, DirtyObject { working: base, delta });
        }

        let dirty = self
            .dirty
            .get_mut(&id)
            .ok_or_else(|| Error::internal("dirty object vanished"))?;
        delta.apply(&mut dirty.working)?;
        dirty.delta.add_feature_delta(delta);
        Ok(())
    }

    /// Send the changes to the repository.
    ///
    /// On success temporary ids are replaced everywhere, the committed
    /// revisions are installed in the session cache and the transaction is
    /// empty again. On failure the changes are kept; a timeout leaves the
    /// outcome unknown.
    pub fn commit(&mut self) -> Result<CommitConfirmation> {
        let request = CommitRequest {
            branch: self.view.branch(),
            new_objects: self.new_objects.values().cloned().collect(),
            dirty: self.dirty.values().map(|dirty| dirty.delta.copy()).collect(),
            detached: self.detached.iter().map(|(id, version)| (*id, *version)).collect(),
        };
        let timeout = self.commit_timeout;

        let outcome = self
            .view
            .session()
            .send_with_timeout(&mut CommitTransactionRequest { view_id: self.view.id(), request }, timeout);
        let confirmation = match outcome {
            Ok(confirmation) => confirmation,
            Err(err) => {
                warn!(view = self.view.id(), error = %err, "commit failed");
                return Err(err);
            }
        };

        self.install_committed(&confirmation);
        info!(
            view = self.view.id(),
            timestamp = %confirmation.timestamp,
            new = confirmation.id_mappings.len(),
            "transaction committed"
        );
        Ok(confirmation)
    }

    fn install_committed(&mut self, confirmation: &CommitConfirmation) {
        let mapping: HashMap<ObjectId, ObjectId> = confirmation.id_mappings.iter().copied().collect();
        let adjuster = |id: ObjectId| mapping.get(&id).copied().unwrap_or(id);
        let created = BranchPoint::new(self.view.branch(), confirmation.timestamp);

        for (_, mut revision) in std::mem::take(&mut self.new_objects) {
            revision.adjust_references(&adjuster);
            revision.set_version(Version::FIRST);
            revision.set_branch_point(created);
            revision.set_revised(Timestamp::UNSPECIFIED);
            self.view.install(revision);
        }
        for (_, dirty) in std::mem::take(&mut self.dirty) {
            let mut revision = dirty.working;
            revision.adjust_references(&adjuster);
            revision.set_version(dirty.delta.version().next());
            revision.set_branch_point(created);
            revision.set_revised(Timestamp::UNSPECIFIED);
            self.view.install(revision);
        }
        for (id, _) in std::mem::take(&mut self.detached) {
            self.view.session().evict(id, self.view.branch());
        }
        self.next_temp_id = 1;
    }

    /// Drop every uncommitted change
    pub fn rollback(&mut self) {
        self.new_objects.clear();
        self.dirty.clear();
        self.detached.clear();
        self.next_temp_id = 1;
        debug!(view = self.view.id(), "transaction rolled back");
    }

    /// Close the transaction's view, dropping uncommitted changes
    pub fn close(mut self) -> Result<()> {
        self.rollback();
        self.view.close()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("view", &self.view.id())
            .field("new_objects", &self.new_objects.len())
            .field("dirty", &self.dirty.len())
            .field("detached", &self.detached.len())
            .finish()
    }
}
