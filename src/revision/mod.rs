//! Object revisions
//!
//! A [`Revision`] is the state of one object at one version on one branch.
//! Committed revisions are never mutated: edits work on a copy, and the
//! repository stores the result as the next version.

use crate::core::error::{DeltaError, Result};
use crate::core::types::{BranchPoint, ClassId, FeatureId, ObjectId, Timestamp, Value, Version};
use crate::delta::RevisionDelta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rewrites object ids, e.g. temporary ids into the permanent ids assigned on commit
pub trait ReferenceAdjuster {
    /// Return the id that should replace `id`
    fn adjust_reference(&self, id: ObjectId) -> ObjectId;
}

impl<F> ReferenceAdjuster for F
where
    F: Fn(ObjectId) -> ObjectId,
{
    fn adjust_reference(&self, id: ObjectId) -> ObjectId {
        self(id)
    }
}

/// Rewrite a value in place if it is a reference
pub(crate) fn adjust_value(value: &mut Value, adjuster: &impl ReferenceAdjuster) {
    if let Value::Ref(id) = value {
        *id = adjuster.adjust_reference(*id);
    }
}

/// Content of one feature slot
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureValue {
    /// Single-valued feature
    Single(Value),
    /// Ordered multi-valued feature
    List(Vec<Value>),
}

/// Snapshot of one object's state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    id: ObjectId,
    class: ClassId,
    version: Version,
    branch_point: BranchPoint,
    revised: Timestamp,
    resource: ObjectId,
    container: ObjectId,
    containing_feature: i32,
    values: BTreeMap<FeatureId, FeatureValue>,
}

impl Revision {
    /// Create an empty, uncommitted revision
    pub fn new(id: ObjectId, class: ClassId) -> Self {
        Self {
            id,
            class,
            version: Version::UNSPECIFIED,
            branch_point: BranchPoint::main_head(),
            revised: Timestamp::UNSPECIFIED,
            resource: ObjectId::Null,
            container: ObjectId::Null,
            containing_feature: 0,
            values: BTreeMap::new(),
        }
    }

    /// Object id
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Class of the object
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Version number
    pub fn version(&self) -> Version {
        self.version
    }

    /// Branch and creation time of this revision
    pub fn branch_point(&self) -> BranchPoint {
        self.branch_point
    }

    /// Creation time of this revision
    pub fn created(&self) -> Timestamp {
        self.branch_point.timestamp
    }

    /// Last instant this revision was valid, `UNSPECIFIED` while it is current
    pub fn revised(&self) -> Timestamp {
        self.revised
    }

    /// Resource the object lives in
    pub fn resource(&self) -> ObjectId {
        self.resource
    }

    /// Containing object
    pub fn container(&self) -> ObjectId {
        self.container
    }

    /// Feature of the container holding this object
    pub fn containing_feature(&self) -> i32 {
        self.containing_feature
    }

    /// Whether this revision is still the latest on its branch
    pub fn is_current(&self) -> bool {
        self.revised.is_unspecified()
    }

    /// Whether this revision was the valid one at `timestamp`
    pub fn is_valid_at(&self, timestamp: Timestamp) -> bool {
        self.created() <= timestamp && (self.is_current() || timestamp <= self.revised)
    }

    pub(crate) fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_branch_point(&mut self, branch_point: BranchPoint) {
        self.branch_point = branch_point;
    }

    pub(crate) fn set_revised(&mut self, revised: Timestamp) {
        self.revised = revised;
    }

    /// Set resource, container and containing feature
    pub fn set_container(&mut self, resource: ObjectId, container: ObjectId, containing_feature: i32) {
        self.resource = resource;
        self.container = container;
        self.containing_feature = containing_feature;
    }

    /// Value of a single-valued feature
    pub fn get(&self, feature: FeatureId) -> Option<&Value> {
        match self.values.get(&feature) {
            Some(FeatureValue::Single(value)) => Some(value),
            _ => None,
        }
    }

    /// Entries of a multi-valued feature (empty if never set)
    pub fn list(&self, feature: FeatureId) -> &[Value] {
        match self.values.get(&feature) {
            Some(FeatureValue::List(values)) => values,
            _ => &[],
        }
    }

    /// Mutable entries of a multi-valued feature, created on first access
    pub fn list_mut(&mut self, feature: FeatureId) -> &mut Vec<Value> {
        let slot = self
            .values
            .entry(feature)
            .or_insert_with(|| FeatureValue::List(Vec::new()));
        if let FeatureValue::Single(_) = slot {
            *slot = FeatureValue::List(Vec::new());
        }
        match slot {
            FeatureValue::List(values) => values,
            FeatureValue::Single(_) => unreachable!("slot was converted to a list above"),
        }
    }

    /// Set a single-valued feature
    pub fn set(&mut self, feature: FeatureId, value: Value) {
        self.values.insert(feature, FeatureValue::Single(value));
    }

    /// Replace the whole content of a multi-valued feature
    pub fn set_list(&mut self, feature: FeatureId, values: Vec<Value>) {
        self.values.insert(feature, FeatureValue::List(values));
    }

    /// Remove a feature slot entirely
    pub fn unset(&mut self, feature: FeatureId) {
        self.values.remove(&feature);
    }

    /// All feature slots in feature order
    pub fn values(&self) -> impl Iterator<Item = (FeatureId, &FeatureValue)> {
        self.values.iter().map(|(id, value)| (*id, value))
    }

    /// Ids of multi-valued features present in this revision
    pub fn list_features(&self) -> Vec<FeatureId> {
        self.values
            .iter()
            .filter(|(_, value)| matches!(value, FeatureValue::List(_)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether any list slot still holds the lazy-loading sentinel
    pub fn has_uninitialized(&self) -> bool {
        self.values.values().any(|value| match value {
            FeatureValue::List(values) => values.iter().any(Value::is_uninitialized),
            FeatureValue::Single(_) => false,
        })
    }

    /// Rewrite every object id held by this revision
    pub fn adjust_references(&mut self, adjuster: &impl ReferenceAdjuster) {
        self.id = adjuster.adjust_reference(self.id);
        self.resource = adjuster.adjust_reference(self.resource);
        self.container = adjuster.adjust_reference(self.container);
        for value in self.values.values_mut() {
            match value {
                FeatureValue::Single(value) => adjust_value(value, adjuster),
                FeatureValue::List(values) => {
                    for value in values.iter_mut() {
                        adjust_value(value, adjuster);
                    }
                }
            }
        }
    }

    /// Produce the next revision by applying `delta` to a copy of this one.
    ///
    /// The result is uncommitted: its version is bumped but its branch point
    /// is stamped by the store on commit.
    pub fn apply_delta(&self, delta: &RevisionDelta) -> Result<Revision> {
        if delta.id() != self.id || delta.version() != self.version {
            return Err(DeltaError::Mismatch {
                delta_id: delta.id(),
                delta_version: delta.version(),
                revision_id: self.id,
                revision_version: self.version,
            }
            .into());
        }

        let mut next = self.clone();
        delta.apply(&mut next)?;
        next.version = self.version.next();
        next.revised = Timestamp::UNSPECIFIED;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const NAME: FeatureId = FeatureId(1);
    const CHILDREN: FeatureId = FeatureId(2);

    #[test]
    fn list_slots_are_created_on_demand() {
        let mut rev = Revision::new(ObjectId::Persistent(1), ClassId(7));
        assert!(rev.list(CHILDREN).is_empty());

        rev.list_mut(CHILDREN).push(Value::Int(1));
        rev.list_mut(CHILDREN).push(Value::Uninitialized);
        assert_eq!(rev.list(CHILDREN).len(), 2);
        assert!(rev.has_uninitialized());
        assert_eq!(rev.list_features(), vec![CHILDREN]);
    }

    #[test]
    fn validity_window() {
        let mut rev = Revision::new(ObjectId::Persistent(1), ClassId(7));
        rev.set_branch_point(BranchPoint::new(Default::default(), Timestamp(100)));
        assert!(rev.is_valid_at(Timestamp(100)));
        assert!(rev.is_valid_at(Timestamp(5_000)));
        assert!(!rev.is_valid_at(Timestamp(99)));

        rev.set_revised(Timestamp(199));
        assert!(rev.is_valid_at(Timestamp(199)));
        assert!(!rev.is_valid_at(Timestamp(200)));
    }

    #[test]
    fn adjust_references_rewrites_all_ids() {
        let mapping: HashMap<ObjectId, ObjectId> = [
            (ObjectId::Temp(1), ObjectId::Persistent(10)),
            (ObjectId::Temp(2), ObjectId::Persistent(20)),
        ]
        .into_iter()
        .collect();
        let adjuster = |id: ObjectId| mapping.get(&id).copied().unwrap_or(id);

        let mut rev = Revision::new(ObjectId::Temp(1), ClassId(1));
        rev.set_container(ObjectId::Persistent(5), ObjectId::Temp(2), 3);
        rev.set(NAME, Value::Ref(ObjectId::Temp(2)));
        rev.set_list(CHILDREN, vec![Value::Ref(ObjectId::Temp(2)), Value::Int(4)]);

        rev.adjust_references(&adjuster);

        assert_eq!(rev.id(), ObjectId::Persistent(10));
        assert_eq!(rev.container(), ObjectId::Persistent(20));
        assert_eq!(rev.resource(), ObjectId::Persistent(5));
        assert_eq!(rev.get(NAME), Some(&Value::Ref(ObjectId::Persistent(20))));
        assert_eq!(rev.list(CHILDREN)[0], Value::Ref(ObjectId::Persistent(20)));
    }
}
