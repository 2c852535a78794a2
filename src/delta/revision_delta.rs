//! Revision deltas
//!
//! A [`RevisionDelta`] carries every feature change that turns one revision of
//! an object into the next one.

use crate::core::error::Result;
use crate::core::types::{BranchId, Feature, FeatureId, ObjectId, Value, Version};
use crate::delta::feature::{FeatureDelta, NO_INDEX};
use crate::delta::list::ListFeatureDelta;
use crate::revision::{ReferenceAdjuster, Revision};

/// Ordered per-feature changes addressed to one object's version transition
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RevisionDelta {
    id: ObjectId,
    branch: BranchId,
    version: Version,
    deltas: Vec<FeatureDelta>,
}

impl RevisionDelta {
    /// Empty delta against `revision`
    pub fn new(revision: &Revision) -> Self {
        Self::for_version(revision.id(), revision.branch_point().branch, revision.version())
    }

    /// Empty delta against an explicit object version
    pub fn for_version(id: ObjectId, branch: BranchId, version: Version) -> Self {
        Self {
            id,
            branch,
            version,
            deltas: Vec::new(),
        }
    }

    /// Rebuild from already recorded feature deltas, e.g. read off the wire
    pub fn from_parts(id: ObjectId, branch: BranchId, version: Version, deltas: Vec<FeatureDelta>) -> Self {
        Self { id, branch, version, deltas }
    }

    /// Target object
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Branch of the target revision
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Version the delta was computed against
    pub fn version(&self) -> Version {
        self.version
    }

    /// Feature deltas in the order their features were first touched
    pub fn feature_deltas(&self) -> &[FeatureDelta] {
        &self.deltas
    }

    /// Delta recorded for `feature`, if any
    pub fn feature_delta(&self, feature: FeatureId) -> Option<&FeatureDelta> {
        self.deltas.iter().find(|delta| delta.feature().id == feature)
    }

    /// Mutable list delta for `feature`, if one was recorded
    pub fn list_delta_mut(&mut self, feature: FeatureId) -> Option<&mut ListFeatureDelta> {
        self.deltas.iter_mut().find_map(|delta| match delta {
            FeatureDelta::List(list) if list.feature().id == feature => Some(list),
            _ => None,
        })
    }

    /// Whether no change was recorded
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Record a feature change.
    ///
    /// Changes to multi-valued features are collected into one list delta per
    /// feature; a change to a single-valued feature replaces the earlier one.
    pub fn add_feature_delta(&mut self, delta: FeatureDelta) {
        let feature = delta.feature();
        if feature.many {
            if let Some(list) = self.list_delta_mut(feature.id) {
                list.add(delta);
                return;
            }
            let mut list = ListFeatureDelta::new(feature);
            list.add(delta);
            self.deltas.push(FeatureDelta::List(list));
            return;
        }

        match self.deltas.iter_mut().find(|existing| existing.feature().id == feature.id) {
            Some(existing) => *existing = delta,
            None => self.deltas.push(delta),
        }
    }

    /// Replay every feature delta, in order, onto a working copy
    pub fn apply(&self, revision: &mut Revision) -> Result<()> {
        for delta in &self.deltas {
            delta.apply(revision)?;
        }
        Ok(())
    }

    /// Deep copy, including the list deltas' cached reconstruction state
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Rewrite every object id held by this delta
    pub fn adjust_references(&mut self, adjuster: &impl ReferenceAdjuster) {
        self.id = adjuster.adjust_reference(self.id);
        for delta in &mut self.deltas {
            delta.adjust_references(adjuster);
        }
    }

    /// Object ids referenced by the values this delta introduces
    pub fn referenced_ids(&self) -> Vec<ObjectId> {
        fn collect(delta: &FeatureDelta, out: &mut Vec<ObjectId>) {
            match delta {
                FeatureDelta::List(list) => {
                    for nested in list.list_changes() {
                        collect(nested, out);
                    }
                }
                FeatureDelta::Container { resource, container, .. } => {
                    out.extend([*resource, *container].into_iter().filter(|id| !id.is_null()));
                }
                other => {
                    if let Some(id) = other.value().and_then(Value::as_ref_id) {
                        if !id.is_null() {
                            out.push(id);
                        }
                    }
                }
            }
        }

        let mut ids = Vec::new();
        for delta in &self.deltas {
            collect(delta, &mut ids);
        }
        ids
    }

    /// Compute the delta that turns `old` into `new`.
    ///
    /// `features` describes the class of both revisions. List differences are
    /// expressed as removals and insertions between the common prefix and
    /// suffix of the two lists.
    pub fn compare(old: &Revision, new: &Revision, features: &[Feature]) -> Self {
        let mut delta = Self::new(old);

        if old.resource() != new.resource()
            || old.container() != new.container()
            || old.containing_feature() != new.containing_feature()
        {
            delta.add_feature_delta(FeatureDelta::Container {
                resource: new.resource(),
                container: new.container(),
                containing_feature: new.containing_feature(),
            });
        }

        for feature in features {
            if feature.many {
                diff_list(&mut delta, *feature, old.list(feature.id), new.list(feature.id));
            } else {
                match (old.get(feature.id), new.get(feature.id)) {
                    (before, Some(after)) if before != Some(after) => {
                        delta.add_feature_delta(FeatureDelta::Set {
                            feature: *feature,
                            index: NO_INDEX,
                            value: after.clone(),
                        });
                    }
                    (Some(_), None) => {
                        delta.add_feature_delta(FeatureDelta::Unset { feature: *feature });
                    }
                    _ => {}
                }
            }
        }

        delta
    }
}

fn diff_list(delta: &mut RevisionDelta, feature: Feature, old: &[Value], new: &[Value]) {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old.len() - prefix - suffix;
    for _ in 0..removed {
        delta.add_feature_delta(FeatureDelta::Remove { feature, index: prefix as i32 });
    }

    for (offset, value) in new[prefix..new.len() - suffix].iter().enumerate() {
        delta.add_feature_delta(FeatureDelta::Add {
            feature,
            index: (prefix + offset) as i32,
            value: value.clone(),
        });
    }
}
