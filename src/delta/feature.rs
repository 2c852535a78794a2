//! Single-feature deltas
//!
//! [`FeatureDelta`] is a closed sum over every kind of change one feature of
//! one revision can undergo. The two list capabilities are exposed as
//! functions returning `Option`: [`FeatureDelta::adding_index`] for deltas that
//! put a value at an index, [`FeatureDelta::index_effect`] for deltas that
//! shift the indices of other entries.

use crate::core::error::{DeltaError, Result};
use crate::core::types::{Feature, ObjectId, Value};
use crate::delta::list::ListFeatureDelta;
use crate::revision::{adjust_value, ReferenceAdjuster, Revision};

/// Index used by `Set` on single-valued features
pub const NO_INDEX: i32 = -1;

/// Wire tag of a feature delta
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaType {
    /// No change
    Noop = 0,
    /// Set a value (optionally at a list index)
    Set = 1,
    /// Insert into a list
    Add = 2,
    /// Remove from a list
    Remove = 3,
    /// Move within a list
    Move = 4,
    /// Container of nested list deltas
    List = 5,
    /// Clear a feature
    Clear = 6,
    /// Unset a feature
    Unset = 7,
    /// Change resource/container
    Container = 8,
}

impl DeltaType {
    /// Convert a wire byte into a delta type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeltaType::Noop),
            1 => Some(DeltaType::Set),
            2 => Some(DeltaType::Add),
            3 => Some(DeltaType::Remove),
            4 => Some(DeltaType::Move),
            5 => Some(DeltaType::List),
            6 => Some(DeltaType::Clear),
            7 => Some(DeltaType::Unset),
            8 => Some(DeltaType::Container),
            _ => None,
        }
    }
}

/// One change to one feature
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FeatureDelta {
    /// Set a single value, or replace the list entry at `index`
    Set {
        /// Target feature
        feature: Feature,
        /// List index, [`NO_INDEX`] for single-valued features
        index: i32,
        /// New value
        value: Value,
    },
    /// Insert `value` at `index`
    Add {
        /// Target feature
        feature: Feature,
        /// Insertion index
        index: i32,
        /// Inserted value
        value: Value,
    },
    /// Remove the entry at `index`
    Remove {
        /// Target feature
        feature: Feature,
        /// Removed index
        index: i32,
    },
    /// Move the entry at `old_position` to `new_position`
    Move {
        /// Target feature
        feature: Feature,
        /// Source index
        old_position: i32,
        /// Destination index
        new_position: i32,
    },
    /// Ordered nested changes of one multi-valued feature
    List(ListFeatureDelta),
    /// Remove every entry (lists) or the value (single features)
    Clear {
        /// Target feature
        feature: Feature,
    },
    /// Return the feature to its unset state
    Unset {
        /// Target feature
        feature: Feature,
    },
    /// Change the resource/container of the object
    Container {
        /// New resource
        resource: ObjectId,
        /// New container
        container: ObjectId,
        /// Feature of the container holding the object
        containing_feature: i32,
    },
    /// No change
    Noop {
        /// Target feature
        feature: Feature,
    },
}

/// How an index-affecting delta shifts other entries of the same list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexEffect {
    /// Entry at `index` goes away, later entries shift down
    Remove {
        /// Removed index
        index: i32,
    },
    /// Entry moves from `from` to `to`, entries in between shift toward `from`
    Move {
        /// Source index
        from: i32,
        /// Destination index
        to: i32,
    },
}

impl IndexEffect {
    /// Correct a reconstruction table in place.
    ///
    /// `indices[0]` holds the live entry count; `indices[1..=count]` and
    /// `sources[1..=count]` hold the corrected indices and their adding deltas.
    pub fn affect_indices(&self, sources: &mut [Option<usize>], indices: &mut [i32]) {
        match *self {
            IndexEffect::Remove { index } => {
                let mut i = 1;
                while i <= indices[0] as usize {
                    if indices[i] > index {
                        indices[i] -= 1;
                    } else if indices[i] == index {
                        let count = indices[0] as usize;
                        let rest = count - i;
                        indices[0] -= 1;
                        if rest > 0 {
                            indices.copy_within(i + 1..=count, i);
                            sources.copy_within(i + 1..=count, i);
                            // Re-examine the slot that just shifted down
                            continue;
                        }
                    }
                    i += 1;
                }
            }
            IndexEffect::Move { from, to } => {
                if from == to {
                    return;
                }
                for i in 1..=indices[0] as usize {
                    let current = indices[i];
                    if current == from {
                        indices[i] = to;
                    } else if from < to && current > from && current <= to {
                        indices[i] -= 1;
                    } else if from > to && current >= to && current < from {
                        indices[i] += 1;
                    }
                }
            }
        }
    }
}

impl FeatureDelta {
    /// Feature targeted by this delta
    pub fn feature(&self) -> Feature {
        match self {
            FeatureDelta::Set { feature, .. }
            | FeatureDelta::Add { feature, .. }
            | FeatureDelta::Remove { feature, .. }
            | FeatureDelta::Move { feature, .. }
            | FeatureDelta::Clear { feature }
            | FeatureDelta::Unset { feature }
            | FeatureDelta::Noop { feature } => *feature,
            FeatureDelta::List(list) => list.feature(),
            FeatureDelta::Container { .. } => Feature::CONTAINER,
        }
    }

    /// Wire tag
    pub fn delta_type(&self) -> DeltaType {
        match self {
            FeatureDelta::Noop { .. } => DeltaType::Noop,
            FeatureDelta::Set { .. } => DeltaType::Set,
            FeatureDelta::Add { .. } => DeltaType::Add,
            FeatureDelta::Remove { .. } => DeltaType::Remove,
            FeatureDelta::Move { .. } => DeltaType::Move,
            FeatureDelta::List(_) => DeltaType::List,
            FeatureDelta::Clear { .. } => DeltaType::Clear,
            FeatureDelta::Unset { .. } => DeltaType::Unset,
            FeatureDelta::Container { .. } => DeltaType::Container,
        }
    }

    /// Index at which this delta introduces a value into a list, if any
    pub fn adding_index(&self) -> Option<i32> {
        match self {
            FeatureDelta::Add { index, .. } => Some(*index),
            FeatureDelta::Set { feature, index, .. } if feature.many && *index != NO_INDEX => Some(*index),
            _ => None,
        }
    }

    /// Effect this delta has on the indices of other list entries, if any
    pub fn index_effect(&self) -> Option<IndexEffect> {
        match self {
            FeatureDelta::Remove { index, .. } => Some(IndexEffect::Remove { index: *index }),
            FeatureDelta::Move { old_position, new_position, .. } => Some(IndexEffect::Move {
                from: *old_position,
                to: *new_position,
            }),
            _ => None,
        }
    }

    /// Value carried by an adding delta
    pub fn value(&self) -> Option<&Value> {
        match self {
            FeatureDelta::Set { value, .. } | FeatureDelta::Add { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Drop the payload of an adding delta whose entry was removed again
    pub fn clear_value(&mut self) {
        if let FeatureDelta::Set { value, .. } | FeatureDelta::Add { value, .. } = self {
            *value = Value::Null;
        }
    }

    /// Apply this change to a working copy of a revision
    pub fn apply(&self, revision: &mut Revision) -> Result<()> {
        match self {
            FeatureDelta::Set { feature, index, value } => {
                if feature.many && *index != NO_INDEX {
                    let list = revision.list_mut(feature.id);
                    let slot = checked_index(*index, list.len(), false)?;
                    list[slot] = value.clone();
                } else {
                    revision.set(feature.id, value.clone());
                }
            }
            FeatureDelta::Add { feature, index, value } => {
                require_many(feature)?;
                let list = revision.list_mut(feature.id);
                let slot = checked_index(*index, list.len(), true)?;
                list.insert(slot, value.clone());
            }
            FeatureDelta::Remove { feature, index } => {
                require_many(feature)?;
                let list = revision.list_mut(feature.id);
                let slot = checked_index(*index, list.len(), false)?;
                list.remove(slot);
            }
            FeatureDelta::Move { feature, old_position, new_position } => {
                require_many(feature)?;
                let list = revision.list_mut(feature.id);
                let from = checked_index(*old_position, list.len(), false)?;
                let to = checked_index(*new_position, list.len(), false)?;
                let value = list.remove(from);
                list.insert(to, value);
            }
            FeatureDelta::List(list) => list.apply(revision)?,
            FeatureDelta::Clear { feature } => {
                if feature.many {
                    revision.list_mut(feature.id).clear();
                } else {
                    revision.unset(feature.id);
                }
            }
            FeatureDelta::Unset { feature } => revision.unset(feature.id),
            FeatureDelta::Container { resource, container, containing_feature } => {
                revision.set_container(*resource, *container, *containing_feature);
            }
            FeatureDelta::Noop { .. } => {}
        }
        Ok(())
    }

    /// Rewrite every object id carried by this delta
    pub fn adjust_references(&mut self, adjuster: &impl ReferenceAdjuster) {
        match self {
            FeatureDelta::Set { value, .. } | FeatureDelta::Add { value, .. } => {
                adjust_value(value, adjuster);
            }
            FeatureDelta::List(list) => list.adjust_references(adjuster),
            FeatureDelta::Container { resource, container, .. } => {
                *resource = adjuster.adjust_reference(*resource);
                *container = adjuster.adjust_reference(*container);
            }
            FeatureDelta::Remove { .. }
            | FeatureDelta::Move { .. }
            | FeatureDelta::Clear { .. }
            | FeatureDelta::Unset { .. }
            | FeatureDelta::Noop { .. } => {}
        }
    }
}

fn require_many(feature: &Feature) -> Result<()> {
    if feature.many {
        Ok(())
    } else {
        Err(DeltaError::Multiplicity(feature.id.0).into())
    }
}

fn checked_index(index: i32, size: usize, allow_end: bool) -> Result<usize> {
    let in_bounds = index >= 0 && {
        let index = index as usize;
        if allow_end { index <= size } else { index < size }
    };
    if in_bounds {
        Ok(index as usize)
    } else {
        Err(DeltaError::IndexOutOfBounds { index, size }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClassId;

    const TAGS: Feature = Feature::attribute_list(3);

    fn table(entries: &[i32]) -> (Vec<Option<usize>>, Vec<i32>) {
        let mut indices = vec![entries.len() as i32];
        indices.extend_from_slice(entries);
        let mut sources = vec![None];
        sources.extend((0..entries.len()).map(Some));
        (sources, indices)
    }

    #[test]
    fn remove_effect_compacts_matching_entry() {
        let (mut sources, mut indices) = table(&[0, 1, 2]);
        IndexEffect::Remove { index: 1 }.affect_indices(&mut sources, &mut indices);
        assert_eq!(indices[0], 2);
        assert_eq!(&indices[1..=2], &[0, 1]);
        assert_eq!(&sources[1..=2], &[Some(0), Some(2)]);
    }

    #[test]
    fn remove_effect_without_match_only_shifts() {
        let (mut sources, mut indices) = table(&[0, 4, 7]);
        IndexEffect::Remove { index: 2 }.affect_indices(&mut sources, &mut indices);
        assert_eq!(indices[0], 3);
        assert_eq!(&indices[1..=3], &[0, 3, 6]);
    }

    #[test]
    fn remove_effect_on_last_entry() {
        let (mut sources, mut indices) = table(&[0, 5]);
        IndexEffect::Remove { index: 5 }.affect_indices(&mut sources, &mut indices);
        assert_eq!(indices[0], 1);
        assert_eq!(indices[1], 0);
    }

    #[test]
    fn move_effect_both_directions() {
        let (mut sources, mut indices) = table(&[0, 1, 2, 3]);
        IndexEffect::Move { from: 0, to: 2 }.affect_indices(&mut sources, &mut indices);
        assert_eq!(&indices[1..=4], &[2, 0, 1, 3]);

        IndexEffect::Move { from: 3, to: 0 }.affect_indices(&mut sources, &mut indices);
        assert_eq!(&indices[1..=4], &[3, 1, 2, 0]);
    }

    #[test]
    fn capabilities_per_variant() {
        let add = FeatureDelta::Add { feature: TAGS, index: 2, value: Value::Int(1) };
        assert_eq!(add.adding_index(), Some(2));
        assert_eq!(add.index_effect(), None);

        let set_single = FeatureDelta::Set {
            feature: Feature::attribute(1),
            index: NO_INDEX,
            value: Value::Int(1),
        };
        assert_eq!(set_single.adding_index(), None);

        let set_at = FeatureDelta::Set { feature: TAGS, index: 0, value: Value::Int(1) };
        assert_eq!(set_at.adding_index(), Some(0));

        let remove = FeatureDelta::Remove { feature: TAGS, index: 4 };
        assert_eq!(remove.index_effect(), Some(IndexEffect::Remove { index: 4 }));
        assert_eq!(remove.adding_index(), None);
    }

    #[test]
    fn apply_list_operations() {
        let mut rev = Revision::new(ObjectId::Persistent(1), ClassId(1));
        for (i, v) in ["a", "b", "c"].into_iter().enumerate() {
            FeatureDelta::Add { feature: TAGS, index: i as i32, value: v.into() }
                .apply(&mut rev)
                .unwrap();
        }
        FeatureDelta::Move { feature: TAGS, old_position: 0, new_position: 2 }
            .apply(&mut rev)
            .unwrap();
        assert_eq!(rev.list(TAGS.id).to_vec(), vec![Value::from("b"), Value::from("c"), Value::from("a")]);

        FeatureDelta::Remove { feature: TAGS, index: 1 }.apply(&mut rev).unwrap();
        FeatureDelta::Set { feature: TAGS, index: 0, value: "z".into() }
            .apply(&mut rev)
            .unwrap();
        assert_eq!(rev.list(TAGS.id).to_vec(), vec![Value::from("z"), Value::from("a")]);

        let err = FeatureDelta::Remove { feature: TAGS, index: 5 }.apply(&mut rev).unwrap_err();
        assert!(matches!(err, crate::core::Error::Delta(DeltaError::IndexOutOfBounds { index: 5, size: 2 })));

        FeatureDelta::Clear { feature: TAGS }.apply(&mut rev).unwrap();
        assert!(rev.list(TAGS.id).is_empty());
    }

    #[test]
    fn list_ops_on_single_feature_are_rejected() {
        let mut rev = Revision::new(ObjectId::Persistent(1), ClassId(1));
        let err = FeatureDelta::Add { feature: Feature::attribute(1), index: 0, value: Value::Int(1) }
            .apply(&mut rev)
            .unwrap_err();
        assert!(matches!(err, crate::core::Error::Delta(DeltaError::Multiplicity(1))));
    }

    #[test]
    fn clear_value_nulls_payload() {
        let mut add = FeatureDelta::Add {
            feature: Feature::reference_list(2),
            index: 0,
            value: Value::Ref(ObjectId::Persistent(9)),
        };
        add.clear_value();
        assert_eq!(add.value(), Some(&Value::Null));
    }
}
