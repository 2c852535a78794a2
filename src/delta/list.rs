//! List feature deltas and added-index reconstruction
//!
//! A [`ListFeatureDelta`] records every change made to one multi-valued
//! feature, in arrival order. It also answers, for every adding delta still
//! alive, which index that delta occupies once all later removes and moves are
//! taken into account, without replaying the whole history on each query.
//!
//! All nested deltas live in one owned vector. The reconstruction table refers
//! to them by position in that vector, so a clone of the whole structure is
//! immediately consistent with itself.

use crate::core::error::Result;
use crate::core::types::Feature;
use crate::delta::feature::FeatureDelta;
use crate::revision::{ReferenceAdjuster, Revision};
use std::hash::{Hash, Hasher};
use tracing::trace;

/// Minimum capacity of the reconstruction table after growth
const MIN_TABLE_CAPACITY: usize = 10;

/// Reconstruction table: slot 0 of `indices` is the live count.
#[derive(Clone, Debug, Default)]
struct IndexTable {
    sources: Vec<Option<usize>>,
    indices: Vec<i32>,
}

impl IndexTable {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            sources: vec![None; capacity],
            indices: vec![0; capacity],
        }
    }

    fn count(&self) -> usize {
        self.indices[0] as usize
    }

    /// Grow geometrically, keeping existing contents
    fn ensure_capacity(&mut self, required: usize) {
        if self.indices.len() <= required {
            let capacity = MIN_TABLE_CAPACITY.max(self.indices.len() * 3 / 2 + 1).max(required + 1);
            self.indices.resize(capacity, 0);
            self.sources.resize(capacity, None);
        }
    }

    fn push(&mut self, index: i32, source: usize) {
        let slot = self.count() + 1;
        self.indices[slot] = index;
        self.sources[slot] = Some(source);
        self.indices[0] += 1;
    }
}

/// Snapshot of a reconstruction table.
///
/// `indices[0]` is the number of live entries; `indices[1..=count]` are the
/// corrected indices and `sources[1..=count]` the positions of the adding
/// deltas inside [`ListFeatureDelta::list_changes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddedIndices {
    /// Positions of adding deltas, parallel to `indices`
    pub sources: Vec<Option<usize>>,
    /// Live count followed by corrected indices
    pub indices: Vec<i32>,
}

impl AddedIndices {
    /// Number of live adding deltas
    pub fn count(&self) -> usize {
        self.indices[0] as usize
    }

    /// `(corrected index, delta position)` pairs in table order
    pub fn entries(&self) -> impl Iterator<Item = (i32, usize)> + '_ {
        (1..=self.count()).filter_map(move |slot| self.sources[slot].map(|src| (self.indices[slot], src)))
    }
}

/// Ordered changes to one multi-valued feature
#[derive(Clone, Debug)]
pub struct ListFeatureDelta {
    feature: Feature,
    deltas: Vec<FeatureDelta>,
    table: Option<IndexTable>,
    unprocessed: Option<Vec<usize>>,
}

impl ListFeatureDelta {
    /// Create an empty list delta for `feature`
    pub fn new(feature: Feature) -> Self {
        Self {
            feature,
            deltas: Vec::new(),
            table: None,
            unprocessed: None,
        }
    }

    /// Rebuild from already recorded changes, e.g. read off the wire.
    ///
    /// No clean-up is performed: the changes are taken as they were recorded.
    pub fn from_changes(feature: Feature, deltas: Vec<FeatureDelta>) -> Self {
        Self {
            feature,
            deltas,
            table: None,
            unprocessed: None,
        }
    }

    /// Target feature
    pub fn feature(&self) -> Feature {
        self.feature
    }

    /// Nested changes in arrival order
    pub fn list_changes(&self) -> &[FeatureDelta] {
        &self.deltas
    }

    /// Whether no change was recorded
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Record one more change.
    ///
    /// Removing an entry that an earlier adding delta of a reference or
    /// feature-map list introduced clears that delta's payload. Plain value
    /// lists only shift indices.
    pub fn add(&mut self, delta: FeatureDelta) {
        if let FeatureDelta::List(nested) = delta {
            for change in nested.deltas {
                self.add(change);
            }
            return;
        }

        self.cleanup_with_new_delta(&delta);
        self.deltas.push(delta);
        if let Some(unprocessed) = self.unprocessed.as_mut() {
            unprocessed.push(self.deltas.len() - 1);
        }
    }

    fn cleanup_with_new_delta(&mut self, delta: &FeatureDelta) {
        if self.feature.is_reference_or_feature_map() {
            if let FeatureDelta::Remove { index: index_to_remove, .. } = delta {
                self.reconstruct_added_indices_with_no_copy();
                let matched = self.table.as_ref().and_then(|table| {
                    (1..=table.count())
                        .find(|&slot| table.indices[slot] == *index_to_remove)
                        .and_then(|slot| table.sources[slot])
                });
                if let Some(source) = matched {
                    trace!(feature = self.feature.id.0, index = index_to_remove, source, "clearing added entry");
                    self.deltas[source].clear_value();
                }
            }
        }

        // Once a table exists, new changes are replayed lazily on the next read
        if self.table.is_some() && self.unprocessed.is_none() {
            self.unprocessed = Some(Vec::new());
        }
    }

    /// Corrected indices of every live adding delta, as a copy of the table
    pub fn reconstruct_added_indices(&mut self) -> AddedIndices {
        self.reconstruct_added_indices_with_no_copy();
        match &self.table {
            Some(table) => AddedIndices {
                sources: table.sources.clone(),
                indices: table.indices.clone(),
            },
            None => AddedIndices { sources: vec![None], indices: vec![0] },
        }
    }

    /// Live adding deltas with their corrected indices
    pub fn added_entries(&mut self) -> Vec<(i32, &FeatureDelta)> {
        let added = self.reconstruct_added_indices();
        added
            .entries()
            .map(|(index, source)| (index, &self.deltas[source]))
            .collect()
    }

    fn reconstruct_added_indices_with_no_copy(&mut self) {
        if self.table.is_some() && self.unprocessed.is_none() {
            return;
        }

        let required = 1 + self.deltas.len();
        if self.table.is_none() {
            self.table = Some(IndexTable::with_capacity(required));
        } else if let Some(table) = self.table.as_mut() {
            table.ensure_capacity(required);
        }
        let Some(table) = self.table.as_mut() else {
            return;
        };

        let pending: Vec<usize> = match self.unprocessed.take() {
            Some(pending) => pending,
            None => (0..self.deltas.len()).collect(),
        };

        for position in pending {
            let delta = &self.deltas[position];
            if let Some(effect) = delta.index_effect() {
                effect.affect_indices(&mut table.sources, &mut table.indices);
            }
            if let Some(index) = delta.adding_index() {
                table.push(index, position);
            }
        }
    }

    /// Replay every nested change, in order, onto a working copy
    pub fn apply(&self, revision: &mut Revision) -> Result<()> {
        for delta in &self.deltas {
            delta.apply(revision)?;
        }
        Ok(())
    }

    /// Rewrite every object id carried by the nested changes
    pub fn adjust_references(&mut self, adjuster: &impl ReferenceAdjuster) {
        for delta in &mut self.deltas {
            delta.adjust_references(adjuster);
        }
    }

    /// Deep copy including the cached table and the unprocessed buffer
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

impl PartialEq for ListFeatureDelta {
    fn eq(&self, other: &Self) -> bool {
        self.feature == other.feature && self.deltas == other.deltas
    }
}

impl Eq for ListFeatureDelta {}

impl Hash for ListFeatureDelta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.feature.hash(state);
        self.deltas.hash(state);
    }
}
