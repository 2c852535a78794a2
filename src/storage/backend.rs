//! Row-oriented backing store
//!
//! The repository persists revisions as one row per revision (single-valued
//! features plus the set of list features) and one row per list entry. The
//! [`RowStore`] trait is the seam to a real database; [`MemoryRowStore`] keeps
//! everything in concurrent maps and can inject faults for tests.

use crate::core::error::{Result, StorageError};
use crate::core::types::{BranchId, FeatureId, ObjectId, Timestamp, Value, Version};
use crate::revision::Revision;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Key fields of a list table row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListKey {
    /// Owning object
    pub id: ObjectId,
    /// Branch of the owning revision
    pub branch: BranchId,
    /// Version of the owning revision
    pub version: Version,
    /// List feature
    pub feature: FeatureId,
}

impl ListKey {
    /// Key of `feature` in `revision`
    pub fn of(revision: &Revision, feature: FeatureId) -> Self {
        Self {
            id: revision.id(),
            branch: revision.branch_point().branch,
            version: revision.version(),
            feature,
        }
    }
}

/// One list entry as stored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListRow {
    /// Position in the list
    pub index: i32,
    /// Stored value
    pub value: Value,
}

/// Restriction applied to a list select, in addition to the key fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowFilter {
    /// Every row of the list
    All,
    /// Rows whose index falls in one of the half-open ranges `[start, end)`
    Ranges(Vec<(i32, i32)>),
}

impl RowFilter {
    /// Whether a row at `index` passes the filter
    pub fn accepts(&self, index: i32) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Ranges(ranges) => ranges.iter().any(|&(start, end)| index >= start && index < end),
        }
    }
}

/// Backing store operations used by the store accessor.
///
/// Revision rows carry every single-valued feature and an empty slot for each
/// list feature; list contents live in list rows.
pub trait RowStore: Send + Sync {
    /// Head version of an object on a branch
    fn head_version(&self, id: ObjectId, branch: BranchId) -> Result<Option<Version>>;

    /// Revision row valid at `timestamp`, or the current one if unspecified
    fn select_revision(&self, id: ObjectId, branch: BranchId, timestamp: Timestamp) -> Result<Option<Revision>>;

    /// Revision row with an exact version
    fn select_revision_version(&self, id: ObjectId, branch: BranchId, version: Version) -> Result<Option<Revision>>;

    /// Store a new revision row
    fn insert_revision(&self, row: Revision) -> Result<()>;

    /// Remove a revision row together with its list rows; missing rows are ignored
    fn delete_revision(&self, id: ObjectId, branch: BranchId, version: Version) -> Result<()>;

    /// Close the validity window of a stored revision
    fn revise(&self, id: ObjectId, branch: BranchId, version: Version, revised: Timestamp) -> Result<()>;

    /// Highest list index stored for `key`, `None` if the list is empty
    fn list_last_index(&self, key: &ListKey) -> Result<Option<i32>>;

    /// List rows in index order, at most `max_rows` of them
    fn select_list(&self, key: &ListKey, filter: &RowFilter, max_rows: Option<usize>) -> Result<Vec<ListRow>>;

    /// Store one list entry
    fn insert_list_row(&self, key: &ListKey, index: i32, value: Value) -> Result<()>;
}

/// In-memory row store
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    revisions: DashMap<(ObjectId, BranchId), Vec<Revision>>,
    lists: DashMap<ListKey, BTreeMap<i32, Value>>,
    faulty: AtomicBool,
    operations: AtomicUsize,
    fail_at: AtomicUsize,
}

impl MemoryRowStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following operation fail until reset
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    /// Make only the `nth` following operation fail, counting from 1
    pub fn fail_operation(&self, nth: usize) {
        self.fail_at.store(self.operation_count() + nth.max(1), Ordering::SeqCst);
    }

    /// Drop every injected fault
    pub fn clear_faults(&self) {
        self.faulty.store(false, Ordering::SeqCst);
        self.fail_at.store(0, Ordering::SeqCst);
    }

    /// Number of operations executed so far, failed ones included
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    /// Number of stored revision rows across all objects
    pub fn revision_count(&self) -> usize {
        self.revisions.iter().map(|entry| entry.value().len()).sum()
    }

    fn check(&self, operation: &str) -> Result<()> {
        let operation_number = self.operations.fetch_add(1, Ordering::Relaxed) + 1;
        let scheduled = self
            .fail_at
            .compare_exchange(operation_number, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if scheduled || self.faulty.load(Ordering::SeqCst) {
            return Err(StorageError::fault(format!("{} failed: store unavailable", operation)).into());
        }
        Ok(())
    }
}

impl RowStore for MemoryRowStore {
    fn head_version(&self, id: ObjectId, branch: BranchId) -> Result<Option<Version>> {
        self.check("head_version")?;
        Ok(self
            .revisions
            .get(&(id, branch))
            .and_then(|rows| rows.last().map(Revision::version)))
    }

    fn select_revision(&self, id: ObjectId, branch: BranchId, timestamp: Timestamp) -> Result<Option<Revision>> {
        self.check("select_revision")?;
        let Some(rows) = self.revisions.get(&(id, branch)) else {
            return Ok(None);
        };
        let found = if timestamp.is_unspecified() {
            rows.last().filter(|row| row.is_current())
        } else {
            rows.iter().rev().find(|row| row.is_valid_at(timestamp))
        };
        Ok(found.cloned())
    }

    fn select_revision_version(&self, id: ObjectId, branch: BranchId, version: Version) -> Result<Option<Revision>> {
        self.check("select_revision_version")?;
        Ok(self
            .revisions
            .get(&(id, branch))
            .and_then(|rows| rows.iter().find(|row| row.version() == version).cloned()))
    }

    fn insert_revision(&self, row: Revision) -> Result<()> {
        self.check("insert_revision")?;
        let key = (row.id(), row.branch_point().branch);
        let mut rows = self.revisions.entry(key).or_default();
        if rows.iter().any(|existing| existing.version() == row.version()) {
            return Err(StorageError::DuplicateKey(format!("{} {}", row.id(), row.version())).into());
        }
        rows.push(row);
        rows.sort_by_key(Revision::version);
        Ok(())
    }

    fn delete_revision(&self, id: ObjectId, branch: BranchId, version: Version) -> Result<()> {
        self.check("delete_revision")?;
        if let Some(mut rows) = self.revisions.get_mut(&(id, branch)) {
            rows.retain(|row| row.version() != version);
        }
        self.revisions.remove_if(&(id, branch), |_, rows| rows.is_empty());
        self.lists
            .retain(|key, _| !(key.id == id && key.branch == branch && key.version == version));
        Ok(())
    }

    fn revise(&self, id: ObjectId, branch: BranchId, version: Version, revised: Timestamp) -> Result<()> {
        self.check("revise")?;
        let mut rows = self
            .revisions
            .get_mut(&(id, branch))
            .ok_or_else(|| StorageError::Corruption(format!("no rows for {}", id)))?;
        let row = rows
            .iter_mut()
            .find(|row| row.version() == version)
            .ok_or_else(|| StorageError::Corruption(format!("no row for {} {}", id, version)))?;
        row.set_revised(revised);
        Ok(())
    }

    fn list_last_index(&self, key: &ListKey) -> Result<Option<i32>> {
        self.check("list_last_index")?;
        Ok(self
            .lists
            .get(key)
            .and_then(|rows| rows.keys().next_back().copied()))
    }

    fn select_list(&self, key: &ListKey, filter: &RowFilter, max_rows: Option<usize>) -> Result<Vec<ListRow>> {
        self.check("select_list")?;
        let Some(rows) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let limit = max_rows.unwrap_or(usize::MAX);
        Ok(rows
            .iter()
            .filter(|(index, _)| filter.accepts(**index))
            .take(limit)
            .map(|(index, value)| ListRow { index: *index, value: value.clone() })
            .collect())
    }

    fn insert_list_row(&self, key: &ListKey, index: i32, value: Value) -> Result<()> {
        self.check("insert_list_row")?;
        let mut rows = self.lists.entry(*key).or_default();
        if rows.contains_key(&index) {
            return Err(StorageError::DuplicateKey(format!("{} {} #{}", key.id, key.feature.0, index)).into());
        }
        rows.insert(index, value);
        Ok(())
    }
}
