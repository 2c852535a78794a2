//! Per-request store access and chunk reading

use crate::core::error::{Error, Result};
use crate::core::types::{BranchId, BranchPoint, FeatureId, ObjectId, Timestamp, Version};
use crate::revision::Revision;
use crate::storage::backend::{ListKey, RowFilter, RowStore};
use crate::storage::chunk::Chunk;
use crate::storage::list_mapping::ListTableMapping;
use crate::storage::statement::{
    ReuseProbability, StatementCache, DELETE_REVISION, INSERT_REVISION, SELECT_HEAD_VERSION, SELECT_REVISION,
    SELECT_REVISION_VERSION, UPDATE_REVISED,
};
use crate::storage::store::StoreInner;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Store access bound to one request; released on drop
pub struct StoreAccessor {
    store: Arc<StoreInner>,
}

impl StoreAccessor {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self { store }
    }

    /// Backing rows
    pub fn rows(&self) -> &dyn RowStore {
        self.store.rows.as_ref()
    }

    /// Statement cache of the store
    pub fn statements(&self) -> &StatementCache {
        &self.store.statements
    }

    /// List chunk size used when a request does not name one
    pub fn default_list_chunk(&self) -> i32 {
        self.store.default_list_chunk
    }

    /// Head version of an object on a branch
    pub fn head_version(&self, id: ObjectId, branch: BranchId) -> Result<Option<Version>> {
        let _statement = self.statements().prepare(SELECT_HEAD_VERSION, ReuseProbability::High);
        self.rows().head_version(id, branch)
    }

    /// Revision valid at `branch_point`, with its lists read up to `list_chunk` entries
    pub fn read_revision(&self, id: ObjectId, branch_point: BranchPoint, list_chunk: i32) -> Result<Option<Revision>> {
        let row = {
            let _statement = self.statements().prepare(SELECT_REVISION, ReuseProbability::High);
            self.rows().select_revision(id, branch_point.branch, branch_point.timestamp)?
        };
        row.map(|row| self.read_lists(row, list_chunk)).transpose()
    }

    /// Revision with an exact version
    pub fn read_revision_by_version(
        &self,
        id: ObjectId,
        branch: BranchId,
        version: Version,
        list_chunk: i32,
    ) -> Result<Option<Revision>> {
        let row = {
            let _statement = self.statements().prepare(SELECT_REVISION_VERSION, ReuseProbability::High);
            self.rows().select_revision_version(id, branch, version)?
        };
        row.map(|row| self.read_lists(row, list_chunk)).transpose()
    }

    fn read_lists(&self, mut revision: Revision, list_chunk: i32) -> Result<Revision> {
        for feature in revision.list_features() {
            ListTableMapping::new(feature).read_values(self, &mut revision, list_chunk)?;
        }
        trace!(id = %revision.id(), version = %revision.version(), "revision read");
        Ok(revision)
    }

    /// Persist a new revision: one revision row plus the rows of every list.
    ///
    /// A failure leaves none of the revision's rows behind.
    pub fn write_revision(&self, revision: &Revision) -> Result<()> {
        if revision.has_uninitialized() {
            return Err(Error::invalid_input(format!(
                "revision {} {} still has unloaded list entries",
                revision.id(),
                revision.version()
            )));
        }

        let mut row = revision.clone();
        let lists = row.list_features();
        for feature in &lists {
            row.set_list(*feature, Vec::new());
        }
        {
            let _statement = self.statements().prepare(INSERT_REVISION, ReuseProbability::High);
            self.rows().insert_revision(row)?;
        }

        let written = lists
            .into_iter()
            .try_for_each(|feature| ListTableMapping::new(feature).write_values(self, revision));
        if let Err(err) = written {
            if let Err(cleanup) = self.discard_revision(revision.id(), revision.branch_point().branch, revision.version()) {
                warn!(id = %revision.id(), error = %cleanup, "partially written revision left behind");
            }
            return Err(err);
        }
        debug!(id = %revision.id(), version = %revision.version(), "revision written");
        Ok(())
    }

    /// Remove a written revision and its list rows
    pub fn discard_revision(&self, id: ObjectId, branch: BranchId, version: Version) -> Result<()> {
        let _statement = self.statements().prepare(DELETE_REVISION, ReuseProbability::Low);
        self.rows().delete_revision(id, branch, version)
    }

    /// Close the validity window of a stored revision at `revised`
    pub fn revise(&self, id: ObjectId, branch: BranchId, version: Version, revised: Timestamp) -> Result<()> {
        let _statement = self.statements().prepare(UPDATE_REVISED, ReuseProbability::High);
        self.rows().revise(id, branch, version, revised)
    }

    /// Chunk reader for one list of one stored revision
    pub fn chunk_reader(&self, id: ObjectId, branch: BranchId, version: Version, feature: FeatureId) -> StoreChunkReader<'_> {
        StoreChunkReader {
            accessor: self,
            key: ListKey { id, branch, version, feature },
            chunks: Vec::new(),
        }
    }
}

impl Drop for StoreAccessor {
    fn drop(&mut self) {
        self.store.active_accessors.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collects list ranges and reads them in one scan
pub struct StoreChunkReader<'a> {
    accessor: &'a StoreAccessor,
    key: ListKey,
    chunks: Vec<Chunk>,
}

impl<'a> StoreChunkReader<'a> {
    /// Accessor the reader works through
    pub fn accessor(&self) -> &'a StoreAccessor {
        self.accessor
    }

    /// List being read
    pub fn key(&self) -> &ListKey {
        &self.key
    }

    /// Request the single entry at `index`
    pub fn add_simple_chunk(&mut self, index: i32) {
        self.add_range(index, index + 1);
    }

    /// Request the entries in `[from_index, to_index)`; empty ranges are ignored
    pub fn add_range(&mut self, from_index: i32, to_index: i32) {
        if to_index > from_index {
            self.chunks.push(Chunk::new(from_index, (to_index - from_index) as usize));
        }
    }

    /// Requested chunks so far
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Read every requested range and return the filled chunks in index order
    pub fn execute_read(mut self) -> Result<Vec<Chunk>> {
        let mut chunks = std::mem::take(&mut self.chunks);
        chunks.sort_by_key(Chunk::start_index);
        if chunks.windows(2).any(|pair| pair[0].end_index() > pair[1].start_index()) {
            return Err(Error::invalid_input("overlapping chunk ranges"));
        }
        if chunks.is_empty() {
            return Ok(chunks);
        }

        let filter = RowFilter::Ranges(chunks.iter().map(|c| (c.start_index(), c.end_index())).collect());
        ListTableMapping::new(self.key.feature).read_chunks(&self, &mut chunks, &filter)?;
        Ok(chunks)
    }
}
