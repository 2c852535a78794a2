//! Mapping of one multi-valued feature onto list rows

use crate::core::error::{Result, StorageError};
use crate::core::types::{FeatureId, Value};
use crate::revision::Revision;
use crate::storage::accessor::{StoreAccessor, StoreChunkReader};
use crate::storage::backend::{ListKey, RowFilter};
use crate::storage::chunk::Chunk;
use crate::storage::statement::{
    ReuseProbability, INSERT_LIST_ENTRY, SELECT_LIST_CHUNKS, SELECT_LIST_CHUNKS_FILTERED, SELECT_LIST_LAST_INDEX,
};
use tracing::{debug, trace};

/// List chunk size meaning "read the whole list"; any negative size does
pub const UNCHUNKED: i32 = -1;

/// Reads and writes the entries of one list feature
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListTableMapping {
    feature: FeatureId,
}

impl ListTableMapping {
    /// Mapping for `feature`
    pub fn new(feature: FeatureId) -> Self {
        Self { feature }
    }

    /// Mapped feature
    pub fn feature(&self) -> FeatureId {
        self.feature
    }

    /// Load the list of `revision`.
    ///
    /// With a bounded `list_chunk` only the first `list_chunk` entries are
    /// read; the rest of the list is padded with [`Value::Uninitialized`] up to
    /// its stored size. A negative `list_chunk` reads the whole list.
    pub fn read_values(&self, accessor: &StoreAccessor, revision: &mut Revision, list_chunk: i32) -> Result<()> {
        let key = ListKey::of(revision, self.feature);
        let chunked = list_chunk >= 0;
        let mut remaining: i64 = -1;

        if chunked {
            match self.list_last_index(accessor, &key)? {
                // Empty list, nothing to read
                None => return Ok(()),
                Some(last_index) => remaining = i64::from(last_index) - i64::from(list_chunk),
            }
        }

        trace!(id = %key.id, version = %key.version, feature = self.feature.0, list_chunk, "reading list values");

        let statement = accessor.statements().prepare(SELECT_LIST_CHUNKS, ReuseProbability::High);
        let max_rows = chunked.then_some(list_chunk as usize);
        let rows = accessor.rows().select_list(&key, &RowFilter::All, max_rows)?;
        drop(statement);

        let list = revision.list_mut(self.feature);
        list.extend(rows.into_iter().map(|row| row.value));
        while remaining >= 0 {
            list.push(Value::Uninitialized);
            remaining -= 1;
        }
        Ok(())
    }

    /// Fill `chunks` from one ordered scan of the rows accepted by `filter`.
    ///
    /// Rows are handed out to the chunks in order: a chunk takes rows until it
    /// is full, then the next chunk starts.
    pub fn read_chunks(&self, reader: &StoreChunkReader<'_>, chunks: &mut [Chunk], filter: &RowFilter) -> Result<()> {
        let accessor = reader.accessor();
        let key = reader.key();
        let sql = match filter {
            RowFilter::All => SELECT_LIST_CHUNKS,
            RowFilter::Ranges(_) => SELECT_LIST_CHUNKS_FILTERED,
        };

        let _statement = accessor.statements().prepare(sql, ReuseProbability::Low);
        let rows = accessor.rows().select_list(key, filter, None)?;

        let mut current: Option<usize> = None;
        let mut next_chunk = 0;
        let mut chunk_size = 0;
        let mut index_in_chunk = 0;

        for row in rows {
            let chunk = match current {
                Some(chunk) => chunk,
                None => {
                    let chunk = next_chunk;
                    if chunk >= chunks.len() {
                        return Err(StorageError::Corruption(format!(
                            "row {} of {} does not fit the requested chunks",
                            row.index, key.id
                        ))
                        .into());
                    }
                    next_chunk += 1;
                    chunk_size = chunks[chunk].size();
                    trace!(chunk, start = chunks[chunk].start_index(), size = chunk_size, "filling chunk");
                    current = Some(chunk);
                    chunk
                }
            };

            chunks[chunk].add(index_in_chunk, row.value);
            index_in_chunk += 1;
            if index_in_chunk == chunk_size {
                current = None;
                index_in_chunk = 0;
            }
        }

        debug!(id = %key.id, feature = self.feature.0, chunks = chunks.len(), "list chunks read");
        Ok(())
    }

    /// Store every entry of the list of `revision`, one row per index
    pub fn write_values(&self, accessor: &StoreAccessor, revision: &Revision) -> Result<()> {
        let key = ListKey::of(revision, self.feature);
        for (index, value) in revision.list(self.feature).iter().enumerate() {
            let _statement = accessor.statements().prepare(INSERT_LIST_ENTRY, ReuseProbability::High);
            accessor.rows().insert_list_row(&key, index as i32, value.clone())?;
        }
        Ok(())
    }

    fn list_last_index(&self, accessor: &StoreAccessor, key: &ListKey) -> Result<Option<i32>> {
        let _statement = accessor.statements().prepare(SELECT_LIST_LAST_INDEX, ReuseProbability::High);
        let last = accessor.rows().list_last_index(key)?;
        if last.is_none() {
            trace!(id = %key.id, feature = self.feature.0, "no last index, list is empty");
        }
        Ok(last)
    }
}
