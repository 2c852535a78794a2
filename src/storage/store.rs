//! Repository store
//!
//! [`Store`] owns the backing rows and the statement cache. Every request that
//! touches persistent data works through a [`StoreAccessor`] obtained from it;
//! the accessor is released when it goes out of scope.

use crate::core::config::RepositoryConfig;
use crate::storage::accessor::StoreAccessor;
use crate::storage::backend::{MemoryRowStore, RowStore};
use crate::storage::statement::StatementCache;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

pub(crate) struct StoreInner {
    pub(crate) name: String,
    pub(crate) rows: Arc<dyn RowStore>,
    pub(crate) statements: StatementCache,
    pub(crate) default_list_chunk: i32,
    pub(crate) active_accessors: AtomicUsize,
}

/// Shared handle on the repository's backing store
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create a store over `rows`
    pub fn new(rows: Arc<dyn RowStore>, config: &RepositoryConfig) -> Self {
        info!(
            repository = %config.name,
            statement_cache = config.statement_cache_capacity,
            list_chunk = config.default_list_chunk,
            "opening store"
        );
        Self {
            inner: Arc::new(StoreInner {
                name: config.name.clone(),
                rows,
                statements: StatementCache::new(config.statement_cache_capacity),
                default_list_chunk: config.default_list_chunk,
                active_accessors: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a store over a fresh in-memory row store, returning both
    pub fn in_memory(config: &RepositoryConfig) -> (Self, Arc<MemoryRowStore>) {
        let rows = Arc::new(MemoryRowStore::new());
        (Self::new(rows.clone(), config), rows)
    }

    /// Repository name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Acquire an accessor for one request
    pub fn accessor(&self) -> StoreAccessor {
        self.inner.active_accessors.fetch_add(1, Ordering::SeqCst);
        StoreAccessor::new(self.inner.clone())
    }

    /// Accessors currently held
    pub fn active_accessors(&self) -> usize {
        self.inner.active_accessors.load(Ordering::SeqCst)
    }

    /// Statement cache shared by all accessors
    pub fn statement_cache(&self) -> &StatementCache {
        &self.inner.statements
    }

    /// List chunk size used when a request does not name one
    pub fn default_list_chunk(&self) -> i32 {
        self.inner.default_list_chunk
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("active_accessors", &self.active_accessors())
            .finish()
    }
}
