//! Prepared statement cache
//!
//! Every store operation runs through a statement handle obtained from the
//! cache. Handles are RAII guards: dropping one releases the statement, so a
//! failing operation can never leak it. The reuse hint decides whether an idle
//! statement stays prepared.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// Statement text: revision row by timestamp
pub const SELECT_REVISION: &str = "SELECT revision WHERE id = ? AND branch = ? AND valid_at(?)";
/// Statement text: revision row by version
pub const SELECT_REVISION_VERSION: &str = "SELECT revision WHERE id = ? AND branch = ? AND version = ?";
/// Statement text: head version of an object
pub const SELECT_HEAD_VERSION: &str = "SELECT MAX(version) WHERE id = ? AND branch = ?";
/// Statement text: new revision row
pub const INSERT_REVISION: &str = "INSERT revision";
/// Statement text: close a revision's validity window
pub const UPDATE_REVISED: &str = "UPDATE revision SET revised = ? WHERE id = ? AND branch = ? AND version = ?";
/// Statement text: drop a revision row and its list rows
pub const DELETE_REVISION: &str = "DELETE revision, list WHERE id = ? AND branch = ? AND version = ?";
/// Statement text: last list index
pub const SELECT_LIST_LAST_INDEX: &str = "SELECT MAX(idx) FROM list WHERE key = ?";
/// Statement text: list rows in index order
pub const SELECT_LIST_CHUNKS: &str = "SELECT value FROM list WHERE key = ? ORDER BY idx";
/// Statement text: list rows restricted to index ranges
pub const SELECT_LIST_CHUNKS_FILTERED: &str = "SELECT value FROM list WHERE key = ? AND idx IN ranges ORDER BY idx";
/// Statement text: new list row
pub const INSERT_LIST_ENTRY: &str = "INSERT list (key, idx, value)";

/// How likely a statement is to be executed again soon
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReuseProbability {
    /// Discarded as soon as it is released
    Low,
    /// Kept while there is room
    Medium,
    /// Kept, evicted only before `Max` statements
    High,
    /// Never evicted
    Max,
}

#[derive(Debug)]
struct CachedStatement {
    probability: ReuseProbability,
    in_use: usize,
    executions: u64,
}

/// Cache of prepared statements shared by all accessors of one store
#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    statements: Mutex<HashMap<&'static str, CachedStatement>>,
    outstanding: AtomicUsize,
    prepared: AtomicU64,
    reused: AtomicU64,
}

impl StatementCache {
    /// Create a cache keeping at most `capacity` idle statements
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            statements: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            prepared: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Obtain a statement handle, preparing the statement if it is not cached
    pub fn prepare(&self, sql: &'static str, probability: ReuseProbability) -> StatementGuard<'_> {
        let mut statements = self.statements.lock();
        let statement = statements.entry(sql).or_insert_with(|| {
            self.prepared.fetch_add(1, Ordering::Relaxed);
            trace!(sql, ?probability, "preparing statement");
            CachedStatement { probability, in_use: 0, executions: 0 }
        });
        if statement.executions > 0 || statement.in_use > 0 {
            self.reused.fetch_add(1, Ordering::Relaxed);
        }
        statement.probability = statement.probability.max(probability);
        statement.in_use += 1;
        statement.executions += 1;
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        StatementGuard { cache: self, sql, probability }
    }

    fn release(&self, sql: &'static str, probability: ReuseProbability) {
        let mut statements = self.statements.lock();
        let idle = match statements.get_mut(sql) {
            Some(statement) => {
                statement.in_use = statement.in_use.saturating_sub(1);
                statement.in_use == 0
            }
            None => false,
        };
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        if idle && probability == ReuseProbability::Low {
            statements.remove(sql);
            return;
        }

        while statements.len() > self.capacity {
            let victim = statements
                .iter()
                .filter(|(_, s)| s.in_use == 0 && s.probability < ReuseProbability::Max)
                .min_by_key(|(_, s)| (s.probability, s.executions))
                .map(|(sql, _)| *sql);
            match victim {
                Some(sql) => {
                    statements.remove(sql);
                }
                None => break,
            }
        }
    }

    /// Statement handles currently held
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Statements currently prepared
    pub fn cached(&self) -> usize {
        self.statements.lock().len()
    }

    /// Total number of preparations
    pub fn prepared_count(&self) -> u64 {
        self.prepared.load(Ordering::Relaxed)
    }

    /// Total number of handles served from an already prepared statement
    pub fn reused_count(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

/// Handle on a prepared statement; released on drop
#[derive(Debug)]
pub struct StatementGuard<'a> {
    cache: &'a StatementCache,
    sql: &'static str,
    probability: ReuseProbability,
}

impl StatementGuard<'_> {
    /// Statement text
    pub fn sql(&self) -> &'static str {
        self.sql
    }
}

impl Drop for StatementGuard<'_> {
    fn drop(&mut self) {
        self.cache.release(self.sql, self.probability);
    }
}
