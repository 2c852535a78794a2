//! List chunks

use crate::core::types::Value;

/// Contiguous range `[start_index, start_index + size)` of a list feature.
///
/// Slots start out as [`Value::Uninitialized`] and are filled by the chunk reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    start_index: i32,
    values: Vec<Value>,
}

impl Chunk {
    /// Empty chunk of `size` slots starting at list index `start_index`
    pub fn new(start_index: i32, size: usize) -> Self {
        Self {
            start_index,
            values: vec![Value::Uninitialized; size],
        }
    }

    /// First list index covered
    pub fn start_index(&self) -> i32 {
        self.start_index
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// List index one past the last covered slot
    pub fn end_index(&self) -> i32 {
        self.start_index + self.values.len() as i32
    }

    /// Fill the slot at `index_in_chunk`
    pub fn add(&mut self, index_in_chunk: usize, value: Value) {
        self.values[index_in_chunk] = value;
    }

    /// Value at `index_in_chunk`
    pub fn get(&self, index_in_chunk: usize) -> Option<&Value> {
        self.values.get(index_in_chunk)
    }

    /// Whether every slot has been filled
    pub fn is_complete(&self) -> bool {
        !self.values.iter().any(Value::is_uninitialized)
    }

    /// Slot contents in list order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Take the slot contents
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
