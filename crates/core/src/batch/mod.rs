//! Persistent batch orchestration.
//!
//! - [`SlotTable`]: fixed-capacity request slots with struct-of-arrays
//!   token and sampling storage
//! - [`BatchUpdate`] / [`BatchUpdateBuilder`]: the per-step structural diff
//!   replayed by every stateful per-request component
//! - [`InputBatch`]: the step-scoped view handed to the model executor
//! - [`SharedBatch`]: the single lock around the slot table and its
//!   pending update, shared with the admission path

mod input_batch;
mod shared;
mod slot_table;
mod update;

pub use input_batch::{InputBatch, RequestHistory, ScheduledRequest};
pub use shared::{SharedBatch, StepSnapshot};
pub use slot_table::{SlotTable, StructuralChanges};
pub use update::{
    AddedRequest, BatchUpdate, BatchUpdateBuilder, MoveDirectionality, MovedRequest,
};

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::Serialize;

/// Position in the fixed-size slot table.
///
/// Every slot-indexed array is accessed through this type so a request
/// position can never be confused with a position in the step's request
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-slot array indexed only by [`SlotIndex`].
#[derive(Debug, Clone)]
pub struct SlotArray<T> {
    values: Vec<T>,
}

impl<T: Clone> SlotArray<T> {
    pub fn filled(capacity: usize, value: T) -> Self {
        Self {
            values: vec![value; capacity],
        }
    }

    /// Gather values into step order.
    pub fn gather(&self, indices: &[SlotIndex]) -> Vec<T> {
        indices.iter().map(|&i| self.values[i.0].clone()).collect()
    }
}

impl<T> SlotArray<T> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn swap(&mut self, a: SlotIndex, b: SlotIndex) {
        self.values.swap(a.0, b.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, &T)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (SlotIndex(i), v))
    }
}

impl<T> Index<SlotIndex> for SlotArray<T> {
    type Output = T;

    fn index(&self, index: SlotIndex) -> &T {
        &self.values[index.0]
    }
}

impl<T> IndexMut<SlotIndex> for SlotArray<T> {
    fn index_mut(&mut self, index: SlotIndex) -> &mut T {
        &mut self.values[index.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_array_gather_follows_step_order() {
        let mut arr = SlotArray::filled(4, 0u32);
        arr[SlotIndex::new(0)] = 10;
        arr[SlotIndex::new(2)] = 30;
        arr[SlotIndex::new(3)] = 40;
        let gathered = arr.gather(&[SlotIndex::new(3), SlotIndex::new(0), SlotIndex::new(2)]);
        assert_eq!(gathered, vec![40, 10, 30]);
    }

    #[test]
    fn slot_array_swap() {
        let mut arr = SlotArray::filled(2, 'a');
        arr[SlotIndex::new(1)] = 'b';
        arr.swap(SlotIndex::new(0), SlotIndex::new(1));
        assert_eq!(arr[SlotIndex::new(0)], 'b');
        assert_eq!(arr[SlotIndex::new(1)], 'a');
    }

    #[test]
    fn slot_index_display() {
        assert_eq!(SlotIndex::new(7).to_string(), "7");
        assert_eq!(SlotIndex::new(7).get(), 7);
    }
}
