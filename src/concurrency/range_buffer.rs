use std::mem;

use crate::concurrency::concurrent_tree::LockType;
use crate::concurrency::keyrange::{Key, KeyRange};

/// One recorded lock: the range and whether it was taken for reading or writing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeRecord {
    pub range: KeyRange,
    pub lock_type: LockType,
}

impl RangeRecord {
    pub fn memory_size(&self) -> usize {
        mem::size_of::<RangeRecord>()
            + self.range.left().memory_size()
            + self.range.right().memory_size()
    }
}

/// Append-only, ordered list of ranges.
///
/// Transactions keep one per locktree as their inventory of acquired locks, and
/// a locktree keeps one for the single txnid optimization.
#[derive(Clone, Debug, Default)]
pub struct RangeBuffer {
    records: Vec<RangeRecord>,
    total_memory_size: usize,
}

impl RangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, left: Key, right: Key, lock_type: LockType) {
        self.append_range(KeyRange::new(left, right), lock_type);
    }

    pub fn append_range(&mut self, range: KeyRange, lock_type: LockType) {
        let record = RangeRecord { range, lock_type };
        self.total_memory_size += record.memory_size();
        self.records.push(record);
    }

    pub fn get_num_ranges(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes of lock memory the buffered ranges account for.
    pub fn total_memory_size(&self) -> usize {
        self.total_memory_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &RangeRecord> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.total_memory_size = 0;
    }

    /// Empties the buffer, handing back its records in append order.
    pub fn take_records(&mut self) -> Vec<RangeRecord> {
        self.total_memory_size = 0;
        mem::take(&mut self.records)
    }
}
