use std::cmp::Ordering;
use std::fmt;
use std::mem;

use parking_lot::{Mutex, MutexGuard};

use crate::common::config::TxnId;
use crate::concurrency::keyrange::{Comparator, KeyRange};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
}

impl LockType {
    pub fn is_write(self) -> bool {
        self == LockType::Write
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "R"),
            LockType::Write => write!(f, "W"),
        }
    }
}

/// A granted range lock owned by one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowLock {
    pub range: KeyRange,
    pub txnid: TxnId,
    pub lock_type: LockType,
}

impl RowLock {
    pub fn new(range: KeyRange, txnid: TxnId, lock_type: LockType) -> Self {
        Self {
            range,
            txnid,
            lock_type,
        }
    }

    /// Bytes charged against the lock memory budget while this lock is stored.
    pub fn memory_size(&self) -> usize {
        mem::size_of::<RowLock>()
            + self.range.left().memory_size()
            + self.range.right().memory_size()
    }

    /// True if a request of `lock_type` by `txnid` over `range` may not coexist
    /// with this lock. A transaction never conflicts with itself, and two reads
    /// never conflict.
    pub fn conflicts_with(
        &self,
        cmp: &Comparator,
        txnid: TxnId,
        lock_type: LockType,
        range: &KeyRange,
    ) -> bool {
        self.txnid != txnid
            && (lock_type.is_write() || self.lock_type.is_write())
            && self.range.overlaps(cmp, range)
    }
}

struct TreeRoot {
    cmp: Comparator,
    // Sorted by left endpoint; equal left endpoints keep insertion order.
    locks: Vec<RowLock>,
}

impl TreeRoot {
    /// Index one past the last lock whose left endpoint is <= `range.right`.
    /// No lock at or after this index can overlap `range`.
    fn upper_bound(&self, range: &KeyRange) -> usize {
        self.locks.partition_point(|lock| {
            self.cmp.compare(lock.range.left(), range.right()) != Ordering::Greater
        })
    }

    fn sort(&mut self) {
        let cmp = self.cmp.clone();
        self.locks
            .sort_by(|a, b| cmp.compare(a.range.left(), b.range.left()));
    }
}

/// Ordered interval container mapping key ranges to the transactions locking them.
///
/// Overlapping ranges are allowed (for example, read locks of different
/// transactions). Every access goes through a [`LockedKeyrange`], which holds the
/// container's root latch for its lifetime, so structural changes made through
/// one handle are never interleaved with another handle's reads or writes.
pub struct ConcurrentTree {
    root: Mutex<TreeRoot>,
}

impl ConcurrentTree {
    pub fn new(cmp: Comparator) -> Self {
        Self {
            root: Mutex::new(TreeRoot {
                cmp,
                locks: Vec::new(),
            }),
        }
    }

    /// Latches the container and returns a handle for operating on it.
    pub fn prepare(&self) -> LockedKeyrange<'_> {
        LockedKeyrange {
            root: self.root.lock(),
        }
    }
}

impl fmt::Debug for ConcurrentTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.root.lock();
        f.debug_struct("ConcurrentTree")
            .field("num_locks", &root.locks.len())
            .finish()
    }
}

/// Exclusive handle on a [`ConcurrentTree`]; released on drop.
pub struct LockedKeyrange<'a> {
    root: MutexGuard<'a, TreeRoot>,
}

impl LockedKeyrange<'_> {
    pub fn comparator(&self) -> &Comparator {
        &self.root.cmp
    }

    /// Replaces the comparator and re-sorts the stored locks under it.
    pub fn set_comparator(&mut self, cmp: Comparator) {
        self.root.cmp = cmp;
        self.root.sort();
    }

    pub fn is_empty(&self) -> bool {
        self.root.locks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.root.locks.len()
    }

    /// Calls `f` on every lock overlapping `range`, in key order, until `f`
    /// returns false.
    pub fn iterate_overlapping<F: FnMut(&RowLock) -> bool>(&self, range: &KeyRange, mut f: F) {
        let end = self.root.upper_bound(range);
        let cmp = &self.root.cmp;
        for lock in &self.root.locks[..end] {
            if cmp.compare(lock.range.right(), range.left()) == Ordering::Less {
                continue;
            }
            if !f(lock) {
                break;
            }
        }
    }

    pub fn collect_overlapping(&self, range: &KeyRange) -> Vec<RowLock> {
        let mut out = Vec::new();
        self.iterate_overlapping(range, |lock| {
            out.push(lock.clone());
            true
        });
        out
    }

    /// Calls `f` on every lock in key order until `f` returns false.
    pub fn iterate_all<F: FnMut(&RowLock) -> bool>(&self, mut f: F) {
        for lock in &self.root.locks {
            if !f(lock) {
                break;
            }
        }
    }

    pub fn insert(&mut self, lock: RowLock) {
        let root = &mut *self.root;
        let cmp = &root.cmp;
        let idx = root.locks.partition_point(|l| {
            cmp.compare(l.range.left(), lock.range.left()) != Ordering::Greater
        });
        root.locks.insert(idx, lock);
    }

    /// Removes the lock equal to `lock` (same range under the comparator, owner
    /// and type). Returns false if no such lock is stored.
    pub fn remove(&mut self, lock: &RowLock) -> bool {
        let root = &mut *self.root;
        let end = root.upper_bound(&lock.range);
        let cmp = &root.cmp;
        let found = root.locks[..end].iter().position(|l| {
            l.txnid == lock.txnid
                && l.lock_type == lock.lock_type
                && cmp.compare(l.range.left(), lock.range.left()) == Ordering::Equal
                && cmp.compare(l.range.right(), lock.range.right()) == Ordering::Equal
        });
        match found {
            Some(idx) => {
                root.locks.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Removes and returns every lock held by `txnid` that overlaps `range`.
    pub fn remove_overlapping_for_txnid(&mut self, txnid: TxnId, range: &KeyRange) -> Vec<RowLock> {
        let root = &mut *self.root;
        let end = root.upper_bound(range);
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(root.locks.len());
        for (i, lock) in mem::take(&mut root.locks).into_iter().enumerate() {
            if i < end && lock.txnid == txnid && lock.range.overlaps(&root.cmp, range) {
                removed.push(lock);
            } else {
                kept.push(lock);
            }
        }
        root.locks = kept;
        removed
    }

    /// Removes and returns every lock held by `txnid`, in key order.
    pub fn remove_all_for_txnid(&mut self, txnid: TxnId) -> Vec<RowLock> {
        let (removed, kept): (Vec<RowLock>, Vec<RowLock>) = mem::take(&mut self.root.locks)
            .into_iter()
            .partition(|lock| lock.txnid == txnid);
        self.root.locks = kept;
        removed
    }

    /// Distinct owners of the stored locks, ascending.
    pub fn txnids(&self) -> Vec<TxnId> {
        let mut txnids: Vec<TxnId> = self.root.locks.iter().map(|l| l.txnid).collect();
        txnids.sort_unstable();
        txnids.dedup();
        txnids
    }
}
