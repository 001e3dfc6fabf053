use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::config::{DictionaryId, LocktreeConfig, TxnId, TXNID_NONE};
use crate::common::exception::LockError;
use crate::concurrency::concurrent_tree::{ConcurrentTree, LockType, LockedKeyrange, RowLock};
use crate::concurrency::keyrange::{Comparator, Key, KeyRange};
use crate::concurrency::lock_request::LockRequestInfo;
use crate::concurrency::locktree_manager::{LocktreeManager, MemoryTracker};
use crate::concurrency::range_buffer::{RangeBuffer, RangeRecord};
use crate::concurrency::txnid_set::TxnidSet;

/// Range locks for one dictionary.
///
/// Read locks of different transactions may overlap; a write lock excludes every
/// other transaction's overlapping lock. A transaction never conflicts with
/// itself.
///
/// # Single txnid optimization
/// While exactly one transaction uses an otherwise empty locktree, its ranges are
/// appended to a flat buffer instead of the interval container, and releasing
/// them drops the buffer. The first request from a different transaction, or a
/// buffer that grows past its limit, migrates the buffer into the container
/// ("ending early") and zeroes the score; the optimization is only tried again
/// once enough container-path releases have raised the score back to the
/// threshold.
///
/// Lock order: the container latch (a [`LockedKeyrange`]) is always taken before
/// the single txnid buffer, and the pending-request mutex before either.
pub struct Locktree {
    dict_id: DictionaryId,
    reference_count: AtomicU32,
    rangetree: ConcurrentTree,

    // Only touched while the container latch is held.
    sto_buffer: Mutex<RangeBuffer>,
    // Written under the container latch; read without it for fast probes.
    sto_txnid: AtomicU64,
    sto_score: AtomicU64,
    sto_end_early_count: AtomicU64,
    sto_end_early_time_us: AtomicU64,
    sto_enabled: bool,
    sto_buffer_max_size: usize,
    sto_score_threshold: u64,

    lock_request_info: LockRequestInfo,
    mem_tracker: Option<Arc<MemoryTracker>>,
    mgr: Weak<LocktreeManager>,
    userdata: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Locktree {
    /// Creates a standalone locktree with default tuning and no manager: no
    /// memory accounting and no escalation on memory pressure.
    pub fn new(dict_id: DictionaryId, cmp: Comparator) -> Self {
        Self::with_config(dict_id, cmp, &LocktreeConfig::default())
    }

    pub fn with_config(dict_id: DictionaryId, cmp: Comparator, config: &LocktreeConfig) -> Self {
        Self::create(dict_id, cmp, config, Weak::new(), None)
    }

    pub(crate) fn create(
        dict_id: DictionaryId,
        cmp: Comparator,
        config: &LocktreeConfig,
        mgr: Weak<LocktreeManager>,
        mem_tracker: Option<Arc<MemoryTracker>>,
    ) -> Self {
        Self {
            dict_id,
            reference_count: AtomicU32::new(1),
            rangetree: ConcurrentTree::new(cmp),
            sto_buffer: Mutex::new(RangeBuffer::new()),
            sto_txnid: AtomicU64::new(TXNID_NONE),
            // Start eligible so an idle dictionary gets the fast path immediately.
            sto_score: AtomicU64::new(config.sto_score_threshold),
            sto_end_early_count: AtomicU64::new(0),
            sto_end_early_time_us: AtomicU64::new(0),
            sto_enabled: config.sto_enabled,
            sto_buffer_max_size: config.sto_buffer_max_size,
            sto_score_threshold: config.sto_score_threshold,
            lock_request_info: LockRequestInfo::new(config.long_wait_threshold_us),
            mem_tracker,
            mgr,
            userdata: Mutex::new(None),
        }
    }

    pub fn get_dict_id(&self) -> DictionaryId {
        self.dict_id
    }

    pub fn get_comparator(&self) -> Comparator {
        self.rangetree.prepare().comparator().clone()
    }

    /// Installs a new comparator, e.g. after the dictionary's descriptor changed.
    pub fn set_comparator(&self, cmp: Comparator) {
        self.rangetree.prepare().set_comparator(cmp);
    }

    pub fn set_userdata(&self, userdata: Option<Arc<dyn Any + Send + Sync>>) {
        *self.userdata.lock() = userdata;
    }

    pub fn get_userdata(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.userdata.lock().clone()
    }

    pub fn get_lock_request_info(&self) -> &LockRequestInfo {
        &self.lock_request_info
    }

    pub(crate) fn add_reference(&self) -> u32 {
        self.reference_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops one reference and returns the remaining count.
    pub(crate) fn release_reference(&self) -> u32 {
        let previous = self.reference_count.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "locktree {} released too many times", self.dict_id);
        previous - 1
    }

    pub fn get_reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::SeqCst)
    }

    /// Acquires a read lock on `[left, right]` for `txnid`.
    ///
    /// On `Err(LockError::NotGranted)` every transaction holding a conflicting
    /// lock is added to `conflicts`. `big_txn` applies the stricter half-budget
    /// memory check.
    pub fn acquire_read_lock(
        &self,
        txnid: TxnId,
        left: &Key,
        right: &Key,
        conflicts: &mut TxnidSet,
        big_txn: bool,
    ) -> Result<(), LockError> {
        self.try_acquire_lock(LockType::Read, txnid, left, right, conflicts, big_txn)
    }

    /// Acquires a write lock on `[left, right]` for `txnid`. See
    /// [`Locktree::acquire_read_lock`].
    pub fn acquire_write_lock(
        &self,
        txnid: TxnId,
        left: &Key,
        right: &Key,
        conflicts: &mut TxnidSet,
        big_txn: bool,
    ) -> Result<(), LockError> {
        self.try_acquire_lock(LockType::Write, txnid, left, right, conflicts, big_txn)
    }

    pub(crate) fn try_acquire_lock(
        &self,
        lock_type: LockType,
        txnid: TxnId,
        left: &Key,
        right: &Key,
        conflicts: &mut TxnidSet,
        big_txn: bool,
    ) -> Result<(), LockError> {
        assert_ne!(txnid, TXNID_NONE, "locks cannot be owned by TXNID_NONE");
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.check_current_lock_constraints(big_txn)?;
        }
        self.acquire_lock(lock_type, txnid, KeyRange::new(left.clone(), right.clone()), conflicts)
    }

    fn acquire_lock(
        &self,
        lock_type: LockType,
        txnid: TxnId,
        range: KeyRange,
        conflicts: &mut TxnidSet,
    ) -> Result<(), LockError> {
        // Preparing the container is the serialization point, so try the
        // single txnid optimization first.
        let mut lkr = self.rangetree.prepare();
        debug_assert!(
            range.is_valid(lkr.comparator()),
            "left endpoint sorts after right endpoint in {:?}",
            range
        );
        match self.sto_try_acquire(&mut lkr, txnid, range, lock_type) {
            Ok(()) => Ok(()),
            Err(range) => {
                self.acquire_lock_consolidated(&mut lkr, txnid, range, lock_type, Some(conflicts))
            }
        }
    }

    /// Inserts `range` into the container unless another transaction holds a
    /// conflicting lock. Overlapping locks of the same txnid and type are merged
    /// into a single dominating lock.
    fn acquire_lock_consolidated(
        &self,
        lkr: &mut LockedKeyrange<'_>,
        txnid: TxnId,
        mut range: KeyRange,
        lock_type: LockType,
        mut conflicts: Option<&mut TxnidSet>,
    ) -> Result<(), LockError> {
        let cmp = lkr.comparator().clone();
        let overlapping = lkr.collect_overlapping(&range);

        let mut conflicts_exist = false;
        for lock in &overlapping {
            if lock.conflicts_with(&cmp, txnid, lock_type, &range) {
                conflicts_exist = true;
                if let Some(conflicts) = conflicts.as_mut() {
                    conflicts.add(lock.txnid);
                }
            }
        }
        if conflicts_exist {
            return Err(LockError::NotGranted);
        }

        for lock in overlapping
            .into_iter()
            .filter(|l| l.txnid == txnid && l.lock_type == lock_type)
        {
            range.extend(&cmp, &lock.range);
            self.remove_row_lock_from_tree(lkr, &lock);
        }
        self.insert_row_lock_into_tree(lkr, RowLock::new(range, txnid, lock_type));
        Ok(())
    }

    fn insert_row_lock_into_tree(&self, lkr: &mut LockedKeyrange<'_>, lock: RowLock) {
        trace!(
            "locktree {}: insert {} lock {:?} for txn {}",
            self.dict_id,
            lock.lock_type,
            lock.range,
            lock.txnid
        );
        self.note_mem_used(lock.memory_size() as u64);
        lkr.insert(lock);
    }

    fn remove_row_lock_from_tree(&self, lkr: &mut LockedKeyrange<'_>, lock: &RowLock) {
        if lkr.remove(lock) {
            self.note_mem_released(lock.memory_size() as u64);
        }
    }

    /// Releases every lock `txnid` holds in the ranges recorded in `ranges`.
    pub fn release_locks(&self, txnid: TxnId, ranges: &RangeBuffer) {
        // With the single txnid optimization active for this txnid, dropping the
        // buffer releases everything at once.
        if self.sto_try_release(txnid) {
            return;
        }

        let mut lkr = self.rangetree.prepare();
        for record in ranges.iter() {
            for lock in lkr.remove_overlapping_for_txnid(txnid, &record.range) {
                trace!(
                    "locktree {}: release {} lock {:?} for txn {}",
                    self.dict_id,
                    lock.lock_type,
                    lock.range,
                    txnid
                );
                self.note_mem_released(lock.memory_size() as u64);
            }
        }
        drop(lkr);

        // Smooth releases slowly earn back eligibility for the optimization.
        let _ = self
            .sto_score
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |score| {
                (score < self.sto_score_threshold).then_some(score + 1)
            });
    }

    /// Adds to `conflicts` every other transaction whose held lock would
    /// conflict with a request of the given kind over `[left, right]`.
    /// Nothing is acquired.
    pub fn get_conflicts(
        &self,
        is_write_request: bool,
        txnid: TxnId,
        left: &Key,
        right: &Key,
        conflicts: &mut TxnidSet,
    ) {
        let lock_type = if is_write_request {
            LockType::Write
        } else {
            LockType::Read
        };
        let range = KeyRange::new(left.clone(), right.clone());
        let lkr = self.rangetree.prepare();
        let cmp = lkr.comparator();
        lkr.iterate_overlapping(&range, |lock| {
            if lock.conflicts_with(cmp, txnid, lock_type, &range) {
                conflicts.add(lock.txnid);
            }
            true
        });

        let sto_txnid = self.sto_txnid.load(Ordering::SeqCst);
        if sto_txnid != TXNID_NONE && sto_txnid != txnid {
            let buffer = self.sto_buffer.lock();
            let buffered_conflict = buffer.iter().any(|record| {
                (is_write_request || record.lock_type.is_write())
                    && record.range.overlaps(cmp, &range)
            });
            if buffered_conflict {
                conflicts.add(sto_txnid);
            }
        }
    }

    /// Coarsens each transaction's locks into fewer, larger ranges to shrink
    /// lock memory.
    ///
    /// Per transaction and lock type, locks are merged in key order as long as
    /// the merged range does not conflict with any other transaction's lock, so
    /// every request denied before escalation is still denied after it, and
    /// nothing granted is revoked. `after_escalate` is then called once per
    /// transaction with its new set of ranges, after the container latch has
    /// been released.
    pub fn escalate<F>(&self, mut after_escalate: F)
    where
        F: FnMut(TxnId, &Locktree, &RangeBuffer),
    {
        let mut escalated: Vec<(TxnId, RangeBuffer)> = Vec::new();
        let (locks_before, locks_after) = {
            let mut lkr = self.rangetree.prepare();
            {
                let mut buffer = self.sto_buffer.lock();
                if self.sto_txnid.load(Ordering::SeqCst) != TXNID_NONE {
                    // Escalation needs everything in the container; its time is
                    // accounted as escalation, not as an early end.
                    self.sto_end_early_no_accounting(&mut lkr, &mut buffer);
                }
            }

            let locks_before = lkr.len();
            let cmp = lkr.comparator().clone();
            for txnid in lkr.txnids() {
                let owned = lkr.remove_all_for_txnid(txnid);
                let freed: usize = owned.iter().map(RowLock::memory_size).sum();
                self.note_mem_released(freed as u64);

                let mut reads: Vec<RowLock> = Vec::new();
                let mut writes: Vec<RowLock> = Vec::new();
                for lock in owned {
                    let runs = match lock.lock_type {
                        LockType::Read => &mut reads,
                        LockType::Write => &mut writes,
                    };
                    if let Some(last) = runs.last_mut() {
                        let mut candidate = last.range.clone();
                        candidate.extend(&cmp, &lock.range);
                        if !Self::conflicts_with_others(&lkr, txnid, lock.lock_type, &candidate) {
                            last.range = candidate;
                            continue;
                        }
                    }
                    runs.push(lock);
                }

                let mut merged: Vec<RowLock> = writes.into_iter().chain(reads).collect();
                merged.sort_by(|a, b| cmp.compare(a.range.left(), b.range.left()));
                let mut ranges = RangeBuffer::new();
                for lock in merged {
                    ranges.append_range(lock.range.clone(), lock.lock_type);
                    self.insert_row_lock_into_tree(&mut lkr, lock);
                }
                escalated.push((txnid, ranges));
            }
            (locks_before, lkr.len())
        };

        debug!(
            "locktree {}: escalated {} row locks into {} for {} transactions",
            self.dict_id,
            locks_before,
            locks_after,
            escalated.len()
        );
        for (txnid, ranges) in &escalated {
            after_escalate(*txnid, self, ranges);
        }
    }

    fn conflicts_with_others(
        lkr: &LockedKeyrange<'_>,
        txnid: TxnId,
        lock_type: LockType,
        range: &KeyRange,
    ) -> bool {
        let cmp = lkr.comparator();
        let mut conflict = false;
        lkr.iterate_overlapping(range, |lock| {
            conflict = lock.conflicts_with(cmp, txnid, lock_type, range);
            !conflict
        });
        conflict
    }

    /// Every lock currently held, including ranges still in the single txnid
    /// buffer, in container order followed by buffer order.
    pub fn dump_locks(&self) -> Vec<RowLock> {
        let lkr = self.rangetree.prepare();
        let mut locks = Vec::with_capacity(lkr.len());
        lkr.iterate_all(|lock| {
            locks.push(lock.clone());
            true
        });
        let sto_txnid = self.sto_txnid.load(Ordering::SeqCst);
        if sto_txnid != TXNID_NONE {
            let buffer = self.sto_buffer.lock();
            locks.extend(
                buffer
                    .iter()
                    .map(|r| RowLock::new(r.range.clone(), sto_txnid, r.lock_type)),
            );
        }
        locks
    }

    /// Number of locks stored in the interval container (excluding the single
    /// txnid buffer).
    pub fn num_row_locks(&self) -> usize {
        self.rangetree.prepare().len()
    }

    pub fn sto_buffer_num_ranges(&self) -> usize {
        let _lkr = self.rangetree.prepare();
        self.sto_buffer.lock().get_num_ranges()
    }

    /// Owner of the single txnid buffer, or `TXNID_NONE`. Racy by nature.
    pub fn sto_txnid(&self) -> TxnId {
        self.sto_txnid.load(Ordering::Relaxed)
    }

    pub fn sto_txnid_is_valid_unsafe(&self) -> bool {
        self.sto_txnid() != TXNID_NONE
    }

    pub fn sto_score(&self) -> u64 {
        self.sto_score.load(Ordering::Relaxed)
    }

    pub fn get_sto_end_early_count(&self) -> u64 {
        self.sto_end_early_count.load(Ordering::Relaxed)
    }

    pub fn get_sto_end_early_time_us(&self) -> u64 {
        self.sto_end_early_time_us.load(Ordering::Relaxed)
    }

    /// Tries to satisfy the request from the single txnid buffer. Gives the
    /// range back if the request must go through the container instead.
    fn sto_try_acquire(
        &self,
        lkr: &mut LockedKeyrange<'_>,
        txnid: TxnId,
        range: KeyRange,
        lock_type: LockType,
    ) -> Result<(), KeyRange> {
        let mut buffer = self.sto_buffer.lock();
        let sto_txnid = self.sto_txnid.load(Ordering::SeqCst);
        if self.sto_enabled
            && sto_txnid == TXNID_NONE
            && lkr.is_empty()
            && buffer.is_empty()
            && self.sto_score.load(Ordering::SeqCst) >= self.sto_score_threshold
        {
            self.sto_begin(txnid);
        } else if sto_txnid != TXNID_NONE
            && (sto_txnid != txnid || buffer.get_num_ranges() >= self.sto_buffer_max_size)
        {
            self.sto_end_early(lkr, &mut buffer);
        }

        let sto_txnid = self.sto_txnid.load(Ordering::SeqCst);
        if sto_txnid == TXNID_NONE {
            debug_assert!(buffer.is_empty());
            return Err(range);
        }
        assert_eq!(sto_txnid, txnid, "single txnid buffer owned by another txn");
        self.sto_append(&mut buffer, range, lock_type);
        Ok(())
    }

    fn sto_begin(&self, txnid: TxnId) {
        debug!("locktree {}: single txnid optimization begins for txn {}", self.dict_id, txnid);
        self.sto_txnid.store(txnid, Ordering::SeqCst);
    }

    fn sto_append(&self, buffer: &mut RangeBuffer, range: KeyRange, lock_type: LockType) {
        let before = buffer.total_memory_size();
        buffer.append_range(range, lock_type);
        self.note_mem_used((buffer.total_memory_size() - before) as u64);
    }

    fn sto_end(&self, buffer: &mut RangeBuffer) {
        let mem_size = buffer.total_memory_size();
        buffer.clear();
        self.note_mem_released(mem_size as u64);
        self.sto_txnid.store(TXNID_NONE, Ordering::SeqCst);
    }

    fn sto_end_early(&self, lkr: &mut LockedKeyrange<'_>, buffer: &mut RangeBuffer) {
        let start = Instant::now();
        self.sto_end_early_no_accounting(lkr, buffer);
        self.sto_end_early_count.fetch_add(1, Ordering::Relaxed);
        self.sto_end_early_time_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    fn sto_end_early_no_accounting(&self, lkr: &mut LockedKeyrange<'_>, buffer: &mut RangeBuffer) {
        let txnid = self.sto_txnid.load(Ordering::SeqCst);
        debug!(
            "locktree {}: single txnid optimization for txn {} ends early, migrating {} ranges",
            self.dict_id,
            txnid,
            buffer.get_num_ranges()
        );
        let mem_size = buffer.total_memory_size();
        self.sto_migrate_buffer_ranges_to_tree(lkr, buffer.take_records(), txnid);
        self.note_mem_released(mem_size as u64);
        self.sto_txnid.store(TXNID_NONE, Ordering::SeqCst);
        self.sto_score.store(0, Ordering::SeqCst);
    }

    fn sto_migrate_buffer_ranges_to_tree(
        &self,
        lkr: &mut LockedKeyrange<'_>,
        records: Vec<RangeRecord>,
        txnid: TxnId,
    ) {
        debug_assert!(lkr.is_empty(), "container must be empty while the buffer is in use");
        for record in records {
            // Only one txnid owns the container at this point, so nothing conflicts.
            let migrated =
                self.acquire_lock_consolidated(lkr, txnid, record.range, record.lock_type, None);
            debug_assert!(migrated.is_ok());
        }
    }

    fn sto_try_release(&self, txnid: TxnId) -> bool {
        if self.sto_txnid.load(Ordering::SeqCst) == TXNID_NONE {
            return false;
        }
        // Check again under the latch, which protects the optimization state.
        let lkr = self.rangetree.prepare();
        let mut buffer = self.sto_buffer.lock();
        if self.sto_txnid.load(Ordering::SeqCst) != txnid {
            return false;
        }
        debug_assert!(lkr.is_empty());
        self.sto_end(&mut buffer);
        true
    }

    fn note_mem_used(&self, bytes: u64) {
        if let Some(tracker) = &self.mem_tracker {
            tracker.note_mem_used(bytes);
        }
    }

    fn note_mem_released(&self, bytes: u64) {
        if let Some(tracker) = &self.mem_tracker {
            tracker.note_mem_released(bytes);
        }
    }
}

impl fmt::Debug for Locktree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locktree")
            .field("dict_id", &self.dict_id)
            .field("reference_count", &self.get_reference_count())
            .field("sto_txnid", &self.sto_txnid())
            .finish()
    }
}
