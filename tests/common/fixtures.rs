use ferrite_locktree::{
    Comparator, Key, KeyRange, LockError, LockRequest, LockType, Locktree, RangeBuffer, TxnId,
    TxnidSet,
};

/// Big-endian so that bytewise order matches numeric order.
pub fn key(k: u32) -> Key {
    Key::from(k.to_be_bytes().to_vec())
}

/// A transaction's view of one locktree: its id and the ranges it was granted.
pub struct TestTxn {
    pub txnid: TxnId,
    pub held: RangeBuffer,
}

impl TestTxn {
    pub fn new(txnid: TxnId) -> Self {
        Self {
            txnid,
            held: RangeBuffer::new(),
        }
    }

    /// Tries `[left, right]` once. On denial returns the error and the
    /// conflicting txnids.
    pub fn acquire(
        &mut self,
        lt: &Locktree,
        lock_type: LockType,
        left: u32,
        right: u32,
    ) -> Result<(), (LockError, TxnidSet)> {
        let (l, r) = (key(left), key(right));
        let mut conflicts = TxnidSet::new();
        let result = match lock_type {
            LockType::Read => lt.acquire_read_lock(self.txnid, &l, &r, &mut conflicts, false),
            LockType::Write => lt.acquire_write_lock(self.txnid, &l, &r, &mut conflicts, false),
        };
        match result {
            Ok(()) => {
                self.held.append(l, r, lock_type);
                Ok(())
            }
            Err(e) => Err((e, conflicts)),
        }
    }

    pub fn write(&mut self, lt: &Locktree, k: u32) -> Result<(), (LockError, TxnidSet)> {
        self.acquire(lt, LockType::Write, k, k)
    }

    pub fn read(&mut self, lt: &Locktree, k: u32) -> Result<(), (LockError, TxnidSet)> {
        self.acquire(lt, LockType::Read, k, k)
    }

    /// Records a lock granted through a [`LockRequest`].
    pub fn note_granted(&mut self, left: &Key, right: &Key, lock_type: LockType) {
        self.held.append(left.clone(), right.clone(), lock_type);
    }

    /// Releases everything and lets waiters retry, as a commit would.
    pub fn release(&mut self, lt: &Locktree) {
        lt.release_locks(self.txnid, &self.held);
        self.held.clear();
        LockRequest::retry_all_lock_requests(lt);
    }
}

pub fn txnids(set: &TxnidSet) -> Vec<TxnId> {
    set.iter().collect()
}

/// True if `outer` contains every key of `inner`.
pub fn covers(cmp: &Comparator, outer: &KeyRange, inner: &KeyRange) -> bool {
    cmp.compare(outer.left(), inner.left()).is_le()
        && cmp.compare(inner.right(), outer.right()).is_le()
}

/// Panics if two different transactions hold overlapping locks and at least
/// one of them is a write.
pub fn assert_no_conflicting_locks(lt: &Locktree) {
    let cmp = lt.get_comparator();
    let locks = lt.dump_locks();
    for (i, a) in locks.iter().enumerate() {
        for b in &locks[i + 1..] {
            assert!(
                !a.conflicts_with(&cmp, b.txnid, b.lock_type, &b.range),
                "conflicting locks coexist: {:?} and {:?}",
                a,
                b
            );
        }
    }
}
