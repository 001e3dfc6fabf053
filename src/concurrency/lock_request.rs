use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::config::{TxnId, TXNID_NONE};
use crate::common::exception::LockError;
use crate::common::time::current_time_ms;
use crate::concurrency::concurrent_tree::LockType;
use crate::concurrency::keyrange::{Key, KeyRange};
use crate::concurrency::locktree::Locktree;
use crate::concurrency::txnid_set::TxnidSet;
use crate::concurrency::wfg::Wfg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Uninitialized,
    Initialized,
    Pending,
    Complete,
    Destroyed,
}

/// Wait statistics accumulated by one locktree's lock requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockRequestCounters {
    pub wait_count: u64,
    pub wait_time_us: u64,
    pub long_wait_count: u64,
    pub long_wait_time_us: u64,
    pub timeout_count: u64,
}

impl LockRequestCounters {
    pub fn add(&mut self, other: &LockRequestCounters) {
        self.wait_count += other.wait_count;
        self.wait_time_us += other.wait_time_us;
        self.long_wait_count += other.long_wait_count;
        self.long_wait_time_us += other.long_wait_time_us;
        self.timeout_count += other.timeout_count;
    }
}

/// The shared half of a pending request: what other threads need to retry it,
/// wake its owner, and report it.
#[derive(Debug)]
pub struct PendingRequest {
    txnid: TxnId,
    range: KeyRange,
    lock_type: LockType,
    big_txn: bool,
    start_time_ms: u64,
    status: Mutex<PendingStatus>,
    wait_cond: Condvar,
}

#[derive(Debug)]
struct PendingStatus {
    state: RequestState,
    result: Result<(), LockError>,
    conflicting_txnid: TxnId,
}

impl PendingRequest {
    pub fn get_txnid(&self) -> TxnId {
        self.txnid
    }

    pub fn get_range(&self) -> &KeyRange {
        &self.range
    }

    pub fn get_type(&self) -> LockType {
        self.lock_type
    }

    pub fn get_start_time(&self) -> u64 {
        self.start_time_ms
    }

    pub fn get_conflicting_txnid(&self) -> TxnId {
        self.status.lock().conflicting_txnid
    }

    fn state(&self) -> RequestState {
        self.status.lock().state
    }

    fn result(&self) -> Result<(), LockError> {
        self.status.lock().result.clone()
    }

    fn complete(&self, result: Result<(), LockError>) {
        let mut status = self.status.lock();
        status.state = RequestState::Complete;
        status.result = result;
    }
}

/// Pending requests of one locktree, sorted by txnid, plus their wait counters.
/// Guarded by [`LockRequestInfo`]'s mutex.
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: Vec<Arc<PendingRequest>>,
    counters: LockRequestCounters,
}

impl PendingRequests {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PendingRequest>> {
        self.requests.iter()
    }

    pub fn counters(&self) -> &LockRequestCounters {
        &self.counters
    }

    fn find(&self, txnid: TxnId) -> Option<&Arc<PendingRequest>> {
        self.requests
            .binary_search_by_key(&txnid, |r| r.txnid)
            .ok()
            .map(|idx| &self.requests[idx])
    }

    fn insert(&mut self, request: Arc<PendingRequest>) {
        match self.requests.binary_search_by_key(&request.txnid, |r| r.txnid) {
            Ok(_) => panic!(
                "txn {} already has a pending lock request in this locktree",
                request.txnid
            ),
            Err(idx) => self.requests.insert(idx, request),
        }
    }

    fn remove(&mut self, txnid: TxnId) {
        let idx = self
            .requests
            .binary_search_by_key(&txnid, |r| r.txnid)
            .unwrap_or_else(|_| panic!("txn {} has no pending lock request", txnid));
        self.requests.remove(idx);
    }
}

/// Per-locktree bookkeeping for blocked lock requests.
#[derive(Debug)]
pub struct LockRequestInfo {
    pending: Mutex<PendingRequests>,
    should_retry_lock_requests: AtomicBool,
    // Bumped by every retry_all call so a pass that raced with a release
    // knows to run again.
    retry_want: AtomicU64,
    long_wait_threshold_us: u64,
}

impl LockRequestInfo {
    pub(crate) fn new(long_wait_threshold_us: u64) -> Self {
        Self {
            pending: Mutex::new(PendingRequests::default()),
            should_retry_lock_requests: AtomicBool::new(false),
            retry_want: AtomicU64::new(0),
            long_wait_threshold_us,
        }
    }

    /// Locks the pending list.
    pub fn lock(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn counters(&self) -> LockRequestCounters {
        self.pending.lock().counters
    }

    fn insert_into_lock_requests(&self, requests: &mut PendingRequests, request: Arc<PendingRequest>) {
        requests.insert(request);
        self.should_retry_lock_requests.store(true, Ordering::SeqCst);
    }
}

/// Retries `request` against `lt`. On success the request leaves the pending
/// list and its waiter is woken. The caller holds the pending-list mutex.
fn retry_pending(
    lt: &Locktree,
    requests: &mut PendingRequests,
    request: &Arc<PendingRequest>,
) -> Result<(), LockError> {
    debug_assert_eq!(request.state(), RequestState::Pending);
    let mut conflicts = TxnidSet::new();
    let result = lt.try_acquire_lock(
        request.lock_type,
        request.txnid,
        request.range.left(),
        request.range.right(),
        &mut conflicts,
        request.big_txn,
    );
    match &result {
        Ok(()) => {
            requests.remove(request.txnid);
            request.complete(Ok(()));
            request.wait_cond.notify_all();
            debug!(
                "locktree {}: pending {} lock for txn {} granted on retry",
                lt.get_dict_id(),
                request.lock_type,
                request.txnid
            );
        }
        Err(_) => {
            request.status.lock().conflicting_txnid = conflicts.get(0).unwrap_or(TXNID_NONE);
        }
    }
    result
}

/// A single attempt to lock a range, which may block.
///
/// Typical use: [`LockRequest::set`], then [`LockRequest::start`]; if that
/// returns `Err(LockError::NotGranted)` the request is pending and the caller
/// either calls [`LockRequest::wait`] or relies on another thread's
/// [`LockRequest::retry_all_lock_requests`] to grant it. Dropping a request
/// that is still pending is a programming error.
pub struct LockRequest<'a> {
    txnid: TxnId,
    lt: Option<&'a Locktree>,
    range: Option<KeyRange>,
    lock_type: LockType,
    big_txn: bool,
    state: RequestState,
    complete_r: Result<(), LockError>,
    start_time_ms: u64,
    conflicting_txnid: TxnId,
    pending: Option<Arc<PendingRequest>>,
}

impl<'a> LockRequest<'a> {
    pub fn new() -> Self {
        Self {
            txnid: TXNID_NONE,
            lt: None,
            range: None,
            lock_type: LockType::Write,
            big_txn: false,
            state: RequestState::Uninitialized,
            complete_r: Ok(()),
            start_time_ms: 0,
            conflicting_txnid: TXNID_NONE,
            pending: None,
        }
    }

    /// Describes what to lock. The request keeps its own copy of the keys.
    pub fn set(
        &mut self,
        lt: &'a Locktree,
        txnid: TxnId,
        left: &Key,
        right: &Key,
        lock_type: LockType,
        big_txn: bool,
    ) {
        assert_ne!(
            self.get_state(),
            RequestState::Pending,
            "cannot reuse a pending lock request"
        );
        self.lt = Some(lt);
        self.txnid = txnid;
        self.range = Some(KeyRange::new(left.clone(), right.clone()));
        self.lock_type = lock_type;
        self.big_txn = big_txn;
        self.state = RequestState::Initialized;
        self.complete_r = Ok(());
        self.start_time_ms = 0;
        self.conflicting_txnid = TXNID_NONE;
        self.pending = None;
    }

    /// Attempts the lock once.
    ///
    /// # Returns
    /// - `Ok(())` if granted.
    /// - `Err(LockError::NotGranted)` if the request is now pending.
    /// - `Err(LockError::Deadlock)` if waiting would close a cycle in the
    ///   wait-for graph; the request is complete and not pending.
    /// - `Err(LockError::OutOfLocks)` if lock memory is exhausted.
    pub fn start(&mut self) -> Result<(), LockError> {
        assert_eq!(self.state, RequestState::Initialized, "lock request not set");
        let lt = self.locktree();

        let mut conflicts = TxnidSet::new();
        let result = lt.try_acquire_lock(
            self.lock_type,
            self.txnid,
            self.left_key(),
            self.right_key(),
            &mut conflicts,
            self.big_txn,
        );
        if result != Err(LockError::NotGranted) {
            return self.complete(result);
        }

        self.start_time_ms = current_time_ms();
        self.conflicting_txnid = conflicts.get(0).unwrap_or(TXNID_NONE);
        let pending = Arc::new(PendingRequest {
            txnid: self.txnid,
            range: self.key_range().clone(),
            lock_type: self.lock_type,
            big_txn: self.big_txn,
            start_time_ms: self.start_time_ms,
            status: Mutex::new(PendingStatus {
                state: RequestState::Pending,
                result: Err(LockError::NotGranted),
                conflicting_txnid: self.conflicting_txnid,
            }),
            wait_cond: Condvar::new(),
        });

        let info = lt.get_lock_request_info();
        let mut requests = info.lock();
        info.insert_into_lock_requests(&mut requests, Arc::clone(&pending));
        self.state = RequestState::Pending;
        self.pending = Some(pending);

        if self.deadlock_exists(lt, &requests, &conflicts) {
            requests.remove(self.txnid);
            drop(requests);
            return self.complete(Err(LockError::Deadlock));
        }
        debug!(
            "locktree {}: {} lock for txn {} on [{:?}, {:?}] is pending behind txn {}",
            lt.get_dict_id(),
            self.lock_type,
            self.txnid,
            self.left_key(),
            self.right_key(),
            self.conflicting_txnid
        );
        Err(LockError::NotGranted)
    }

    /// Waits up to `wait_time_ms` for a pending request to be granted.
    pub fn wait(&mut self, wait_time_ms: u64) -> Result<(), LockError> {
        self.wait_with_callback(wait_time_ms, 0, None)
    }

    /// Waits up to `wait_time_ms` for a pending request to be granted, asking
    /// `killed_callback` every `killed_time_ms` whether the waiter should give
    /// up. A killed or timed out request completes with
    /// `Err(LockError::NotGranted)` and leaves the pending list.
    pub fn wait_with_callback(
        &mut self,
        wait_time_ms: u64,
        killed_time_ms: u64,
        killed_callback: Option<&dyn Fn() -> bool>,
    ) -> Result<(), LockError> {
        if self.state == RequestState::Complete {
            return self.complete_r.clone();
        }
        assert_eq!(self.state, RequestState::Pending, "lock request not started");
        let lt = self.locktree();
        let Some(pending) = self.pending.clone() else {
            unreachable!("pending lock request without shared state");
        };
        let info = lt.get_lock_request_info();

        let t_start = Instant::now();
        let t_end = t_start + Duration::from_millis(wait_time_ms);
        let mut requests = info.lock();

        // A release may have slipped in between start() and now; retry while
        // holding the mutex so no other retry interleaves.
        if pending.state() == RequestState::Pending {
            let _ = retry_pending(lt, &mut requests, &pending);
        }

        while pending.state() == RequestState::Pending {
            if let Some(killed) = killed_callback {
                if killed() {
                    debug!("txn {} lock wait killed", self.txnid);
                    requests.remove(self.txnid);
                    pending.complete(Err(LockError::NotGranted));
                    break;
                }
            }

            let now = Instant::now();
            let t_wait = if killed_time_ms == 0 {
                t_end
            } else {
                t_end.min(now + Duration::from_millis(killed_time_ms))
            };
            pending.wait_cond.wait_until(&mut requests, t_wait);

            if pending.state() == RequestState::Pending && Instant::now() >= t_end {
                requests.counters.timeout_count += 1;
                requests.remove(self.txnid);
                pending.complete(Err(LockError::NotGranted));
                debug!(
                    "txn {} lock wait timed out after {} ms behind txn {}",
                    self.txnid,
                    wait_time_ms,
                    pending.get_conflicting_txnid()
                );
            }
        }

        let duration_us = t_start.elapsed().as_micros() as u64;
        requests.counters.wait_count += 1;
        requests.counters.wait_time_us += duration_us;
        if duration_us >= info.long_wait_threshold_us {
            requests.counters.long_wait_count += 1;
            requests.counters.long_wait_time_us += duration_us;
        }
        drop(requests);

        self.conflicting_txnid = pending.get_conflicting_txnid();
        let result = pending.result();
        self.complete(result)
    }

    /// Retries a pending request once.
    pub fn retry(&mut self) -> Result<(), LockError> {
        if self.state == RequestState::Complete {
            return self.complete_r.clone();
        }
        assert_eq!(self.state, RequestState::Pending, "lock request not started");
        let lt = self.locktree();
        let Some(pending) = self.pending.clone() else {
            unreachable!("pending lock request without shared state");
        };

        let mut requests = lt.get_lock_request_info().lock();
        let result = if pending.state() == RequestState::Pending {
            retry_pending(lt, &mut requests, &pending)
        } else {
            pending.result()
        };
        drop(requests);

        self.conflicting_txnid = pending.get_conflicting_txnid();
        if result.is_ok() {
            return self.complete(result);
        }
        result
    }

    /// Retries every pending request in `lt`, in txnid order.
    ///
    /// Called after locks are released. Exits without locking anything when
    /// no request could have been waiting.
    pub fn retry_all_lock_requests(lt: &Locktree) {
        let info = lt.get_lock_request_info();
        info.retry_want.fetch_add(1, Ordering::SeqCst);
        if !info.should_retry_lock_requests.load(Ordering::SeqCst) {
            return;
        }

        let mut requests = info.lock();
        loop {
            let want = info.retry_want.load(Ordering::SeqCst);
            info.should_retry_lock_requests.store(false, Ordering::SeqCst);

            // A granted request leaves the list, so only advance on failure.
            let mut i = 0;
            while i < requests.len() {
                let request = Arc::clone(&requests.requests[i]);
                if retry_pending(lt, &mut requests, &request).is_err() {
                    i += 1;
                }
            }

            let remaining = !requests.is_empty();
            info.should_retry_lock_requests.store(remaining, Ordering::SeqCst);
            if !remaining || info.retry_want.load(Ordering::SeqCst) == want {
                break;
            }
        }
    }

    fn deadlock_exists(&self, lt: &Locktree, requests: &PendingRequests, conflicts: &TxnidSet) -> bool {
        let mut wfg = Wfg::new();
        Self::build_wait_graph(&mut wfg, lt, requests, self.txnid, conflicts);
        if !wfg.cycle_exists_from_txnid(self.txnid) {
            return false;
        }
        warn!(
            "locktree {}: deadlock detected for txn {} waiting on {:?}",
            lt.get_dict_id(),
            self.txnid,
            conflicts.iter().collect::<Vec<_>>()
        );
        debug!("wait-for graph: {}", wfg.edge_list().join(", "));
        true
    }

    /// Adds `txnid -> c` for each conflicting `c` and, the first time `c` is
    /// seen, follows `c`'s own pending request in this locktree.
    fn build_wait_graph(
        wfg: &mut Wfg,
        lt: &Locktree,
        requests: &PendingRequests,
        txnid: TxnId,
        conflicts: &TxnidSet,
    ) {
        for conflicting_txnid in conflicts.iter() {
            let already_exists = wfg.node_exists(conflicting_txnid);
            wfg.add_edge(txnid, conflicting_txnid);
            if already_exists {
                continue;
            }
            if let Some(other) = requests.find(conflicting_txnid) {
                let mut other_conflicts = TxnidSet::new();
                lt.get_conflicts(
                    other.lock_type.is_write(),
                    other.txnid,
                    other.range.left(),
                    other.range.right(),
                    &mut other_conflicts,
                );
                Self::build_wait_graph(wfg, lt, requests, conflicting_txnid, &other_conflicts);
            }
        }
    }

    fn complete(&mut self, result: Result<(), LockError>) -> Result<(), LockError> {
        self.state = RequestState::Complete;
        self.complete_r = result.clone();
        self.pending = None;
        result
    }

    fn locktree(&self) -> &'a Locktree {
        match self.lt {
            Some(lt) => lt,
            None => panic!("lock request used before set"),
        }
    }

    fn key_range(&self) -> &KeyRange {
        match &self.range {
            Some(range) => range,
            None => panic!("lock request used before set"),
        }
    }

    fn left_key(&self) -> &Key {
        self.key_range().left()
    }

    fn right_key(&self) -> &Key {
        self.key_range().right()
    }

    pub fn get_txnid(&self) -> TxnId {
        self.txnid
    }

    pub fn get_type(&self) -> LockType {
        self.lock_type
    }

    pub fn get_left_key(&self) -> Option<&Key> {
        self.range.as_ref().map(KeyRange::left)
    }

    pub fn get_right_key(&self) -> Option<&Key> {
        self.range.as_ref().map(KeyRange::right)
    }

    /// Wall-clock milliseconds at which the request started waiting.
    pub fn get_start_time(&self) -> u64 {
        self.start_time_ms
    }

    /// A txnid that blocked the last attempt, or `TXNID_NONE`.
    pub fn get_conflicting_txnid(&self) -> TxnId {
        match &self.pending {
            Some(pending) => pending.get_conflicting_txnid(),
            None => self.conflicting_txnid,
        }
    }

    /// Current state. A pending request granted by another thread's retry
    /// reports `Complete`.
    pub fn get_state(&self) -> RequestState {
        match &self.pending {
            Some(pending) if self.state == RequestState::Pending => pending.state(),
            _ => self.state,
        }
    }

    /// The request's outcome once complete. Outcomes delivered by another
    /// thread's retry are visible here.
    pub fn get_result(&self) -> Result<(), LockError> {
        match &self.pending {
            Some(pending) if self.state == RequestState::Pending => pending.result(),
            _ => self.complete_r.clone(),
        }
    }
}

impl Default for LockRequest<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockRequest<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_ne!(
                self.get_state(),
                RequestState::Pending,
                "txn {} dropped a lock request that is still pending",
                self.txnid
            );
        }
        self.state = RequestState::Destroyed;
    }
}
