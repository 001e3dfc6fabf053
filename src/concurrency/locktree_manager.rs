use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::config::{DictionaryId, LocktreeConfig, TxnId};
use crate::common::exception::LockError;
use crate::concurrency::keyrange::{Comparator, Key};
use crate::concurrency::lock_request::LockRequestCounters;
use crate::concurrency::locktree::Locktree;
use crate::concurrency::range_buffer::RangeBuffer;

/// Called when a locktree is created; an `Err` discards the new locktree.
pub type LtCreateCallback = Box<
    dyn Fn(&Arc<Locktree>, Option<&(dyn Any + Send + Sync)>) -> Result<(), LockError>
        + Send
        + Sync,
>;
/// Called when a locktree's last reference is released, before it is dropped.
pub type LtDestroyCallback = Box<dyn Fn(&Locktree) + Send + Sync>;
/// Called once per transaction after escalation with that transaction's new ranges.
pub type LtEscalateCallback = Box<dyn Fn(TxnId, &Locktree, &RangeBuffer) + Send + Sync>;

#[derive(Default)]
pub struct LocktreeCallbacks {
    pub on_create: Option<LtCreateCallback>,
    pub on_destroy: Option<LtDestroyCallback>,
    pub on_escalate: Option<LtEscalateCallback>,
}

/// Process-wide lock memory accounting shared by the manager and its locktrees.
#[derive(Debug)]
pub struct MemoryTracker {
    current_lock_memory: AtomicU64,
    max_lock_memory: AtomicU64,
}

impl MemoryTracker {
    pub fn new(max_lock_memory: u64) -> Self {
        Self {
            current_lock_memory: AtomicU64::new(0),
            max_lock_memory: AtomicU64::new(max_lock_memory),
        }
    }

    pub fn note_mem_used(&self, bytes: u64) {
        self.current_lock_memory.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn note_mem_released(&self, bytes: u64) {
        let previous = self.current_lock_memory.fetch_sub(bytes, Ordering::SeqCst);
        debug_assert!(previous >= bytes, "lock memory accounting went negative");
    }

    pub fn current(&self) -> u64 {
        self.current_lock_memory.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> u64 {
        self.max_lock_memory.load(Ordering::SeqCst)
    }

    pub fn out_of_locks(&self) -> bool {
        self.current() > self.max()
    }

    /// Big transactions are held to half the budget.
    pub fn over_big_threshold(&self) -> bool {
        self.current() > self.max() / 2
    }
}

/// Lets exactly one thread run escalation at a time; threads arriving while it
/// runs wait for that run to finish instead of starting their own.
#[derive(Debug, Default)]
struct LocktreeEscalator {
    state: Mutex<EscalatorState>,
    done: Condvar,
}

#[derive(Debug, Default)]
struct EscalatorState {
    running: bool,
    generation: u64,
}

impl LocktreeEscalator {
    fn run<F: FnOnce()>(&self, escalate: F) {
        let mut state = self.state.lock();
        if state.running {
            let generation = state.generation;
            while state.running && state.generation == generation {
                self.done.wait(&mut state);
            }
            return;
        }
        state.running = true;
        drop(state);

        escalate();

        let mut state = self.state.lock();
        state.running = false;
        state.generation += 1;
        self.done.notify_all();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct EscalationStats {
    count: u64,
    time_us: u64,
    latest_result: u64,
    wait_count: u64,
    wait_time_us: u64,
    long_wait_count: u64,
    long_wait_time_us: u64,
}

// Counters of locktrees that have been destroyed, so status totals survive them.
#[derive(Debug, Default, Clone, Copy)]
struct RetiredCounters {
    lock_requests: LockRequestCounters,
    sto_end_early_count: u64,
    sto_end_early_time_us: u64,
}

/// Snapshot of manager-wide counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocktreeManagerStatus {
    pub size_current: u64,
    pub size_limit: u64,
    pub escalation_count: u64,
    pub escalation_time_us: u64,
    pub escalation_latest_result: u64,
    pub num_locktrees: u64,
    pub lock_requests_pending: u64,
    pub sto_num_eligible: u64,
    pub sto_end_early_count: u64,
    pub sto_end_early_time_us: u64,
    pub wait_count: u64,
    pub wait_time_us: u64,
    pub long_wait_count: u64,
    pub long_wait_time_us: u64,
    pub timeout_count: u64,
    pub wait_escalation_count: u64,
    pub wait_escalation_time_us: u64,
    pub long_wait_escalation_count: u64,
    pub long_wait_escalation_time_us: u64,
}

/// One pending lock request as reported by
/// [`LocktreeManager::iterate_pending_lock_requests`].
#[derive(Debug, Clone, Copy)]
pub struct PendingLockRequest<'a> {
    pub dict_id: DictionaryId,
    pub txnid: TxnId,
    pub left: &'a Key,
    pub right: &'a Key,
    pub blocking_txnid: TxnId,
    pub start_time_ms: u64,
}

/// Owns every locktree of the process: one per open dictionary, shared by
/// reference count. Enforces the lock memory budget by escalating all
/// locktrees when it is exceeded.
pub struct LocktreeManager {
    this: Weak<LocktreeManager>,
    config: LocktreeConfig,
    locktree_map: Mutex<BTreeMap<DictionaryId, Arc<Locktree>>>,
    mem_tracker: Arc<MemoryTracker>,
    escalator: LocktreeEscalator,
    escalation_stats: Mutex<EscalationStats>,
    retired: Mutex<RetiredCounters>,
    callbacks: LocktreeCallbacks,
}

impl LocktreeManager {
    pub fn new(config: LocktreeConfig) -> Arc<Self> {
        Self::with_callbacks(config, LocktreeCallbacks::default())
    }

    pub fn with_callbacks(config: LocktreeConfig, callbacks: LocktreeCallbacks) -> Arc<Self> {
        info!(
            "Creating locktree manager with {} bytes of lock memory",
            config.max_lock_memory
        );
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            mem_tracker: Arc::new(MemoryTracker::new(config.max_lock_memory)),
            config,
            locktree_map: Mutex::new(BTreeMap::new()),
            escalator: LocktreeEscalator::default(),
            escalation_stats: Mutex::new(EscalationStats::default()),
            retired: Mutex::new(RetiredCounters::default()),
            callbacks,
        })
    }

    pub fn config(&self) -> &LocktreeConfig {
        &self.config
    }

    /// Returns the locktree for `dict_id` with one more reference, creating it
    /// if needed.
    ///
    /// # Parameters
    /// - `dict_id`: Dictionary the locktree protects.
    /// - `cmp`: Key order, used only if the locktree is created here.
    /// - `on_create_extra`: Passed through to the create callback.
    ///
    /// # Returns
    /// The referenced locktree, or the create callback's error; in that case
    /// the new locktree is discarded and not registered.
    pub fn get_lt(
        &self,
        dict_id: DictionaryId,
        cmp: &Comparator,
        on_create_extra: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<Arc<Locktree>, LockError> {
        let mut map = self.locktree_map.lock();
        if let Some(lt) = map.get(&dict_id) {
            lt.add_reference();
            return Ok(Arc::clone(lt));
        }

        let lt = Arc::new(Locktree::create(
            dict_id,
            cmp.clone(),
            &self.config,
            self.this.clone(),
            Some(Arc::clone(&self.mem_tracker)),
        ));
        if let Some(on_create) = &self.callbacks.on_create {
            if let Err(e) = on_create(&lt, on_create_extra) {
                warn!("Create callback for locktree {} failed: {}", dict_id, e);
                return Err(e);
            }
        }
        map.insert(dict_id, Arc::clone(&lt));
        debug!("Created locktree for dictionary {}", dict_id);
        Ok(lt)
    }

    /// Takes one more reference on a locktree the caller already holds.
    pub fn reference_lt(&self, lt: &Arc<Locktree>) -> Arc<Locktree> {
        lt.add_reference();
        Arc::clone(lt)
    }

    /// Gives back one reference. The last one unregisters the locktree and
    /// runs the destroy callback.
    pub fn release_lt(&self, lt: Arc<Locktree>) {
        if lt.release_reference() > 0 {
            return;
        }

        // Someone may have re-referenced it through get_lt since the count hit
        // zero, or already destroyed it; look it up again under the map mutex.
        let dict_id = lt.get_dict_id();
        let destroy = {
            let mut map = self.locktree_map.lock();
            match map.get(&dict_id) {
                Some(found) if Arc::ptr_eq(found, &lt) && found.get_reference_count() == 0 => {
                    map.remove(&dict_id);
                    true
                }
                _ => false,
            }
        };
        if !destroy {
            return;
        }

        if let Some(on_destroy) = &self.callbacks.on_destroy {
            on_destroy(&lt);
        }
        let info = lt.get_lock_request_info();
        debug_assert_eq!(info.num_pending(), 0, "destroying a locktree with pending requests");
        {
            let mut retired = self.retired.lock();
            retired.lock_requests.add(&info.counters());
            retired.sto_end_early_count += lt.get_sto_end_early_count();
            retired.sto_end_early_time_us += lt.get_sto_end_early_time_us();
        }
        debug!("Destroyed locktree for dictionary {}", dict_id);
    }

    pub fn num_locktrees(&self) -> usize {
        self.locktree_map.lock().len()
    }

    /// Changes the lock memory budget.
    ///
    /// # Returns
    /// `Err(LockError::MaxLockMemoryTooSmall)` if more memory than `max` is
    /// already in use; the budget is unchanged then.
    pub fn set_max_lock_memory(&self, max: u64) -> Result<(), LockError> {
        let _map = self.locktree_map.lock();
        let current = self.mem_tracker.current();
        if current > max {
            return Err(LockError::MaxLockMemoryTooSmall {
                requested: max,
                current,
            });
        }
        self.mem_tracker.max_lock_memory.store(max, Ordering::SeqCst);
        info!("Max lock memory set to {} bytes", max);
        Ok(())
    }

    pub fn get_max_lock_memory(&self) -> u64 {
        self.mem_tracker.max()
    }

    pub fn get_current_lock_memory(&self) -> u64 {
        self.mem_tracker.current()
    }

    pub fn note_mem_used(&self, bytes: u64) {
        self.mem_tracker.note_mem_used(bytes);
    }

    pub fn note_mem_released(&self, bytes: u64) {
        self.mem_tracker.note_mem_released(bytes);
    }

    pub fn out_of_locks(&self) -> bool {
        self.mem_tracker.out_of_locks()
    }

    pub fn over_big_threshold(&self) -> bool {
        self.mem_tracker.over_big_threshold()
    }

    /// Admission check run before every lock acquisition. Escalates when over
    /// budget and fails with `OutOfLocks` if that did not help.
    pub fn check_current_lock_constraints(&self, big_txn: bool) -> Result<(), LockError> {
        if big_txn && self.over_big_threshold() {
            self.run_escalation();
            if self.over_big_threshold() {
                return Err(LockError::OutOfLocks);
            }
        }
        if self.out_of_locks() {
            self.run_escalation();
            if self.out_of_locks() {
                warn!(
                    "Out of lock memory after escalation: {} of {} bytes in use",
                    self.get_current_lock_memory(),
                    self.get_max_lock_memory()
                );
                return Err(LockError::OutOfLocks);
            }
        }
        Ok(())
    }

    /// Escalates every locktree, or waits for an escalation already running.
    pub fn run_escalation(&self) {
        let start = Instant::now();
        self.escalator.run(|| self.escalate_all_locktrees());
        let elapsed_us = start.elapsed().as_micros() as u64;

        let mut stats = self.escalation_stats.lock();
        stats.wait_count += 1;
        stats.wait_time_us += elapsed_us;
        if elapsed_us >= self.config.long_wait_threshold_us {
            stats.long_wait_count += 1;
            stats.long_wait_time_us += elapsed_us;
        }
    }

    pub fn escalate_all_locktrees(&self) {
        self.escalate_referenced(self.reference_all_locktrees());
    }

    // Pending-request mutexes may be held while escalation takes the map
    // mutex, so never lock one while holding the map.
    fn reference_all_locktrees(&self) -> Vec<Arc<Locktree>> {
        let map = self.locktree_map.lock();
        map.values().map(|lt| self.reference_lt(lt)).collect()
    }

    /// Escalates just the given locktrees.
    pub fn escalate_locktrees(&self, locktrees: &[Arc<Locktree>]) {
        let referenced = locktrees.iter().map(|lt| self.reference_lt(lt)).collect();
        self.escalate_referenced(referenced);
    }

    fn escalate_referenced(&self, locktrees: Vec<Arc<Locktree>>) {
        let start = Instant::now();
        let num_locktrees = locktrees.len();
        for lt in locktrees {
            lt.escalate(|txnid, lt, ranges| {
                if let Some(on_escalate) = &self.callbacks.on_escalate {
                    on_escalate(txnid, lt, ranges);
                }
            });
            self.release_lt(lt);
        }
        let elapsed_us = start.elapsed().as_micros() as u64;
        let current = self.get_current_lock_memory();

        let mut stats = self.escalation_stats.lock();
        stats.count += 1;
        stats.time_us += elapsed_us;
        stats.latest_result = current;
        info!(
            "Escalated {} locktrees in {} us, lock memory now {} bytes",
            num_locktrees, elapsed_us, current
        );
    }

    /// Calls `f` for every pending lock request of every locktree. Stops at the
    /// first error and returns it.
    pub fn iterate_pending_lock_requests<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(PendingLockRequest<'_>) -> Result<(), E>,
    {
        let locktrees = self.reference_all_locktrees();
        let mut result = Ok(());
        for lt in &locktrees {
            let requests = lt.get_lock_request_info().lock();
            for request in requests.iter() {
                result = f(PendingLockRequest {
                    dict_id: lt.get_dict_id(),
                    txnid: request.get_txnid(),
                    left: request.get_range().left(),
                    right: request.get_range().right(),
                    blocking_txnid: request.get_conflicting_txnid(),
                    start_time_ms: request.get_start_time(),
                });
                if result.is_err() {
                    break;
                }
            }
            drop(requests);
            if result.is_err() {
                break;
            }
        }
        for lt in locktrees {
            self.release_lt(lt);
        }
        result
    }

    pub fn get_status(&self) -> LocktreeManagerStatus {
        let escalation = *self.escalation_stats.lock();
        let retired = *self.retired.lock();

        let mut status = LocktreeManagerStatus {
            size_current: self.get_current_lock_memory(),
            size_limit: self.get_max_lock_memory(),
            escalation_count: escalation.count,
            escalation_time_us: escalation.time_us,
            escalation_latest_result: escalation.latest_result,
            sto_end_early_count: retired.sto_end_early_count,
            sto_end_early_time_us: retired.sto_end_early_time_us,
            wait_escalation_count: escalation.wait_count,
            wait_escalation_time_us: escalation.wait_time_us,
            long_wait_escalation_count: escalation.long_wait_count,
            long_wait_escalation_time_us: escalation.long_wait_time_us,
            ..Default::default()
        };

        let mut counters = retired.lock_requests;
        let locktrees = self.reference_all_locktrees();
        status.num_locktrees = locktrees.len() as u64;
        for lt in locktrees {
            {
                let requests = lt.get_lock_request_info().lock();
                status.lock_requests_pending += requests.len() as u64;
                counters.add(requests.counters());
            }
            if lt.sto_txnid_is_valid_unsafe() {
                status.sto_num_eligible += 1;
            }
            status.sto_end_early_count += lt.get_sto_end_early_count();
            status.sto_end_early_time_us += lt.get_sto_end_early_time_us();
            self.release_lt(lt);
        }
        status.wait_count = counters.wait_count;
        status.wait_time_us = counters.wait_time_us;
        status.long_wait_count = counters.long_wait_count;
        status.long_wait_time_us = counters.long_wait_time_us;
        status.timeout_count = counters.timeout_count;
        status
    }
}

impl fmt::Debug for LocktreeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocktreeManager")
            .field("num_locktrees", &self.num_locktrees())
            .field("current_lock_memory", &self.get_current_lock_memory())
            .field("max_lock_memory", &self.get_max_lock_memory())
            .finish()
    }
}
