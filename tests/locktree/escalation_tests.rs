use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ferrite_locktree::concurrency::concurrent_tree::RowLock;
use ferrite_locktree::{
    Comparator, KeyRange, LockError, LockType, Locktree, LocktreeCallbacks, LocktreeConfig,
    LocktreeManager, TxnId, TxnidSet,
};

use crate::assert_ok;
use crate::common::fixtures::{assert_no_conflicting_locks, covers, key, TestTxn};
use crate::common::logger::init_test_logger;

fn no_sto() -> LocktreeConfig {
    LocktreeConfig {
        sto_enabled: false,
        ..LocktreeConfig::default()
    }
}

fn row_lock_size() -> u64 {
    RowLock::new(KeyRange::point(key(0)), 1, LockType::Write).memory_size() as u64
}

/// Every txnid that would block a write by `probe_txnid` on each key in `keys`.
fn probe_conflicts(lt: &Locktree, probe_txnid: TxnId, keys: std::ops::Range<u32>) -> Vec<TxnidSet> {
    keys.map(|k| {
        let mut conflicts = TxnidSet::new();
        lt.get_conflicts(true, probe_txnid, &key(k), &key(k), &mut conflicts);
        conflicts
    })
    .collect()
}

mod escalation {
    use super::*;

    #[test]
    fn test_escalation_preserves_denials_and_grants() {
        init_test_logger();
        let cmp = Comparator::memcmp();
        let mut rng = StdRng::seed_from_u64(7);
        let lt = Locktree::with_config(1, cmp.clone(), &no_sto());
        let mut txns: Vec<TestTxn> = (1..=5).map(TestTxn::new).collect();

        for _ in 0..300 {
            let txn = &mut txns[rng.gen_range(0..5)];
            let left = rng.gen_range(0..500);
            let right = left + rng.gen_range(0..3);
            let lock_type = if rng.gen_ratio(1, 3) {
                LockType::Write
            } else {
                LockType::Read
            };
            let _ = txn.acquire(&lt, lock_type, left, right);
        }

        let probe_txnid = 99;
        let before = probe_conflicts(&lt, probe_txnid, 0..510);
        let num_before = lt.dump_locks().len();

        let mut callbacks = 0;
        lt.escalate(|_, _, _| callbacks += 1);
        let after_locks = lt.dump_locks();
        assert!(after_locks.len() <= num_before);
        assert!(callbacks > 0);
        assert_no_conflicting_locks(&lt);

        // Nothing previously denied is now granted.
        let after = probe_conflicts(&lt, probe_txnid, 0..510);
        for (k, (b, a)) in before.iter().zip(&after).enumerate() {
            for txnid in b.iter() {
                assert!(a.contains(txnid), "key {}: txn {} no longer blocks", k, txnid);
            }
        }

        // Nothing previously granted is revoked.
        for txn in &txns {
            for record in txn.held.iter() {
                assert!(
                    after_locks.iter().any(|l| l.txnid == txn.txnid
                        && l.lock_type == record.lock_type
                        && covers(&cmp, &l.range, &record.range)),
                    "txn {} lost {:?}",
                    txn.txnid,
                    record.range
                );
            }
        }

        for txn in txns.iter_mut() {
            txn.release(&lt);
        }
        assert!(lt.dump_locks().is_empty());
    }

    #[test]
    fn test_memory_pressure_escalates_across_locktrees() {
        init_test_logger();
        let escalated = Arc::new(Mutex::new(Vec::new()));
        let callbacks = LocktreeCallbacks {
            on_escalate: Some(Box::new({
                let escalated = Arc::clone(&escalated);
                move |txnid: TxnId, lt: &Locktree, _: &ferrite_locktree::RangeBuffer| {
                    escalated.lock().push((lt.get_dict_id(), txnid));
                }
            })),
            ..LocktreeCallbacks::default()
        };
        let config = LocktreeConfig {
            max_lock_memory: 64 * row_lock_size(),
            ..no_sto()
        };
        let mgr = LocktreeManager::with_callbacks(config, callbacks);
        let cmp = Comparator::memcmp();
        let lts: Vec<Arc<Locktree>> = (1..=2).map(|d| mgr.get_lt(d, &cmp, None).unwrap()).collect();

        // Ten txns, each writing a private block of 20 keys in both
        // dictionaries: 400 locks against a budget of 64.
        let mut txns: Vec<Vec<TestTxn>> = (1..=10)
            .map(|t| lts.iter().map(|_| TestTxn::new(t)).collect())
            .collect();
        for (t, per_lt) in txns.iter_mut().enumerate() {
            for i in 0..20 {
                for (lt, txn) in lts.iter().zip(per_lt.iter_mut()) {
                    assert_ok!(txn.write(lt, t as u32 * 100 + i));
                }
            }
        }

        let status = mgr.get_status();
        assert!(status.escalation_count >= 1);
        assert!(status.size_current <= status.size_limit + row_lock_size());
        assert!(status.escalation_latest_result <= status.size_limit);
        let escalated = escalated.lock().clone();
        assert!(escalated.iter().any(|&(dict_id, _)| dict_id == 1));
        assert!(escalated.iter().any(|&(dict_id, _)| dict_id == 2));

        // Still exclusive after coarsening.
        let mut outsider = TestTxn::new(1000);
        let (err, _) = outsider.write(&lts[0], 105).unwrap_err();
        assert_eq!(err, LockError::NotGranted);

        for per_lt in txns.iter_mut() {
            for (lt, txn) in lts.iter().zip(per_lt.iter_mut()) {
                txn.release(lt);
            }
        }
        assert_eq!(mgr.get_current_lock_memory(), 0);
        for lt in lts {
            mgr.release_lt(lt);
        }
    }
}
