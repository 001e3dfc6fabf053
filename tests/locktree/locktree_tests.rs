use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ferrite_locktree::{Comparator, KeyRange, LockError, LockType, Locktree, LocktreeConfig};

use crate::common::fixtures::{assert_no_conflicting_locks, key, txnids, TestTxn};
use crate::common::logger::init_test_logger;
use crate::{assert_blocked_by, assert_ok};

// ==============================================
// BASIC CONFLICT SCENARIOS
// ==============================================

mod conflicts {
    use super::*;

    #[test]
    fn test_write_blocks_overlapping_write_until_release() {
        init_test_logger();
        let lt = Locktree::new(1, Comparator::memcmp());
        let (mut t1, mut t2) = (TestTxn::new(1), TestTxn::new(2));

        assert_ok!(t1.acquire(&lt, LockType::Write, 10, 50));
        assert_blocked_by!(t2.write(&lt, 30), [1]);
        assert_ok!(t2.read(&lt, 60));

        t1.release(&lt);
        assert_ok!(t2.write(&lt, 30));
        t2.release(&lt);
        assert!(lt.dump_locks().is_empty());
    }

    #[test]
    fn test_read_locks_are_shared() {
        init_test_logger();
        let lt = Locktree::new(1, Comparator::memcmp());
        let (mut t1, mut t2, mut t3) = (TestTxn::new(1), TestTxn::new(2), TestTxn::new(3));

        assert_ok!(t1.acquire(&lt, LockType::Read, 10, 50));
        assert_ok!(t2.acquire(&lt, LockType::Read, 20, 30));
        assert_blocked_by!(t3.write(&lt, 40), [1]);
        assert_blocked_by!(t3.acquire(&lt, LockType::Write, 0, 100), [1, 2]);

        t1.release(&lt);
        assert_blocked_by!(t3.write(&lt, 25), [2]);
        t2.release(&lt);
        assert_ok!(t3.write(&lt, 25));
    }

    #[test]
    fn test_own_locks_never_conflict() {
        init_test_logger();
        let lt = Locktree::new(1, Comparator::memcmp());
        let mut t1 = TestTxn::new(1);

        assert_ok!(t1.acquire(&lt, LockType::Write, 10, 50));
        assert_ok!(t1.read(&lt, 20));
        assert_ok!(t1.acquire(&lt, LockType::Write, 40, 90));
        assert_ok!(t1.acquire(&lt, LockType::Read, 0, 100));
        t1.release(&lt);
        assert!(lt.dump_locks().is_empty());
    }

    #[test]
    fn test_adjacent_ranges_do_not_conflict() {
        init_test_logger();
        let lt = Locktree::new(1, Comparator::memcmp());
        let (mut t1, mut t2) = (TestTxn::new(1), TestTxn::new(2));

        assert_ok!(t1.acquire(&lt, LockType::Write, 10, 19));
        assert_ok!(t2.acquire(&lt, LockType::Write, 20, 29));
        assert_blocked_by!(t2.write(&lt, 19), [1]);
    }

    #[test]
    fn test_custom_comparator_orders_ranges() {
        init_test_logger();
        // Descending order: [50, 10] is a valid range.
        let descending = Comparator::new(|_, a, b| b.cmp(a), Vec::new());
        let lt = Locktree::new(1, descending);
        let (mut t1, mut t2) = (TestTxn::new(1), TestTxn::new(2));

        assert_ok!(t1.acquire(&lt, LockType::Write, 50, 10));
        let (_, conflicts) = t2.write(&lt, 30).unwrap_err();
        assert_eq!(txnids(&conflicts), vec![1]);
        assert_ok!(t2.write(&lt, 60));
    }
}

// ==============================================
// RANDOMIZED SAFETY
// ==============================================

mod randomized {
    use super::*;

    const NUM_TXNS: u64 = 6;

    #[test]
    fn test_random_workload_never_grants_conflicting_locks() {
        init_test_logger();
        let mut rng = StdRng::seed_from_u64(0x10c4_7bee);
        let config = LocktreeConfig {
            sto_score_threshold: 3,
            ..LocktreeConfig::default()
        };
        let lt = Locktree::with_config(1, Comparator::memcmp(), &config);
        let mut txns: Vec<TestTxn> = (1..=NUM_TXNS).map(TestTxn::new).collect();

        for _ in 0..2000 {
            let txn = &mut txns[rng.gen_range(0..NUM_TXNS as usize)];
            if rng.gen_ratio(1, 8) {
                txn.release(&lt);
            } else {
                let left = rng.gen_range(0..100);
                let right = left + rng.gen_range(0..5);
                let lock_type = if rng.gen_bool(0.5) {
                    LockType::Read
                } else {
                    LockType::Write
                };
                if let Err((err, conflicts)) = txn.acquire(&lt, lock_type, left, right) {
                    assert_eq!(err, LockError::NotGranted);
                    assert!(!conflicts.is_empty());
                    assert!(!conflicts.contains(txn.txnid));
                }
            }
            assert_no_conflicting_locks(&lt);
        }

        for txn in txns.iter_mut() {
            txn.release(&lt);
        }
        assert!(lt.dump_locks().is_empty());
    }

    #[test]
    fn test_reported_conflicts_are_exactly_the_blockers() {
        init_test_logger();
        let mut rng = StdRng::seed_from_u64(42);
        let lt = Locktree::new(1, Comparator::memcmp());
        let mut txns: Vec<TestTxn> = (1..=NUM_TXNS).map(TestTxn::new).collect();

        // Each txn takes a few reads and writes.
        for txn in txns.iter_mut() {
            for _ in 0..5 {
                let k = rng.gen_range(0..200);
                let _ = if rng.gen_bool(0.5) {
                    txn.read(&lt, k)
                } else {
                    txn.write(&lt, k)
                };
            }
        }

        let cmp = Comparator::memcmp();
        let probe_txnid = 100;
        for k in 0..200 {
            let point = KeyRange::point(key(k));
            let mut expected: Vec<u64> = lt
                .dump_locks()
                .into_iter()
                .filter(|l| l.range.overlaps(&cmp, &point))
                .map(|l| l.txnid)
                .collect();
            expected.sort_unstable();
            expected.dedup();

            let mut probe = TestTxn::new(probe_txnid);
            match probe.write(&lt, k) {
                Ok(()) => {
                    assert!(expected.is_empty());
                    probe.release(&lt);
                }
                Err((_, conflicts)) => assert_eq!(txnids(&conflicts), expected),
            }
        }
    }
}
