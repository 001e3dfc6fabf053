use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use ferrite_locktree::{
    Comparator, LockError, LockRequest, LockType, Locktree, LocktreeCallbacks, LocktreeConfig,
    LocktreeManager,
};

use crate::assert_ok;
use crate::common::fixtures::{key, TestTxn};
use crate::common::logger::init_test_logger;

mod lifecycle {
    use super::*;

    #[test]
    fn test_concurrent_get_and_release_destroys_exactly_once_per_create() {
        init_test_logger();
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let callbacks = LocktreeCallbacks {
            on_create: Some(Box::new({
                let created = Arc::clone(&created);
                move |_: &Arc<Locktree>, _: Option<&(dyn std::any::Any + Send + Sync)>| {
                    created.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
            on_destroy: Some(Box::new({
                let destroyed = Arc::clone(&destroyed);
                move |_: &Locktree| {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                }
            })),
            ..LocktreeCallbacks::default()
        };
        let mgr = LocktreeManager::with_callbacks(LocktreeConfig::default(), callbacks);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || {
                    let cmp = Comparator::memcmp();
                    for round in 0..500u64 {
                        let dict_id = (round + i) % 3;
                        let lt = assert_ok!(mgr.get_lt(dict_id, &cmp, None));
                        assert_eq!(lt.get_dict_id(), dict_id);
                        if round % 5 == 0 {
                            let extra = mgr.reference_lt(&lt);
                            mgr.release_lt(extra);
                        }
                        mgr.release_lt(lt);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mgr.num_locktrees(), 0);
        let created = created.load(Ordering::SeqCst);
        assert!(created >= 3);
        assert_eq!(created, destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_locktree_survives_while_referenced() {
        init_test_logger();
        let mgr = LocktreeManager::new(LocktreeConfig::default());
        let cmp = Comparator::memcmp();

        let lt = mgr.get_lt(9, &cmp, None).unwrap();
        let mut t1 = TestTxn::new(1);
        assert_ok!(t1.write(&lt, 1));

        let again = mgr.get_lt(9, &cmp, None).unwrap();
        mgr.release_lt(lt);
        assert_eq!(mgr.num_locktrees(), 1);
        // Same locktree, same locks.
        let mut t2 = TestTxn::new(2);
        assert!(t2.write(&again, 1).is_err());

        t1.release(&again);
        mgr.release_lt(again);
        assert_eq!(mgr.num_locktrees(), 0);
        assert_eq!(mgr.get_current_lock_memory(), 0);
    }
}

mod configuration {
    use super::*;

    #[test]
    fn test_manager_from_config_file() {
        init_test_logger();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_lock_memory = 4096").unwrap();
        writeln!(file, "sto_enabled = false").unwrap();
        writeln!(file, "lock_wait_time_ms = 25").unwrap();

        let config = LocktreeConfig::load(file.path()).unwrap();
        assert_eq!(config.max_lock_memory, 4096);
        let mgr = LocktreeManager::new(config);
        assert_eq!(mgr.get_max_lock_memory(), 4096);

        let lt = mgr.get_lt(1, &Comparator::memcmp(), None).unwrap();
        let mut t1 = TestTxn::new(1);
        assert_ok!(t1.write(&lt, 1));
        assert!(!lt.sto_txnid_is_valid_unsafe());

        let k = key(1);
        let mut request = LockRequest::new();
        request.set(&lt, 2, &k, &k, LockType::Write, false);
        assert_eq!(request.start(), Err(LockError::NotGranted));
        let wait_ms = mgr.config().lock_wait_time_ms;
        assert_eq!(request.wait(wait_ms), Err(LockError::NotGranted));
        assert_eq!(mgr.get_status().timeout_count, 1);

        drop(request);
        t1.release(&lt);
        mgr.release_lt(lt);
    }

    #[test]
    fn test_shrinking_budget_below_usage_is_rejected() {
        init_test_logger();
        let mgr = LocktreeManager::new(LocktreeConfig::default());
        let lt = mgr.get_lt(1, &Comparator::memcmp(), None).unwrap();
        let mut t1 = TestTxn::new(1);
        for k in 0..10 {
            assert_ok!(t1.write(&lt, k));
        }

        let current = mgr.get_current_lock_memory();
        assert!(matches!(
            mgr.set_max_lock_memory(current / 2),
            Err(LockError::MaxLockMemoryTooSmall { .. })
        ));
        assert_ok!(mgr.set_max_lock_memory(current * 2));
        assert_eq!(mgr.get_max_lock_memory(), current * 2);

        t1.release(&lt);
        mgr.release_lt(lt);
    }
}

mod reporting {
    use super::*;

    #[test]
    fn test_pending_requests_reported_across_locktrees() {
        init_test_logger();
        let mgr = LocktreeManager::new(LocktreeConfig::default());
        let cmp = Comparator::memcmp();
        let lts: Vec<Arc<Locktree>> = (1..=3).map(|d| mgr.get_lt(d, &cmp, None).unwrap()).collect();

        let keys: Vec<_> = (0..3).map(key).collect();
        let mut holders: Vec<TestTxn> = Vec::new();
        let mut requests = Vec::new();
        for (i, lt) in lts.iter().enumerate() {
            let mut holder = TestTxn::new(10 + i as u64);
            assert_ok!(holder.write(lt, i as u32));
            holders.push(holder);

            let mut request = LockRequest::new();
            request.set(lt, 20 + i as u64, &keys[i], &keys[i], LockType::Read, false);
            assert_eq!(request.start(), Err(LockError::NotGranted));
            requests.push(request);
        }

        let mut seen = Vec::new();
        mgr.iterate_pending_lock_requests(|pending| -> Result<(), String> {
            seen.push((pending.dict_id, pending.txnid, pending.blocking_txnid));
            Ok(())
        })
        .unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, 20, 10), (2, 21, 11), (3, 22, 12)]);

        // The callback's error stops the walk.
        let mut visited = 0;
        let stopped = mgr.iterate_pending_lock_requests(|_| {
            visited += 1;
            Err("stop")
        });
        assert_eq!(stopped, Err("stop"));
        assert_eq!(visited, 1);

        let status = mgr.get_status();
        assert_eq!(status.num_locktrees, 3);
        assert_eq!(status.lock_requests_pending, 3);
        assert_eq!(status.size_limit, LocktreeConfig::default().max_lock_memory);

        for (lt, holder) in lts.iter().zip(holders.iter_mut()) {
            holder.release(lt);
        }
        assert!(requests.iter().all(|r| r.get_result() == Ok(())));
        assert_eq!(mgr.get_status().lock_requests_pending, 0);

        drop(requests);
        for lt in lts {
            mgr.release_lt(lt);
        }
    }
}
