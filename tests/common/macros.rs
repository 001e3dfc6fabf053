/// Unwraps a granted lock result, panicking with the error otherwise.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!("Expected lock to be granted, got Err({:?})", err),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!(concat!("Expected lock to be granted: ", $($arg)+, ": {:?}"), err),
        }
    };
}

/// Asserts a `TestTxn` acquisition was denied with `NotGranted` and reports
/// exactly the listed conflicting txnids, in ascending order.
#[macro_export]
macro_rules! assert_blocked_by {
    ($expr:expr, [$($txnid:expr),* $(,)?]) => {
        match $expr {
            Err((ferrite_locktree::LockError::NotGranted, conflicts)) => {
                let found: Vec<ferrite_locktree::TxnId> = conflicts.iter().collect();
                let expected: Vec<ferrite_locktree::TxnId> = vec![$($txnid),*];
                assert_eq!(found, expected, "unexpected conflicting txnids");
            }
            other => panic!("Expected NotGranted, got {:?}", other),
        }
    };
}
