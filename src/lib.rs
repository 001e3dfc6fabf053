//! Range lock management for a transactional key-value store.
//!
//! A [`concurrency::locktree_manager::LocktreeManager`] hands out one
//! [`concurrency::locktree::Locktree`] per dictionary. Transactions take read
//! and write locks on key ranges through
//! [`concurrency::lock_request::LockRequest`]s, which wait on conflicts and
//! detect deadlocks.

pub mod common;
pub mod concurrency;

pub use common::config::{DictionaryId, LocktreeConfig, TxnId, TXNID_NONE};
pub use common::exception::{ConfigError, LockError};
pub use concurrency::concurrent_tree::LockType;
pub use concurrency::keyrange::{Comparator, Key, KeyRange};
pub use concurrency::lock_request::{LockRequest, RequestState};
pub use concurrency::locktree::Locktree;
pub use concurrency::locktree_manager::{LocktreeCallbacks, LocktreeManager, LocktreeManagerStatus};
pub use concurrency::range_buffer::RangeBuffer;
pub use concurrency::txnid_set::TxnidSet;
