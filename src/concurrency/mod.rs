pub mod concurrent_tree;
pub mod keyrange;
pub mod lock_request;
pub mod locktree;
pub mod locktree_manager;
pub mod range_buffer;
pub mod txnid_set;
pub mod wfg;
