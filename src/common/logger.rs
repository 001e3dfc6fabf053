use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Installs the process logger once. Per-lock `trace!` output stays off unless
/// `RUST_LOG` enables it; escalation and locktree lifecycle log at info.
pub fn initialize_logger() {
    INIT.call_once_force(|_| {
        let mut builder = Builder::new();

        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("ferrite_locktree::concurrency::locktree_manager", LevelFilter::Info)
            .filter_module("ferrite_locktree::concurrency::lock_request", LevelFilter::Info)
            .filter_module("ferrite_locktree::concurrency::locktree", LevelFilter::Info)
            .format_timestamp_micros()
            .parse_default_env();

        // Another logger may already be installed by the embedding engine.
        let _ = builder.try_init();
    });
}
