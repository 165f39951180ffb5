//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use soo_vbstore::{Store, StoreLayout};
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once per test binary. `RUST_LOG` wins
/// over the default `debug` filter.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_test_writer()
            .try_init();
    });
}

/// Store with the default layout and a `vdummy` backend directory
pub fn store() -> Store {
    init_tracing();
    let store = Store::new().unwrap();
    let layout = StoreLayout {
        backends: vec!["vdummy".to_string()],
        ..Default::default()
    };
    store.populate_layout(&layout).unwrap();
    store
}
