//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use soo_avz_core::{AvzConfig, DomainId, DomainRegistry};
use soo_hal::SimMemory;
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

/// Registry over simulated memory with `domains` created
pub fn registry_with(config: AvzConfig, domains: &[u16]) -> (DomainRegistry, Arc<SimMemory>) {
    init_tracing();
    let memory = Arc::new(SimMemory::new());
    let registry = DomainRegistry::new(config, memory.clone()).unwrap();
    for id in domains {
        registry.create_domain(DomainId(*id)).unwrap();
    }
    (registry, memory)
}

pub fn registry(domains: &[u16]) -> (DomainRegistry, Arc<SimMemory>) {
    registry_with(AvzConfig::default(), domains)
}
