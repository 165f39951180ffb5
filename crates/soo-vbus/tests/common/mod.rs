//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use soo_avz_core::{AvzConfig, DomainId, DomainRegistry, DOMID_AGENCY};
use soo_hal::SimMemory;
use soo_vbstore::{Store, TxId};
use soo_vbus::{Bus, DeviceLifecycle, Role, VbusConfig, VbusDevice, VbusError, VbusState};
use tracing_subscriber::EnvFilter;

pub const NIL: TxId = TxId::NIL;
pub const AGENCY: DomainId = DOMID_AGENCY;
pub const ME: DomainId = DomainId(2);
pub const DEVTYPE: &str = "vdummy";
pub const WAIT: Option<Duration> = Some(Duration::from_secs(5));

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

/// Driver that records every callback as `"<callback> <nodename>"`
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<String>>,
    fail_probe: AtomicBool,
}

impl RecordingDriver {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, callback: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split(' ').next() == Some(callback))
            .count()
    }

    pub fn fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    fn record(&self, callback: &str, dev: &VbusDevice) {
        self.calls
            .lock()
            .push(format!("{callback} {}", dev.nodename()));
    }
}

impl DeviceLifecycle for RecordingDriver {
    fn probe(&self, dev: &VbusDevice) -> Result<(), VbusError> {
        self.record("probe", dev);
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(VbusError::driver("probe refused"));
        }
        Ok(())
    }

    fn reconfigured(&self, dev: &VbusDevice) -> Result<(), VbusError> {
        self.record("reconfigured", dev);
        Ok(())
    }

    fn connected(&self, dev: &VbusDevice) -> Result<(), VbusError> {
        self.record("connected", dev);
        Ok(())
    }

    fn suspend(&self, dev: &VbusDevice) -> Result<(), VbusError> {
        self.record("suspend", dev);
        Ok(())
    }

    fn resume(&self, dev: &VbusDevice) -> Result<(), VbusError> {
        self.record("resume", dev);
        Ok(())
    }

    fn closed(&self, dev: &VbusDevice) {
        self.record("closed", dev);
    }

    fn shutdown(&self, dev: &VbusDevice) {
        self.record("shutdown", dev);
    }
}

/// Agency and one Mobile Entity sharing a registry and a store
pub struct Fixture {
    pub memory: Arc<SimMemory>,
    pub registry: Arc<DomainRegistry>,
    pub store: Arc<Store>,
    pub agency: Arc<Bus>,
    pub me: Arc<Bus>,
    pub backend: Arc<RecordingDriver>,
    pub frontend: Arc<RecordingDriver>,
}

impl Fixture {
    /// Frontend and backend of `vdummy/0`, both Connected
    pub fn connected_pair(&self) -> (Arc<VbusDevice>, Arc<VbusDevice>) {
        let front = self.me.add_frontend(DEVTYPE, 0, AGENCY).unwrap();
        let back = self.agency.probe_backend(DEVTYPE, ME, 0).unwrap();
        back.wait_for_state(VbusState::Connected, WAIT)
            .unwrap();
        front
            .wait_for_state(VbusState::Connected, WAIT)
            .unwrap();
        (front, back)
    }

    pub fn read(&self, path: &str) -> String {
        self.store.read(NIL, path).unwrap()
    }

    /// State published under `<node>/state`
    pub fn read_state(&self, node: &str) -> VbusState {
        self.read(&format!("{node}/state")).parse().unwrap()
    }
}

pub fn config() -> VbusConfig {
    VbusConfig {
        backends: vec![DEVTYPE.to_string()],
        me_domains: vec![ME],
        sync_timeout_ms: Some(5000),
    }
}

/// Fixture whose ME grants start at index 7
pub fn fixture() -> Fixture {
    init_tracing();
    let memory = Arc::new(SimMemory::new());
    let avz = AvzConfig {
        nr_reserved_grants: 7,
        ..Default::default()
    };
    let registry = Arc::new(DomainRegistry::new(avz, memory.clone()).unwrap());
    registry.create_domain(AGENCY).unwrap();
    registry.create_domain(ME).unwrap();

    let store = Arc::new(Store::new().unwrap());
    let config = config();
    config.populate_store(&store).unwrap();

    let agency = Bus::new(AGENCY, registry.clone(), store.clone(), config.clone()).unwrap();
    let me = Bus::new(ME, registry.clone(), store.clone(), config).unwrap();

    let backend = Arc::new(RecordingDriver::default());
    let frontend = Arc::new(RecordingDriver::default());
    agency
        .register_driver(DEVTYPE, Role::Backend, backend.clone())
        .unwrap();
    me.register_driver(DEVTYPE, Role::Frontend, frontend.clone())
        .unwrap();

    Fixture {
        memory,
        registry,
        store,
        agency,
        me,
        backend,
        frontend,
    }
}
