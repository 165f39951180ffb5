//! Per-domain device bus
//!
//! A [`Bus`] holds the drivers and devices of one domain. It creates
//! devices in the store, attaches one watch per device to the peer's
//! `state` key and routes every notification to the device it belongs to.
//! The migration orchestrator drives it through `suspend_all_devices`,
//! `resume_all_devices`, `populate_devices` and `reconfigure_all_devices`.
//!
//! ```text
//!   vbs-watch worker ──► on_watch(event) ──► device(otherend == watched)
//!                                                 │
//!                                                 ▼
//!                                       otherend_changed() ──► driver
//! ```

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use soo_avz_core::{DomainId, DomainRegistry};
use soo_vbstore::{join_path, Store, TxId, WatchEvent, WatchHandle};
use tracing::{debug, error, info, warn};

use crate::config::VbusConfig;
use crate::device::VbusDevice;
use crate::error::VbusError;
use crate::lifecycle::DeviceLifecycle;
use crate::paths;
use crate::state::{Role, VbusState};

const NIL: TxId = TxId::NIL;

type DriverKey = (Role, String);

pub struct Bus {
    domain: DomainId,
    registry: Arc<DomainRegistry>,
    store: Arc<Store>,
    config: VbusConfig,
    drivers: RwLock<BTreeMap<DriverKey, Arc<dyn DeviceLifecycle>>>,
    devices: RwLock<BTreeMap<String, Arc<VbusDevice>>>,
    watch: WatchHandle,
}

impl Bus {
    /// Bus of `domain`, listening on `store` for peer state changes
    pub fn new(
        domain: DomainId,
        registry: Arc<DomainRegistry>,
        store: Arc<Store>,
        config: VbusConfig,
    ) -> Result<Arc<Self>, VbusError> {
        config.validate()?;
        registry.domain(domain)?;
        let bus = Arc::new_cyclic(|weak: &Weak<Bus>| {
            let weak = weak.clone();
            let watch = store.register_watcher(Arc::new(move |event: &WatchEvent| {
                if let Some(bus) = weak.upgrade() {
                    bus.on_watch(event);
                }
            }));
            Bus {
                domain,
                registry,
                store,
                config,
                drivers: RwLock::new(BTreeMap::new()),
                devices: RwLock::new(BTreeMap::new()),
                watch,
            }
        });
        info!(%domain, watch = %bus.watch, "vbus up");
        Ok(bus)
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn config(&self) -> &VbusConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    // ========================================================================
    // Drivers
    // ========================================================================

    /// Serve `devtype` in `role` with `driver`, replacing an earlier one
    ///
    /// Backend drivers are only accepted for device types listed in the
    /// configuration.
    pub fn register_driver(
        &self,
        devtype: &str,
        role: Role,
        driver: Arc<dyn DeviceLifecycle>,
    ) -> Result<(), VbusError> {
        if devtype.is_empty() || devtype.contains('/') {
            return Err(VbusError::InvalidConfig(format!(
                "bad device type {devtype:?}"
            )));
        }
        if role == Role::Backend && !self.config.backends.iter().any(|b| b == devtype) {
            return Err(VbusError::InvalidConfig(format!(
                "{devtype} is not a configured backend"
            )));
        }
        self.drivers
            .write()
            .insert((role, devtype.to_string()), driver);
        debug!(domain = %self.domain, devtype, %role, "driver registered");
        Ok(())
    }

    fn driver(&self, devtype: &str, role: Role) -> Result<Arc<dyn DeviceLifecycle>, VbusError> {
        self.drivers
            .read()
            .get(&(role, devtype.to_string()))
            .cloned()
            .ok_or_else(|| VbusError::NoDriver {
                devtype: devtype.to_string(),
                role,
            })
    }

    // ========================================================================
    // Device creation
    // ========================================================================

    /// Create the frontend `devtype`/`instance` of this domain, served by
    /// `backend_domain`
    ///
    /// The handshake then runs on the watch worker as the backend appears.
    pub fn add_frontend(
        &self,
        devtype: &str,
        instance: u32,
        backend_domain: DomainId,
    ) -> Result<Arc<VbusDevice>, VbusError> {
        let driver = self.driver(devtype, Role::Frontend)?;
        let device = VbusDevice::new(
            Role::Frontend,
            devtype,
            instance,
            self.domain,
            backend_domain,
            self.registry.clone(),
            self.store.clone(),
            driver,
        );
        self.insert(device.clone())?;
        if let Err(e) = device.create_node(VbusState::Initialising) {
            self.forget(&device);
            return Err(e);
        }
        self.attach(&device)?;
        info!(nodename = device.nodename(), backend = %backend_domain, "frontend added");
        Ok(device)
    }

    /// Create the backend of `frontend_domain`'s `devtype`/`instance`
    ///
    /// A failing driver probe leaves the device on the bus in Initialising
    /// and returns `ConnectionSetupFailed`; `retry_probe` runs it again.
    pub fn probe_backend(
        &self,
        devtype: &str,
        frontend_domain: DomainId,
        instance: u32,
    ) -> Result<Arc<VbusDevice>, VbusError> {
        let driver = self.driver(devtype, Role::Backend)?;
        let device = VbusDevice::new(
            Role::Backend,
            devtype,
            instance,
            self.domain,
            frontend_domain,
            self.registry.clone(),
            self.store.clone(),
            driver,
        );
        self.insert(device.clone())?;
        if let Err(e) = device.create_node(VbusState::Initialising) {
            self.forget(&device);
            return Err(e);
        }
        let started = device.start_backend();
        self.attach(&device)?;
        started?;
        info!(nodename = device.nodename(), frontend = %frontend_domain, "backend probed");
        Ok(device)
    }

    /// Watch the peer's state key and act on its current value
    fn attach(&self, device: &Arc<VbusDevice>) -> Result<(), VbusError> {
        let state = paths::state_path(device.otherend());
        // The peer may not exist yet; a valueless node reads as Unknown
        self.store.mkdir_p(NIL, &state)?;
        self.store.watch(&state, self.watch)?;
        if let Err(e) = device.otherend_changed(true) {
            warn!(nodename = device.nodename(), error = %e, "initial evaluation failed");
        }
        Ok(())
    }

    fn insert(&self, device: Arc<VbusDevice>) -> Result<(), VbusError> {
        let mut devices = self.devices.write();
        if let Some(existing) = devices.get(device.nodename()) {
            if existing.state() != VbusState::Closed {
                return Err(VbusError::DeviceExists(device.nodename().to_string()));
            }
            debug!(nodename = device.nodename(), "replacing closed device");
        }
        devices.insert(device.nodename().to_string(), device);
        Ok(())
    }

    fn forget(&self, device: &VbusDevice) {
        let state = paths::state_path(device.otherend());
        let still_watched = self
            .devices
            .read()
            .values()
            .any(|d| !std::ptr::eq(d.as_ref(), device) && d.otherend() == device.otherend());
        if !still_watched {
            let _ = self.store.unwatch(&state, self.watch);
        }
        let mut devices = self.devices.write();
        if devices
            .get(device.nodename())
            .is_some_and(|d| std::ptr::eq(d.as_ref(), device))
        {
            devices.remove(device.nodename());
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn device(&self, nodename: &str) -> Option<Arc<VbusDevice>> {
        self.devices.read().get(nodename).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<VbusDevice>> {
        self.devices.read().values().cloned().collect()
    }

    /// Devices whose either end runs in `domain`
    pub fn devices_of(&self, domain: DomainId) -> Vec<Arc<VbusDevice>> {
        self.devices
            .read()
            .values()
            .filter(|d| d.domain() == domain || d.otherend_id() == domain)
            .cloned()
            .collect()
    }

    // ========================================================================
    // Watch routing
    // ========================================================================

    fn on_watch(&self, event: &WatchEvent) {
        let targets: Vec<Arc<VbusDevice>> = self
            .devices
            .read()
            .values()
            .filter(|d| paths::state_path(d.otherend()) == event.watched)
            .cloned()
            .collect();
        for device in targets {
            match device.otherend_changed(false) {
                Ok(()) => {}
                Err(VbusError::ProtocolViolation { .. }) => {}
                Err(e) => {
                    warn!(nodename = device.nodename(), path = %event.path, error = %e, "peer change not applied")
                }
            }
            if device.is_removed() {
                self.forget(&device);
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close `nodename` with its peer and drop it from the bus
    pub fn remove_device(&self, nodename: &str) -> Result<(), VbusError> {
        let device = self
            .device(nodename)
            .ok_or_else(|| VbusError::DeviceNotFound(nodename.to_string()))?;
        let waiting = device.initiate_close()?;
        let result = if waiting {
            device.wait_for_state(VbusState::Closed, self.config.sync_timeout())
        } else {
            Ok(())
        };
        self.forget(&device);
        info!(nodename, "device removed from bus");
        result
    }

    /// Close every device of this bus, waiting for each peer
    pub fn shutdown_all_devices(&self) -> Result<(), VbusError> {
        let mut first_error = None;
        for device in self.devices() {
            match self.remove_device(device.nodename()) {
                // Already finished by its peer
                Ok(()) | Err(VbusError::DeviceNotFound(_)) => {}
                Err(e) => {
                    warn!(nodename = device.nodename(), error = %e, "shutdown failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop every device linked to `domain` at once
    ///
    /// Blocked data-path callers and waiters get `DomainTerminated`. Peers
    /// are not consulted.
    pub fn teardown_domain(&self, domain: DomainId) -> usize {
        let doomed = self.devices_of(domain);
        for device in &doomed {
            device.terminate(domain);
            self.forget(device);
        }
        info!(bus = %self.domain, %domain, devices = doomed.len(), "domain torn down");
        doomed.len()
    }

    // ========================================================================
    // Migration
    // ========================================================================

    /// Suspend every connected backend serving `domain`
    ///
    /// Returns the number of devices that reached Suspended.
    pub fn suspend_all_devices(&self, domain: DomainId) -> Result<usize, VbusError> {
        let mut pending = Vec::new();
        for device in self.backends_of(domain) {
            if device.suspend()? {
                pending.push(device);
            }
        }
        for device in &pending {
            device.wait_for_state(VbusState::Suspended, self.config.sync_timeout())?;
        }
        info!(bus = %self.domain, %domain, devices = pending.len(), "devices suspended");
        Ok(pending.len())
    }

    /// Resume every suspended backend serving `domain`
    pub fn resume_all_devices(&self, domain: DomainId) -> Result<usize, VbusError> {
        let mut pending = Vec::new();
        for device in self.backends_of(domain) {
            if device.resume()? {
                pending.push(device);
            }
        }
        for device in &pending {
            device.wait_for_state(VbusState::Connected, self.config.sync_timeout())?;
        }
        info!(bus = %self.domain, %domain, devices = pending.len(), "devices resumed");
        Ok(pending.len())
    }

    fn backends_of(&self, domain: DomainId) -> Vec<Arc<VbusDevice>> {
        self.devices_of(domain)
            .into_iter()
            .filter(|d| d.role() == Role::Backend)
            .collect()
    }

    /// Probe a backend for every frontend `frontend_domain` published
    ///
    /// Only device types with a backend driver on this bus are considered.
    /// Existing devices and frontends on their way out are skipped.
    pub fn populate_devices(
        &self,
        frontend_domain: DomainId,
    ) -> Result<Vec<Arc<VbusDevice>>, VbusError> {
        let dir = paths::frontend_domain_dir(frontend_domain);
        if !self.store.exists(NIL, &dir)? {
            return Ok(Vec::new());
        }
        let devtypes: Vec<String> = self
            .drivers
            .read()
            .keys()
            .filter(|(role, _)| *role == Role::Backend)
            .map(|(_, devtype)| devtype.clone())
            .collect();

        let mut probed = Vec::new();
        for devtype in self.store.directory(NIL, &dir)? {
            if !devtypes.contains(&devtype) {
                continue;
            }
            let type_dir = join_path(&dir, &devtype);
            for name in self.store.directory(NIL, &type_dir)? {
                let Ok(instance) = name.parse::<u32>() else {
                    warn!(path = %join_path(&type_dir, &name), "ignoring non-numeric instance");
                    continue;
                };
                let nodename = paths::backend_node(&devtype, frontend_domain, instance);
                if self
                    .device(&nodename)
                    .is_some_and(|d| d.state() != VbusState::Closed)
                {
                    continue;
                }
                let frontend_state = self
                    .store
                    .read(NIL, &paths::state_path(&join_path(&type_dir, &name)))
                    .ok()
                    .and_then(|raw| raw.parse::<VbusState>().ok())
                    .unwrap_or(VbusState::Unknown);
                if frontend_state.is_terminal() {
                    debug!(%nodename, %frontend_state, "frontend closing, not probed");
                    continue;
                }
                match self.probe_backend(&devtype, frontend_domain, instance) {
                    Ok(device) => probed.push(device),
                    Err(e) => {
                        error!(%nodename, error = %e, "backend probe failed");
                    }
                }
            }
        }
        info!(bus = %self.domain, %frontend_domain, devices = probed.len(), "devices populated");
        Ok(probed)
    }

    /// Frontends after migration: publish fresh rings for the new backends
    pub fn reconfigure_all_devices(&self) -> Result<usize, VbusError> {
        let mut count = 0;
        for device in self.devices() {
            if device.role() != Role::Frontend || device.state().is_terminal() {
                continue;
            }
            device.reconfigure()?;
            self.attach(&device)?;
            count += 1;
        }
        info!(bus = %self.domain, devices = count, "devices reconfigured");
        Ok(count)
    }

    /// Run a failed probe or ring setup again
    pub fn retry_probe(&self, nodename: &str) -> Result<(), VbusError> {
        let device = self
            .device(nodename)
            .ok_or_else(|| VbusError::DeviceNotFound(nodename.to_string()))?;
        if device.role() == Role::Backend && device.state() == VbusState::Initialising {
            device.start_backend()?;
        }
        device.otherend_changed(true)
    }

    /// One line per device
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "vbus dom{} ({} devices)", self.domain, self.devices.read().len());
        for device in self.devices() {
            let _ = writeln!(out, "  {}", device.describe());
        }
        out
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.store.remove_watches_for(self.watch);
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("domain", &self.domain)
            .field("devices", &self.devices.read().len())
            .finish()
    }
}
