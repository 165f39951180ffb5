//! Split-device endpoint
//!
//! A [`VbusDevice`] is one end of a split device: its store node, the ring
//! resources it holds, its processing gate and its place in the connection
//! state machine. The bus creates devices and feeds them peer state changes;
//! drivers receive `&VbusDevice` in their callbacks and use the client
//! helpers below to reach event channels, grants and the ring.
//!
//! # Resources
//!
//! ```text
//!   frontend                               backend
//!   page (alloc_contig_pages)
//!   gref  (grant_ring) ──── ring-ref ────► mapping (map_ring)
//!   evtchn (alloc_evtchn) ─ ring-evtchn ─► evtchn (bind_evtchn)
//!   FrontRing                              BackRing
//! ```
//!
//! Release is best effort and idempotent. The backend drops its mapping
//! before it publishes a state that lets the frontend revoke the grant.
//! Reconfiguring after migration keeps the frontend's page, ring indices,
//! grant and channel, so requests queued before the move are still there
//! for the new backend. A backend that reconnects pairs its old channel id
//! with the frontend's again.
//!
//! # Locking
//!
//! `op` serializes state machine steps and is held across driver callbacks.
//! `inner` and `ring` are short leaf locks and are never held while a driver
//! runs or a store call is made.

use std::fmt::Write;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use soo_avz_core::{
    AvzError, ChannelId, ChannelState, DomainId, DomainRegistry, EventHandler, GrantMapping, GrantRef,
    VirtualAddress,
};
use soo_vbstore::{Store, TxId, VbsError};
use tracing::{debug, error, info, warn};

use crate::error::VbusError;
use crate::lifecycle::DeviceLifecycle;
use crate::paths;
use crate::processing::{ProcessingGate, ProcessingGuard};
use crate::ring::{BackRing, FrontRing};
use crate::state::{Role, VbusState};
use crate::transition::{react, Reaction};

const NIL: TxId = TxId::NIL;

#[derive(Debug)]
struct DeviceInner {
    state: VbusState,
    /// Last peer state acted upon
    otherend_state: Option<VbusState>,
    last_error: Option<VbusError>,
    removed: bool,
    terminated: Option<VbusError>,
}

#[derive(Debug, Default)]
struct RingResources {
    page: Option<VirtualAddress>,
    gref: Option<GrantRef>,
    mapping: Option<GrantMapping>,
    evtchn: Option<ChannelId>,
    front: Option<FrontRing>,
    back: Option<BackRing>,
}

/// One end of a split device
pub struct VbusDevice {
    nodename: String,
    otherend: String,
    devtype: String,
    instance: u32,
    role: Role,
    domain: DomainId,
    otherend_id: DomainId,
    registry: Arc<DomainRegistry>,
    store: Arc<Store>,
    driver: Arc<dyn DeviceLifecycle>,
    op: Mutex<()>,
    inner: Mutex<DeviceInner>,
    changed: Condvar,
    ring: Mutex<RingResources>,
    gate: ProcessingGate,
    /// Handed to the drain worker of a peer-requested suspend
    this: Weak<VbusDevice>,
}

impl VbusDevice {
    /// `local` runs this end, `peer` the other one
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: Role,
        devtype: &str,
        instance: u32,
        local: DomainId,
        peer: DomainId,
        registry: Arc<DomainRegistry>,
        store: Arc<Store>,
        driver: Arc<dyn DeviceLifecycle>,
    ) -> Arc<Self> {
        let (nodename, otherend) = match role {
            Role::Frontend => (
                paths::frontend_node(local, devtype, instance),
                paths::backend_node(devtype, local, instance),
            ),
            Role::Backend => (
                paths::backend_node(devtype, peer, instance),
                paths::frontend_node(peer, devtype, instance),
            ),
        };
        Arc::new_cyclic(|this| Self {
            nodename,
            otherend,
            devtype: devtype.to_string(),
            instance,
            role,
            domain: local,
            otherend_id: peer,
            registry,
            store,
            driver,
            op: Mutex::new(()),
            inner: Mutex::new(DeviceInner {
                state: VbusState::Unknown,
                otherend_state: None,
                last_error: None,
                removed: false,
                terminated: None,
            }),
            changed: Condvar::new(),
            ring: Mutex::new(RingResources::default()),
            gate: ProcessingGate::new(),
            this: this.clone(),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn nodename(&self) -> &str {
        &self.nodename
    }

    pub fn otherend(&self) -> &str {
        &self.otherend
    }

    pub fn devtype(&self) -> &str {
        &self.devtype
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Domain running this end
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Domain running the other end
    pub fn otherend_id(&self) -> DomainId {
        self.otherend_id
    }

    pub fn state(&self) -> VbusState {
        self.inner.lock().state
    }

    /// Peer state this end last acted upon
    pub fn otherend_state(&self) -> VbusState {
        self.inner.lock().otherend_state.unwrap_or(VbusState::Unknown)
    }

    /// Most recent failed transition, cleared by the next successful one
    pub fn last_error(&self) -> Option<VbusError> {
        self.inner.lock().last_error.clone()
    }

    /// True once the device has left its bus
    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Grant of the ring page (frontend)
    pub fn ring_ref(&self) -> Option<GrantRef> {
        self.ring.lock().gref
    }

    /// Mapping of the peer's ring page (backend)
    pub fn ring_mapping(&self) -> Option<GrantMapping> {
        self.ring.lock().mapping
    }

    /// Local event channel of the ring
    pub fn evtchn(&self) -> Option<ChannelId> {
        self.ring.lock().evtchn
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ========================================================================
    // Client helpers
    // ========================================================================

    /// Reserve a channel the other end may bind to
    pub fn alloc_evtchn(&self) -> Result<ChannelId, VbusError> {
        Ok(self.registry.evtchn_alloc_unbound(self.domain, self.otherend_id)?)
    }

    /// Bind to the other end's unbound channel `remote`
    pub fn bind_evtchn(&self, remote: ChannelId) -> Result<ChannelId, VbusError> {
        Ok(self
            .registry
            .evtchn_bind_interdomain(self.domain, self.otherend_id, remote)?)
    }

    /// Close a local channel; closing a free one is not an error
    pub fn free_evtchn(&self, channel: ChannelId) -> Result<(), VbusError> {
        match self.registry.evtchn_close(self.domain, channel) {
            Ok(()) | Err(AvzError::AlreadyClosed { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Grant the other end read/write access to the local page at `va`
    pub fn grant_ring(&self, va: VirtualAddress) -> Result<GrantRef, VbusError> {
        let frame = self.registry.memory().frame_of(va)?;
        Ok(self
            .registry
            .grant_access(self.domain, frame, self.otherend_id, false)?)
    }

    /// Map entry `index` of the other end's grant table
    pub fn map_ring(&self, index: u32) -> Result<GrantMapping, VbusError> {
        Ok(self
            .registry
            .map_grant(self.domain, self.otherend_id, index, false)?)
    }

    pub fn unmap_ring(&self, mapping: GrantMapping) -> Result<(), VbusError> {
        Ok(self.registry.unmap_grant(self.domain, mapping.handle)?)
    }

    /// State the other end currently publishes; `Unknown` when absent or unreadable
    pub fn read_otherend_state(&self) -> VbusState {
        match self.store.read(NIL, &paths::state_path(&self.otherend)) {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(nodename = %self.nodename, value = %raw, "unparsable peer state");
                VbusState::Unknown
            }),
            Err(_) => VbusState::Unknown,
        }
    }

    /// Signal the other end through the ring's channel
    pub fn notify(&self) -> Result<(), VbusError> {
        let channel = self.ring_channel()?;
        Ok(self.registry.evtchn_notify(self.domain, channel)?)
    }

    /// Run `handler` on this domain's dispatcher when the ring's channel fires
    pub fn set_event_handler(&self, handler: EventHandler) -> Result<(), VbusError> {
        let channel = self.ring_channel()?;
        Ok(self.registry.bind_handler(self.domain, channel, handler)?)
    }

    fn ring_channel(&self) -> Result<ChannelId, VbusError> {
        self.evtchn()
            .ok_or_else(|| VbusError::RingNotReady(self.nodename.clone()))
    }

    /// Run `f` on the frontend ring
    pub fn with_front_ring<R>(
        &self,
        f: impl FnOnce(&mut FrontRing) -> Result<R, VbusError>,
    ) -> Result<R, VbusError> {
        let mut ring = self.ring.lock();
        match ring.front.as_mut() {
            Some(front) => f(front),
            None => Err(VbusError::RingNotReady(self.nodename.clone())),
        }
    }

    /// Run `f` on the backend ring
    pub fn with_back_ring<R>(
        &self,
        f: impl FnOnce(&mut BackRing) -> Result<R, VbusError>,
    ) -> Result<R, VbusError> {
        let mut ring = self.ring.lock();
        match ring.back.as_mut() {
            Some(back) => f(back),
            None => Err(VbusError::RingNotReady(self.nodename.clone())),
        }
    }

    // ========================================================================
    // Processing gate
    // ========================================================================

    /// Enter the data path, blocking until the device is connected
    ///
    /// Suspend waits for every guard to drop. Fails once the device is
    /// closed or its domain torn down.
    pub fn begin_processing(&self) -> Result<ProcessingGuard<'_>, VbusError> {
        self.gate.begin()
    }

    pub fn begin_processing_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ProcessingGuard<'_>, VbusError> {
        self.gate.begin_timeout(timeout, || VbusError::Timeout {
            nodename: self.nodename.clone(),
            expected: VbusState::Connected,
        })
    }

    pub fn try_begin_processing(&self) -> Option<ProcessingGuard<'_>> {
        self.gate.try_begin()
    }

    /// Number of data-path holders right now
    pub fn processing_active(&self) -> u32 {
        self.gate.active()
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Block until the local state is `target`
    ///
    /// Fails early when the device closes or its domain is torn down.
    pub fn wait_for_state(
        &self,
        target: VbusState,
        timeout: Option<Duration>,
    ) -> Result<(), VbusError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.state == target {
                return Ok(());
            }
            if let Some(err) = &inner.terminated {
                return Err(err.clone());
            }
            if inner.state == VbusState::Closed {
                return Err(inner
                    .last_error
                    .clone()
                    .unwrap_or_else(|| VbusError::DeviceClosed(self.nodename.clone())));
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut inner, deadline).timed_out()
                        && inner.state != target
                    {
                        return Err(VbusError::Timeout {
                            nodename: self.nodename.clone(),
                            expected: target,
                        });
                    }
                }
                None => self.changed.wait(&mut inner),
            }
        }
    }

    // ========================================================================
    // State publication
    // ========================================================================

    fn set_local_state(&self, state: VbusState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        self.changed.notify_all();
    }

    /// Publish `state` under `<nodename>/state` and adopt it locally
    pub(crate) fn switch_state(&self, state: VbusState) -> Result<(), VbusError> {
        let previous = self.state();
        self.store.write_u32(
            NIL,
            &paths::state_path(&self.nodename),
            state.as_u32(),
        )?;
        self.set_local_state(state);
        debug!(nodename = %self.nodename, from = %previous, to = %state, "state");
        Ok(())
    }

    /// Create the local node with its peer links and publish `state`
    pub(crate) fn create_node(&self, state: VbusState) -> Result<(), VbusError> {
        let (link, link_id) = match self.role {
            Role::Frontend => (paths::BACKEND, paths::BACKEND_ID),
            Role::Backend => (paths::FRONTEND, paths::FRONTEND_ID),
        };
        self.store.mkdir_p(NIL, &self.nodename)?;
        let tx = self.store.transaction_start();
        let written = self
            .store
            .write(tx, &paths::key(&self.nodename, link), &self.otherend)
            .and_then(|_| {
                self.store.write_u32(
                    tx,
                    &paths::key(&self.nodename, link_id),
                    u32::from(self.otherend_id.0),
                )
            })
            .and_then(|_| {
                self.store
                    .write_u32(tx, &paths::state_path(&self.nodename), state.as_u32())
            });
        self.store.transaction_end(tx)?;
        written?;
        self.set_local_state(state);
        Ok(())
    }

    /// Publish the ring details and `state` in one transaction
    fn publish_ring(&self, state: VbusState) -> Result<(), VbusError> {
        let (gref, evtchn) = {
            let ring = self.ring.lock();
            match (ring.gref, ring.evtchn) {
                (Some(gref), Some(evtchn)) => (gref, evtchn),
                _ => return Err(VbusError::RingNotReady(self.nodename.clone())),
            }
        };
        let tx = self.store.transaction_start();
        let written = self
            .store
            .write_u32(tx, &paths::key(&self.nodename, paths::RING_REF), gref.index)
            .and_then(|_| {
                self.store
                    .write_u32(tx, &paths::key(&self.nodename, paths::RING_EVTCHN), evtchn.0)
            })
            .and_then(|_| {
                self.store
                    .write_u32(tx, &paths::state_path(&self.nodename), state.as_u32())
            });
        self.store.transaction_end(tx)?;
        written?;
        self.set_local_state(state);
        debug!(nodename = %self.nodename, %gref, %evtchn, %state, "ring published");
        Ok(())
    }

    fn setup_failed(&self, err: VbusError) -> VbusError {
        if let VbusError::ConnectionSetupFailed { .. } = err {
            return err;
        }
        warn!(nodename = %self.nodename, state = %self.state(), error = %err, "connection setup failed");
        VbusError::setup_failed(&self.nodename, err)
    }

    // ========================================================================
    // Ring resources
    // ========================================================================

    /// Allocate, grant and initialise a ring page and reserve its channel
    fn setup_front_ring(&self) -> Result<(), VbusError> {
        let memory = self.registry.memory().clone();
        let va = memory.alloc_contig_pages(self.domain, 1)?;
        self.ring.lock().page = Some(va);
        let gref = self.grant_ring(va)?;
        self.ring.lock().gref = Some(gref);
        let evtchn = self.alloc_evtchn()?;
        self.ring.lock().evtchn = Some(evtchn);
        let front = FrontRing::init(memory.page(va)?)?;
        self.ring.lock().front = Some(front);
        Ok(())
    }

    /// Map the ring the frontend published and bind to its channel
    fn setup_back_ring(&self) -> Result<(), VbusError> {
        let keys = [paths::RING_REF, paths::RING_EVTCHN];
        let values = self.store.gather(NIL, &self.otherend, &keys)?;
        let mut numbers = [0u32; 2];
        for ((slot, raw), key) in numbers.iter_mut().zip(&values).zip(keys) {
            *slot = raw.trim().parse().map_err(|_| VbsError::Parse {
                path: paths::key(&self.otherend, key),
                value: raw.clone(),
            })?;
        }
        let [ring_ref, remote_evtchn] = numbers;

        let mapping = self.map_ring(ring_ref)?;
        self.ring.lock().mapping = Some(mapping);
        let evtchn = match self.evtchn() {
            Some(local) => self.rebind_evtchn(local, ChannelId(remote_evtchn))?,
            None => self.bind_evtchn(ChannelId(remote_evtchn))?,
        };
        self.ring.lock().evtchn = Some(evtchn);
        let back = BackRing::attach(self.registry.memory().page(mapping.va)?)?;
        self.ring.lock().back = Some(back);
        debug!(nodename = %self.nodename, ring_ref, %evtchn, "ring mapped");
        Ok(())
    }

    /// Drop every ring resource held by this end
    pub(crate) fn release_ring(&self) {
        let resources = std::mem::take(&mut *self.ring.lock());
        drop(resources.front);
        drop(resources.back);

        if let Some(channel) = resources.evtchn {
            self.close_ring_channel(channel);
        }
        if let Some(mapping) = resources.mapping {
            if let Err(e) = self.unmap_ring(mapping) {
                warn!(nodename = %self.nodename, handle = %mapping.handle, error = %e, "unmapping ring failed");
            }
        }
        let mut page_free = true;
        if let Some(gref) = resources.gref {
            if let Err(e) = self.registry.end_access(self.domain, gref) {
                // The frame stays granted until the mapper lets go
                warn!(nodename = %self.nodename, %gref, error = %e, "revoking ring grant failed");
                page_free = false;
            }
        }
        if let Some(va) = resources.page.filter(|_| page_free) {
            if let Err(e) = self.registry.memory().free_pages(va) {
                warn!(nodename = %self.nodename, va = va.0, error = %e, "freeing ring page failed");
            }
        }
    }

    fn mask_ring_channel(&self, masked: bool) {
        let Some(channel) = self.evtchn() else {
            return;
        };
        let result = if masked {
            self.registry.evtchn_mask(self.domain, channel)
        } else {
            self.registry.evtchn_unmask(self.domain, channel)
        };
        if let Err(e) = result {
            warn!(nodename = %self.nodename, %channel, masked, error = %e, "ring channel mask update failed");
        }
    }

    /// Keep the ring page across a reconnect, replacing only the grant or
    /// channel that no longer holds
    fn restore_front_ring(&self) -> Result<(), VbusError> {
        let (page, gref, evtchn, has_ring) = {
            let ring = self.ring.lock();
            (ring.page, ring.gref, ring.evtchn, ring.front.is_some())
        };
        let Some(va) = page.filter(|_| has_ring) else {
            self.release_ring();
            return self.setup_front_ring();
        };

        let granted = gref.is_some_and(|g| self.registry.query_usage(self.domain, g).is_ok());
        if !granted {
            let gref = self.grant_ring(va)?;
            self.ring.lock().gref = Some(gref);
            debug!(nodename = %self.nodename, %gref, "ring page granted again");
        }

        let reusable = evtchn.filter(|&c| self.channel_reusable(c));
        if reusable.is_none() {
            if let Some(stale) = evtchn {
                self.ring.lock().evtchn = None;
                self.close_ring_channel(stale);
            }
            let fresh = self.alloc_evtchn()?;
            self.ring.lock().evtchn = Some(fresh);
            debug!(nodename = %self.nodename, channel = %fresh, "ring channel replaced");
        }
        Ok(())
    }

    /// True when `channel` waits for the other end or is still paired with it
    fn channel_reusable(&self, channel: ChannelId) -> bool {
        let Ok(status) = self.registry.evtchn_status(self.domain, channel) else {
            return false;
        };
        match status.state {
            ChannelState::Unbound { remote } => remote == self.otherend_id,
            ChannelState::Interdomain {
                remote_domain,
                remote_channel,
            } if remote_domain == self.otherend_id => self
                .registry
                .evtchn_status(remote_domain, remote_channel)
                .is_ok_and(|peer| {
                    peer.state
                        == ChannelState::Interdomain {
                            remote_domain: self.domain,
                            remote_channel: channel,
                        }
                }),
            _ => false,
        }
    }

    /// Pair `local` with the frontend's `remote` again, keeping both ids
    /// when the slots allow it
    fn rebind_evtchn(&self, local: ChannelId, remote: ChannelId) -> Result<ChannelId, VbusError> {
        match self.registry.evtchn_bind_existing_interdomain(
            self.domain,
            local,
            self.otherend_id,
            remote,
        ) {
            Ok(()) => Ok(local),
            Err(e) => {
                debug!(nodename = %self.nodename, %local, %remote, error = %e, "channel not restored, binding afresh");
                self.ring.lock().evtchn = None;
                self.close_ring_channel(local);
                self.bind_evtchn(remote)
            }
        }
    }

    /// Unmap the peer's ring, keeping the channel for a reconnect
    fn drop_mapping(&self) {
        let mapping = {
            let mut ring = self.ring.lock();
            ring.back = None;
            ring.mapping.take()
        };
        if let Some(mapping) = mapping {
            if let Err(e) = self.unmap_ring(mapping) {
                warn!(nodename = %self.nodename, handle = %mapping.handle, error = %e, "unmapping ring failed");
            }
        }
    }

    fn close_ring_channel(&self, channel: ChannelId) {
        if let Err(e) = self.registry.unbind_handler(self.domain, channel) {
            warn!(nodename = %self.nodename, %channel, error = %e, "unbinding ring handler failed");
        }
        if let Err(e) = self.free_evtchn(channel) {
            warn!(nodename = %self.nodename, %channel, error = %e, "closing ring channel failed");
        }
    }

    // ========================================================================
    // Peer-driven transitions
    // ========================================================================

    /// React to the peer's current state
    ///
    /// Runs on the watch worker for every change of `<otherend>/state`, and
    /// once when the device is attached. A peer state already acted upon is
    /// skipped unless `force` is set.
    pub(crate) fn otherend_changed(&self, force: bool) -> Result<(), VbusError> {
        let _op = self.op.lock();
        let (local, seen) = {
            let inner = self.inner.lock();
            if inner.removed {
                return Ok(());
            }
            (inner.state, inner.otherend_state)
        };
        let peer = self.read_otherend_state();
        if !force && seen == Some(peer) {
            return Ok(());
        }

        let reaction = react(self.role, local, peer);
        if reaction != Reaction::Stay {
            debug!(
                nodename = %self.nodename,
                role = %self.role,
                %local,
                %peer,
                ?reaction,
                "otherend changed"
            );
        }

        let result = self.apply(reaction, local, peer);
        let mut inner = self.inner.lock();
        match &result {
            Ok(()) => {
                inner.otherend_state = Some(peer);
                if reaction != Reaction::Stay {
                    inner.last_error = None;
                }
            }
            Err(e) => {
                if reaction == Reaction::Violation {
                    inner.otherend_state = Some(peer);
                }
                inner.last_error = Some(e.clone());
            }
        }
        self.changed.notify_all();
        result
    }

    fn apply(&self, reaction: Reaction, local: VbusState, peer: VbusState) -> Result<(), VbusError> {
        match reaction {
            Reaction::Stay => Ok(()),
            Reaction::Probe => self.probe_frontend(),
            Reaction::SetupRing { next } => self.connect_backend(next),
            Reaction::Connect => self.enter_connected(),
            Reaction::Suspend => self.suspend_frontend(),
            Reaction::Suspended => self.switch_state(VbusState::Suspended),
            Reaction::Resume => self.resume_frontend(),
            Reaction::Close => self.close_for_peer(),
            Reaction::Finish => self.finish_close(),
            Reaction::Violation => Err(self.abort(local, peer)),
        }
    }

    fn probe_frontend(&self) -> Result<(), VbusError> {
        let setup = self
            .setup_front_ring()
            .and_then(|_| self.driver.probe(self))
            .and_then(|_| self.publish_ring(VbusState::Initialised));
        setup.map_err(|e| {
            self.release_ring();
            self.setup_failed(e)
        })
    }

    fn connect_backend(&self, next: VbusState) -> Result<(), VbusError> {
        // A suspended backend keeps its channel id for the new pairing
        self.drop_mapping();
        let setup = self
            .setup_back_ring()
            .and_then(|_| self.driver.reconfigured(self))
            .and_then(|_| match next {
                VbusState::Connected => self.enter_connected(),
                other => self.switch_state(other),
            });
        setup.map_err(|e| {
            self.release_ring();
            self.setup_failed(e)
        })
    }

    fn enter_connected(&self) -> Result<(), VbusError> {
        self.driver
            .connected(self)
            .map_err(|e| self.setup_failed(e))?;
        self.switch_state(VbusState::Connected)?;
        self.mask_ring_channel(false);
        self.gate.open();
        info!(nodename = %self.nodename, role = %self.role, "connected");
        Ok(())
    }

    /// Drain on a worker of this device; the watch worker serves every
    /// other device meanwhile
    fn suspend_frontend(&self) -> Result<(), VbusError> {
        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };
        thread::Builder::new()
            .name(format!("vbus-drain-{}-{}", self.devtype, self.instance))
            .spawn(move || this.finish_suspend())
            .map(|_| ())
            .map_err(|e| VbusError::Worker {
                nodename: self.nodename.clone(),
                reason: e.to_string(),
            })
    }

    /// Wait for the data path to empty, then report Suspended
    fn finish_suspend(&self) {
        if let Err(e) = self.gate.park() {
            debug!(nodename = %self.nodename, error = %e, "suspend drain cancelled");
            return;
        }
        let _op = self.op.lock();
        {
            let inner = self.inner.lock();
            if inner.removed || inner.state != VbusState::Connected {
                return;
            }
        }
        let result = self.driver.suspend(self).and_then(|_| {
            self.mask_ring_channel(true);
            self.switch_state(VbusState::Suspended).inspect_err(|_| {
                self.mask_ring_channel(false);
            })
        });
        if let Err(e) = result {
            warn!(nodename = %self.nodename, error = %e, "suspend failed");
            self.gate.open();
            let mut inner = self.inner.lock();
            inner.last_error = Some(e);
            self.changed.notify_all();
        }
    }

    fn resume_frontend(&self) -> Result<(), VbusError> {
        self.driver.resume(self)?;
        self.switch_state(VbusState::Connected)?;
        self.mask_ring_channel(false);
        self.gate.open();
        Ok(())
    }

    /// The peer is closing or gone: let go of everything and say Closed
    fn close_for_peer(&self) -> Result<(), VbusError> {
        self.gate
            .close(VbusError::DeviceClosed(self.nodename.clone()));
        self.release_ring();
        self.driver.closed(self);
        self.switch_state(VbusState::Closed)
    }

    /// The peer confirmed our close: release and remove the local node
    fn finish_close(&self) -> Result<(), VbusError> {
        self.gate
            .close(VbusError::DeviceClosed(self.nodename.clone()));
        self.release_ring();
        self.driver.closed(self);
        self.store.rm(NIL, &self.nodename)?;
        {
            let mut inner = self.inner.lock();
            inner.state = VbusState::Closed;
            inner.removed = true;
            self.changed.notify_all();
        }
        info!(nodename = %self.nodename, "device removed");
        Ok(())
    }

    /// Off-table peer state: abort this device only
    fn abort(&self, local: VbusState, peer: VbusState) -> VbusError {
        let err = VbusError::ProtocolViolation {
            nodename: self.nodename.clone(),
            local,
            peer,
        };
        error!(
            nodename = %self.nodename,
            otherend = %self.otherend,
            role = %self.role,
            domain = %self.domain,
            otherend_id = %self.otherend_id,
            %local,
            %peer,
            ring_ref = ?self.ring_ref(),
            evtchn = ?self.evtchn(),
            "protocol violation, closing device"
        );
        self.gate.close(err.clone());
        self.release_ring();
        self.driver.closed(self);
        if let Err(e) = self.switch_state(VbusState::Closed) {
            warn!(nodename = %self.nodename, error = %e, "publishing Closed failed");
            self.set_local_state(VbusState::Closed);
        }
        err
    }

    // ========================================================================
    // Locally initiated transitions
    // ========================================================================

    /// Backend probe: run the driver and announce InitWait
    pub(crate) fn start_backend(&self) -> Result<(), VbusError> {
        let _op = self.op.lock();
        if self.state() != VbusState::Initialising {
            return Ok(());
        }
        let result = self
            .driver
            .probe(self)
            .map_err(|e| self.setup_failed(e))
            .and_then(|_| self.switch_state(VbusState::InitWait));
        if let Err(e) = &result {
            self.inner.lock().last_error = Some(e.clone());
        }
        result
    }

    /// Backend: drain the data path and ask the frontend to suspend
    ///
    /// Returns false when the device is not connected and was left alone.
    pub(crate) fn suspend(&self) -> Result<bool, VbusError> {
        if self.state() != VbusState::Connected {
            debug!(nodename = %self.nodename, state = %self.state(), "suspend skipped");
            return Ok(false);
        }
        // Drain before taking `op` so peer events for this device keep flowing
        self.gate.park()?;
        let _op = self.op.lock();
        if self.state() != VbusState::Connected {
            return Ok(false);
        }
        if let Err(e) = self.driver.suspend(self) {
            self.gate.open();
            return Err(e);
        }
        self.mask_ring_channel(true);
        self.switch_state(VbusState::Suspending)?;
        Ok(true)
    }

    /// Backend: ask a suspended frontend to resume
    pub(crate) fn resume(&self) -> Result<bool, VbusError> {
        let _op = self.op.lock();
        if self.state() != VbusState::Suspended {
            debug!(nodename = %self.nodename, state = %self.state(), "resume skipped");
            return Ok(false);
        }
        self.driver.resume(self)?;
        self.switch_state(VbusState::Resuming)?;
        Ok(true)
    }

    /// Frontend after migration: offer the ring to a new backend
    pub(crate) fn reconfigure(&self) -> Result<(), VbusError> {
        let _op = self.op.lock();
        let state = self.state();
        if state.is_terminal() {
            return Err(VbusError::InvalidState {
                nodename: self.nodename.clone(),
                state,
            });
        }
        self.gate.park()?;
        self.gate.disconnect();
        self.inner.lock().otherend_state = None;
        let result = self
            .restore_front_ring()
            .and_then(|_| self.driver.reconfigured(self))
            .and_then(|_| self.publish_ring(VbusState::Reconfiguring))
            .map_err(|e| {
                self.release_ring();
                self.setup_failed(e)
            });
        if let Err(e) = &result {
            self.inner.lock().last_error = Some(e.clone());
        }
        result
    }

    /// Start teardown
    ///
    /// Returns true when the peer must confirm with Closed; false when the
    /// device was finished right away because nobody is on the other end.
    pub(crate) fn initiate_close(&self) -> Result<bool, VbusError> {
        let _op = self.op.lock();
        if self.inner.lock().removed || self.state() == VbusState::Closed {
            return Ok(false);
        }
        if self.state() == VbusState::Closing {
            return Ok(true);
        }
        self.driver.shutdown(self);
        let peer = self.read_otherend_state();
        if matches!(peer, VbusState::Unknown | VbusState::Closed) {
            self.finish_close()?;
            return Ok(false);
        }
        self.gate
            .close(VbusError::DeviceClosed(self.nodename.clone()));
        if self.role == Role::Backend {
            self.release_ring();
        }
        self.switch_state(VbusState::Closing)?;
        Ok(true)
    }

    /// Domain teardown: cancel every waiter and drop everything at once
    pub(crate) fn terminate(&self, domain: DomainId) {
        let reason = VbusError::DomainTerminated { domain };
        self.gate.close(reason.clone());
        {
            let mut inner = self.inner.lock();
            inner.terminated = Some(reason);
            self.changed.notify_all();
        }
        let _op = self.op.lock();
        if self.inner.lock().removed {
            return;
        }
        self.release_ring();
        self.driver.closed(self);
        if let Err(e) = self.store.rm(NIL, &self.nodename) {
            warn!(nodename = %self.nodename, error = %e, "removing node failed");
        }
        let mut inner = self.inner.lock();
        inner.state = VbusState::Closed;
        inner.removed = true;
        self.changed.notify_all();
        info!(nodename = %self.nodename, %domain, "device terminated with its domain");
    }

    /// One-line summary for diagnostics
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let inner = self.inner.lock();
        let _ = write!(
            out,
            "{} ({}, dom{} <-> dom{}) state={} peer={}",
            self.nodename,
            self.role,
            self.domain,
            self.otherend_id,
            inner.state,
            inner.otherend_state.unwrap_or(VbusState::Unknown),
        );
        drop(inner);
        let ring = self.ring.lock();
        if let Some(gref) = ring.gref {
            let _ = write!(out, " ring-ref={}", gref.index);
        }
        if let Some(mapping) = ring.mapping {
            let _ = write!(out, " handle={}", mapping.handle);
        }
        if let Some(evtchn) = ring.evtchn {
            let _ = write!(out, " evtchn={evtchn}");
        }
        out
    }
}

impl std::fmt::Debug for VbusDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VbusDevice")
            .field("nodename", &self.nodename)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}
