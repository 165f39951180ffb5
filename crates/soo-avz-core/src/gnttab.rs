//! Grant tables
//!
//! A [`GrantTable`] belongs to one domain and plays two roles:
//!
//! - **grantor**: an entry vector with an index-linked free list. Granting
//!   pops an entry, `end_access` pushes it back and bumps its generation so
//!   that stale [`GrantRef`]s stop matching.
//! - **mapper**: a map of the foreign mappings this domain holds, keyed by
//!   [`GrantHandle`].
//!
//! ```text
//!   free_head ──► [8] ──► [9] ──► [12] ──► LIST_END
//!                  │
//!   grant_access ──┘ pop            end_access ──► push (generation += 1)
//! ```
//!
//! A free list found inconsistent (an entry pushed twice, a head pointing at
//! a live entry) poisons the table: the condition is logged once and every
//! further update fails with [`AvzError::Corrupted`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write;

use parking_lot::{Mutex, MutexGuard};
use soo_hal::Access;
use tracing::{debug, error, warn};

use crate::domain::DomainRegistry;
use crate::error::AvzError;
use crate::types::{
    CallbackId, DomainId, FrameId, GrantHandle, GrantMapping, GrantRef, GrantState, GrantUsage,
    VirtualAddress,
};

/// Free list terminator
const LIST_END: u32 = u32::MAX;

/// Callback run once enough entries are free
pub type GrantCallback = Box<dyn FnOnce(&GrantTable) + Send>;

struct GrantEntry {
    frame: FrameId,
    target: DomainId,
    readonly: bool,
    state: GrantState,
    generation: u32,
    next_free: u32,
    on_free_list: bool,
    /// Live mappings of any kind
    readers: u32,
    /// Live writable mappings
    writers: u32,
}

impl GrantEntry {
    fn empty() -> Self {
        Self {
            frame: FrameId(0),
            target: DomainId(0),
            readonly: false,
            state: GrantState::Free,
            generation: 0,
            next_free: LIST_END,
            on_free_list: false,
            readers: 0,
            writers: 0,
        }
    }
}

struct GrantSlots {
    entries: Vec<GrantEntry>,
    free_head: u32,
    free_count: u32,
    poisoned: Option<String>,
}

struct PendingCallback {
    id: CallbackId,
    count: u32,
    callback: GrantCallback,
}

#[derive(Default)]
struct CallbackQueue {
    next_id: u64,
    queue: VecDeque<PendingCallback>,
    running: bool,
}

/// Clears `running` if a callback panics, so later callbacks still run
struct ResetOnUnwind<'a>(&'a Mutex<CallbackQueue>);

impl Drop for ResetOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().running = false;
        }
    }
}

/// Record of one foreign mapping held by this domain
#[derive(Clone, Copy, Debug)]
struct MapRecord {
    grantor: DomainId,
    gref: GrantRef,
    readonly: bool,
    va: VirtualAddress,
}

#[derive(Default)]
struct MapTrack {
    next_handle: u32,
    records: BTreeMap<GrantHandle, MapRecord>,
}

/// References taken off the free list in one batch, handed out with `claim`
#[derive(Debug, Default)]
pub struct GrantPool {
    refs: Vec<GrantRef>,
}

impl GrantPool {
    /// Take one reference out of the pool
    pub fn claim(&mut self) -> Option<GrantRef> {
        self.refs.pop()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Accounting snapshot used by the invariant checker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantAudit {
    pub capacity: u32,
    pub free_count: u32,
    /// Entries reachable from the free head, `None` when the walk loops
    pub free_list_len: Option<u32>,
    pub non_free: u32,
    /// Entries whose state disagrees with their mapping counters
    pub inconsistent_entries: Vec<u32>,
    pub poisoned: bool,
}

/// Per-domain grant table
pub struct GrantTable {
    domain: DomainId,
    slots: Mutex<GrantSlots>,
    callbacks: Mutex<CallbackQueue>,
    maptrack: Mutex<MapTrack>,
}

impl GrantTable {
    /// Build a table of `capacity` entries, the first `reserved` kept off the free list
    pub fn new(domain: DomainId, capacity: u32, reserved: u32) -> Self {
        let reserved = reserved.min(capacity);
        let mut entries: Vec<GrantEntry> = (0..capacity).map(|_| GrantEntry::empty()).collect();
        for (i, entry) in entries.iter_mut().enumerate() {
            let i = i as u32;
            if i < reserved {
                entry.state = GrantState::Reserved;
            } else {
                entry.on_free_list = true;
                entry.next_free = if i + 1 < capacity { i + 1 } else { LIST_END };
            }
        }
        Self {
            domain,
            slots: Mutex::new(GrantSlots {
                entries,
                free_head: if reserved < capacity { reserved } else { LIST_END },
                free_count: capacity - reserved,
                poisoned: None,
            }),
            callbacks: Mutex::new(CallbackQueue::default()),
            maptrack: Mutex::new(MapTrack::default()),
        }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn capacity(&self) -> u32 {
        self.slots.lock().entries.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.slots.lock().free_count
    }

    pub fn is_poisoned(&self) -> bool {
        self.slots.lock().poisoned.is_some()
    }

    // ========================================================================
    // Free list
    // ========================================================================

    fn lock_live(&self) -> Result<MutexGuard<'_, GrantSlots>, AvzError> {
        let slots = self.slots.lock();
        if let Some(detail) = &slots.poisoned {
            return Err(AvzError::Corrupted {
                domain: self.domain,
                detail: detail.clone(),
            });
        }
        Ok(slots)
    }

    fn poison(&self, slots: &mut GrantSlots, detail: String) -> AvzError {
        error!(
            domain = %self.domain,
            free_head = slots.free_head,
            free_count = slots.free_count,
            %detail,
            "grant table corrupted, refusing further updates"
        );
        slots.poisoned = Some(detail.clone());
        AvzError::Corrupted {
            domain: self.domain,
            detail,
        }
    }

    fn pop_free(&self, slots: &mut GrantSlots) -> Result<u32, AvzError> {
        let head = slots.free_head;
        if head == LIST_END {
            if slots.free_count != 0 {
                let detail = format!("free list empty with free_count {}", slots.free_count);
                return Err(self.poison(slots, detail));
            }
            warn!(domain = %self.domain, "out of grant entries");
            return Err(AvzError::OutOfGrants {
                domain: self.domain,
            });
        }
        let next = slots
            .entries
            .get(head as usize)
            .filter(|e| e.on_free_list && e.state == GrantState::Free)
            .map(|e| e.next_free);
        let Some(next) = next else {
            let detail = format!("free head {head} is not a free entry");
            return Err(self.poison(slots, detail));
        };
        let entry = &mut slots.entries[head as usize];
        entry.on_free_list = false;
        entry.next_free = LIST_END;
        slots.free_head = next;
        slots.free_count -= 1;
        Ok(head)
    }

    fn push_free(&self, slots: &mut GrantSlots, index: u32) -> Result<(), AvzError> {
        match slots.entries.get(index as usize).map(|e| e.on_free_list) {
            None => {
                let detail = format!("push of out-of-range entry {index}");
                return Err(self.poison(slots, detail));
            }
            Some(true) => {
                let detail = format!("grant {index} freed twice");
                return Err(self.poison(slots, detail));
            }
            Some(false) => {}
        }
        let head = slots.free_head;
        let entry = &mut slots.entries[index as usize];
        entry.state = GrantState::Free;
        entry.generation = entry.generation.wrapping_add(1);
        entry.readers = 0;
        entry.writers = 0;
        entry.on_free_list = true;
        entry.next_free = head;
        slots.free_head = index;
        slots.free_count += 1;
        Ok(())
    }

    /// Look up a live entry by reference, rejecting stale generations
    fn entry_mut<'s>(
        &self,
        slots: &'s mut GrantSlots,
        gref: GrantRef,
    ) -> Result<&'s mut GrantEntry, AvzError> {
        let invalid = AvzError::InvalidGrant {
            domain: self.domain,
            gref,
        };
        match slots.entries.get_mut(gref.index as usize) {
            Some(e)
                if e.generation == gref.generation
                    && !matches!(e.state, GrantState::Free | GrantState::Reserved) =>
            {
                Ok(e)
            }
            _ => Err(invalid),
        }
    }

    // ========================================================================
    // Grantor side
    // ========================================================================

    /// Grant `target` access to `frame`
    pub fn grant_access(
        &self,
        frame: FrameId,
        target: DomainId,
        readonly: bool,
    ) -> Result<GrantRef, AvzError> {
        let mut slots = self.lock_live()?;
        let index = self.pop_free(&mut slots)?;
        let entry = &mut slots.entries[index as usize];
        entry.frame = frame;
        entry.target = target;
        entry.readonly = readonly;
        entry.state = GrantState::Granted;
        let gref = GrantRef::new(index, entry.generation);
        debug!(domain = %self.domain, %gref, frame = frame.0, %target, readonly, "grant_access");
        Ok(gref)
    }

    /// Fill a reference previously claimed from a [`GrantPool`]
    pub fn grant_foreign_access_ref(
        &self,
        gref: GrantRef,
        target: DomainId,
        frame: FrameId,
        readonly: bool,
    ) -> Result<(), AvzError> {
        let mut slots = self.lock_live()?;
        let entry = self.entry_mut(&mut slots, gref)?;
        if entry.state != GrantState::Claimed {
            return Err(AvzError::InvalidGrant {
                domain: self.domain,
                gref,
            });
        }
        entry.frame = frame;
        entry.target = target;
        entry.readonly = readonly;
        entry.state = GrantState::Granted;
        Ok(())
    }

    /// Revoke a grant and return its entry to the free list
    ///
    /// Fails with `StillInUse` while the target holds a mapping; this is a
    /// precondition check and never waits for the unmap.
    pub fn end_access(&self, gref: GrantRef) -> Result<(), AvzError> {
        {
            let mut slots = self.lock_live()?;
            let entry = self.entry_mut(&mut slots, gref)?;
            match entry.state {
                GrantState::Mapped => {
                    warn!(domain = %self.domain, %gref, readers = entry.readers, "end_access on mapped grant");
                    return Err(AvzError::StillInUse {
                        domain: self.domain,
                        gref,
                    });
                }
                GrantState::Granted => {}
                _ => {
                    return Err(AvzError::InvalidGrant {
                        domain: self.domain,
                        gref,
                    })
                }
            }
            self.push_free(&mut slots, gref.index)?;
            debug!(domain = %self.domain, %gref, "end_access");
        }
        self.run_callbacks();
        Ok(())
    }

    /// Report whether the target currently maps the granted page
    pub fn query_usage(&self, gref: GrantRef) -> Result<GrantUsage, AvzError> {
        let mut slots = self.slots.lock();
        let entry = self.entry_mut(&mut slots, gref)?;
        Ok(GrantUsage {
            read_in_progress: entry.readers > 0,
            write_in_progress: entry.writers > 0,
        })
    }

    /// True when `end_access` would fail because of a live mapping
    pub fn query_foreign_access(&self, gref: GrantRef) -> Result<bool, AvzError> {
        Ok(self.query_usage(gref)?.in_use())
    }

    /// Take `count` entries off the free list in one step
    pub fn alloc_grant_references(&self, count: u32) -> Result<GrantPool, AvzError> {
        let mut slots = self.lock_live()?;
        if slots.free_count < count {
            return Err(AvzError::OutOfGrants {
                domain: self.domain,
            });
        }
        let mut refs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = self.pop_free(&mut slots)?;
            let entry = &mut slots.entries[index as usize];
            entry.state = GrantState::Claimed;
            refs.push(GrantRef::new(index, entry.generation));
        }
        Ok(GrantPool { refs })
    }

    /// Put a reference back into `pool`, revoking its grant if it had one
    pub fn release(&self, pool: &mut GrantPool, gref: GrantRef) -> Result<(), AvzError> {
        let mut slots = self.lock_live()?;
        let domain = self.domain;
        let entry = self.entry_mut(&mut slots, gref)?;
        match entry.state {
            GrantState::Claimed => pool.refs.push(gref),
            GrantState::Granted => {
                entry.state = GrantState::Claimed;
                entry.generation = entry.generation.wrapping_add(1);
                pool.refs.push(GrantRef::new(gref.index, entry.generation));
            }
            GrantState::Mapped => return Err(AvzError::StillInUse { domain, gref }),
            _ => return Err(AvzError::InvalidGrant { domain, gref }),
        }
        Ok(())
    }

    /// Return every unclaimed reference of `pool` to the free list
    pub fn free_pool(&self, mut pool: GrantPool) -> Result<(), AvzError> {
        {
            let mut slots = self.lock_live()?;
            while let Some(gref) = pool.refs.pop() {
                let entry = self.entry_mut(&mut slots, gref)?;
                if entry.state != GrantState::Claimed {
                    return Err(AvzError::InvalidGrant {
                        domain: self.domain,
                        gref,
                    });
                }
                self.push_free(&mut slots, gref.index)?;
            }
        }
        self.run_callbacks();
        Ok(())
    }

    // ========================================================================
    // Deferred allocation callbacks
    // ========================================================================

    /// Run `callback` once at least `count` entries are free
    ///
    /// Callbacks run in registration order, each one to completion before the
    /// next is considered, so each gets a chance to claim entries. If the
    /// condition already holds the callback runs before this returns.
    pub fn on_grants_available(&self, count: u32, callback: GrantCallback) -> CallbackId {
        let id = {
            let mut q = self.callbacks.lock();
            let id = CallbackId(q.next_id);
            q.next_id += 1;
            q.queue.push_back(PendingCallback {
                id,
                count,
                callback,
            });
            id
        };
        self.run_callbacks();
        id
    }

    /// Drop a registered callback. Returns false if it already ran.
    pub fn cancel_callback(&self, id: CallbackId) -> bool {
        let mut q = self.callbacks.lock();
        let before = q.queue.len();
        q.queue.retain(|cb| cb.id != id);
        q.queue.len() != before
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().queue.len()
    }

    fn run_callbacks(&self) {
        {
            let mut q = self.callbacks.lock();
            if q.running {
                // The running loop re-reads the free count before each callback
                return;
            }
            q.running = true;
        }
        let _unwind = ResetOnUnwind(&self.callbacks);
        loop {
            let next = {
                let mut q = self.callbacks.lock();
                let free = self.slots.lock().free_count;
                match q.queue.front() {
                    Some(cb) if cb.count <= free => q.queue.pop_front(),
                    _ => {
                        q.running = false;
                        None
                    }
                }
            };
            match next {
                Some(cb) => (cb.callback)(self),
                None => break,
            }
        }
    }

    // ========================================================================
    // Grantor bookkeeping for foreign mappings
    // ========================================================================

    /// Account a new mapping of entry `index` by `mapper`, creating the
    /// address space mapping through `map` while the entry is locked
    fn pin(
        &self,
        mapper: DomainId,
        index: u32,
        readonly: bool,
        map: impl FnOnce(FrameId) -> Result<VirtualAddress, AvzError>,
    ) -> Result<(GrantRef, VirtualAddress), AvzError> {
        let mut slots = self.lock_live()?;
        let domain = self.domain;
        let Some(entry) = slots.entries.get_mut(index as usize) else {
            return Err(AvzError::InvalidGrant {
                domain,
                gref: GrantRef::new(index, 0),
            });
        };
        let gref = GrantRef::new(index, entry.generation);
        if !matches!(entry.state, GrantState::Granted | GrantState::Mapped) {
            return Err(AvzError::InvalidGrant { domain, gref });
        }
        if entry.target != mapper || (!readonly && entry.readonly) {
            warn!(%domain, index, %mapper, readonly, "grant map refused");
            return Err(AvzError::AccessDenied { domain, index });
        }
        let va = map(entry.frame)?;
        entry.readers += 1;
        if !readonly {
            entry.writers += 1;
        }
        entry.state = GrantState::Mapped;
        Ok((gref, va))
    }

    fn unpin(&self, gref: GrantRef, readonly: bool) -> Result<(), AvzError> {
        let mut slots = self.lock_live()?;
        let domain = self.domain;
        let entry = self.entry_mut(&mut slots, gref)?;
        if entry.state != GrantState::Mapped || entry.readers == 0 {
            let detail = format!("unmap of grant {gref} with no mapping recorded");
            return Err(self.poison(&mut slots, detail));
        }
        entry.readers -= 1;
        if !readonly {
            entry.writers = entry.writers.saturating_sub(1);
        }
        if entry.readers == 0 {
            entry.state = GrantState::Granted;
        }
        debug!(%domain, %gref, "grant unpinned");
        Ok(())
    }

    // ========================================================================
    // Mapper side
    // ========================================================================

    fn track(&self, record: MapRecord) -> GrantHandle {
        let mut track = self.maptrack.lock();
        let handle = GrantHandle(track.next_handle);
        track.next_handle = track.next_handle.wrapping_add(1);
        track.records.insert(handle, record);
        handle
    }

    fn untrack(&self, handle: GrantHandle) -> Result<MapRecord, AvzError> {
        self.maptrack
            .lock()
            .records
            .remove(&handle)
            .ok_or(AvzError::InvalidHandle {
                domain: self.domain,
                handle,
            })
    }

    /// Handles of every foreign mapping held by this domain
    pub fn mapped_handles(&self) -> Vec<GrantHandle> {
        self.maptrack.lock().records.keys().copied().collect()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn audit(&self) -> GrantAudit {
        let slots = self.slots.lock();
        let capacity = slots.entries.len() as u32;

        let mut cursor = slots.free_head;
        let mut steps = 0u32;
        let mut broken = false;
        while cursor != LIST_END {
            steps += 1;
            match slots.entries.get(cursor as usize) {
                Some(e) if steps <= capacity => cursor = e.next_free,
                _ => {
                    broken = true;
                    break;
                }
            }
        }
        let free_list_len = (!broken).then_some(steps);

        let non_free = slots
            .entries
            .iter()
            .filter(|e| e.state != GrantState::Free)
            .count() as u32;
        let inconsistent_entries = slots
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                let mapped = e.state == GrantState::Mapped;
                mapped != (e.readers > 0)
                    || e.writers > e.readers
                    || e.on_free_list != (e.state == GrantState::Free)
            })
            .map(|(i, _)| i as u32)
            .collect();

        GrantAudit {
            capacity,
            free_count: slots.free_count,
            free_list_len,
            non_free,
            inconsistent_entries,
            poisoned: slots.poisoned.is_some(),
        }
    }

    /// Human-readable listing of every granted entry and held mapping
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let slots = self.slots.lock();
        let _ = writeln!(
            out,
            "grant table of domain {}: {} free of {}",
            self.domain,
            slots.free_count,
            slots.entries.len()
        );
        for (i, e) in slots.entries.iter().enumerate() {
            if matches!(e.state, GrantState::Granted | GrantState::Mapped) {
                let _ = writeln!(
                    out,
                    "  [{:4}] {:?} frame={} target={} ro={} maps={}",
                    i, e.state, e.frame.0, e.target, e.readonly, e.readers
                );
            }
        }
        drop(slots);
        for (handle, r) in self.maptrack.lock().records.iter() {
            let _ = writeln!(
                out,
                "  handle {}: grantor={} ref={} ro={} va={:#x}",
                handle, r.grantor, r.gref, r.readonly, r.va.0
            );
        }
        out
    }
}

// ============================================================================
// Cross-domain operations
// ============================================================================

impl DomainRegistry {
    pub fn grant_access(
        &self,
        domain: DomainId,
        frame: FrameId,
        target: DomainId,
        readonly: bool,
    ) -> Result<GrantRef, AvzError> {
        self.live_domain(domain)?
            .gnttab()
            .grant_access(frame, target, readonly)
    }

    pub fn end_access(&self, domain: DomainId, gref: GrantRef) -> Result<(), AvzError> {
        self.domain(domain)?.gnttab().end_access(gref)
    }

    pub fn query_usage(&self, domain: DomainId, gref: GrantRef) -> Result<GrantUsage, AvzError> {
        self.domain(domain)?.gnttab().query_usage(gref)
    }

    /// Map entry `index` of `grantor`'s table into `mapper`
    pub fn map_grant(
        &self,
        mapper: DomainId,
        grantor: DomainId,
        index: u32,
        readonly: bool,
    ) -> Result<GrantMapping, AvzError> {
        let mapping_domain = self.live_domain(mapper)?;
        let granting_domain = self.live_domain(grantor)?;
        let access = if readonly {
            Access::ReadOnly
        } else {
            Access::ReadWrite
        };
        let memory = self.memory();
        let (gref, va) = granting_domain.gnttab().pin(mapper, index, readonly, |frame| {
            Ok(memory.map_foreign_page(frame, grantor, access)?)
        })?;
        let handle = mapping_domain.gnttab().track(MapRecord {
            grantor,
            gref,
            readonly,
            va,
        });
        debug!(%mapper, %grantor, %gref, %handle, va = va.0, "map_grant");
        Ok(GrantMapping { handle, va })
    }

    /// Undo `map_grant`
    pub fn unmap_grant(&self, mapper: DomainId, handle: GrantHandle) -> Result<(), AvzError> {
        let mapping_domain = self.domain(mapper)?;
        let record = mapping_domain.gnttab().untrack(handle)?;
        if let Ok(granting_domain) = self.domain(record.grantor) {
            granting_domain.gnttab().unpin(record.gref, record.readonly)?;
        }
        self.memory().unmap(record.va)?;
        debug!(%mapper, grantor = %record.grantor, gref = %record.gref, %handle, "unmap_grant");
        Ok(())
    }

    /// Drop every mapping a dying domain still holds
    pub(crate) fn gnttab_release_mappings(&self, mapper: DomainId) {
        let Ok(dom) = self.domain(mapper) else {
            return;
        };
        for handle in dom.gnttab().mapped_handles() {
            if let Err(e) = self.unmap_grant(mapper, handle) {
                warn!(domain = %mapper, %handle, error = %e, "unmap on teardown failed");
            }
        }
    }
}
