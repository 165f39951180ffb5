//! Event channels
//!
//! Each domain owns one [`EventChannelTable`]: a slot vector of
//! [`ChannelState`] behind a mutex, plus pending and mask bitmaps kept as
//! atomics so that raising an event never needs the slot lock of the target.
//!
//! Operations that touch two domains (bind, close) live on
//! [`DomainRegistry`] and always lock the lower domain id first.
//!
//! ```text
//!   dom1                                   dom2
//!   ┌──────────────┐   notify(dom1, 5)     ┌──────────────┐
//!   │ 5: Interdom ─┼──────────────────────►│ 3: pending=1 │──► wake dispatcher
//!   │    (2, 3)    │                       │    (1, 5)    │
//!   └──────────────┘                       └──────────────┘
//! ```

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::domain::{Domain, DomainRegistry};
use crate::error::AvzError;
use crate::types::{ChannelId, ChannelState, ChannelStatus, DomainId, VirqId};

const WORD_BITS: u32 = 64;

fn bit(channel: ChannelId) -> (usize, u64) {
    (
        (channel.0 / WORD_BITS) as usize,
        1u64 << (channel.0 % WORD_BITS),
    )
}

/// Slot states of one domain, guarded by the table mutex
pub(crate) struct ChannelSlots {
    states: Vec<ChannelState>,
    virqs: Vec<Option<ChannelId>>,
}

impl ChannelSlots {
    fn get(&self, channel: ChannelId) -> Option<ChannelState> {
        self.states.get(channel.0 as usize).copied()
    }

    fn set(&mut self, channel: ChannelId, state: ChannelState) {
        if let Some(slot) = self.states.get_mut(channel.0 as usize) {
            *slot = state;
        }
    }

    /// Lowest free slot; channel 0 is reserved so the scan starts at 1
    fn first_free(&self) -> Option<ChannelId> {
        self.states
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, s)| s.is_free())
            .map(|(i, _)| ChannelId(i as u32))
    }
}

/// Per-domain event channel table
pub struct EventChannelTable {
    domain: DomainId,
    slots: Mutex<ChannelSlots>,
    pending: Box<[AtomicU64]>,
    masked: Box<[AtomicU64]>,
    /// Bounded(1): a full queue already means "dispatcher has work"
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl EventChannelTable {
    pub fn new(domain: DomainId, nr_evtchn: u32, nr_virqs: u32) -> Self {
        let words = nr_evtchn.div_ceil(WORD_BITS) as usize;
        let mut states = vec![ChannelState::Free; nr_evtchn as usize];
        if let Some(first) = states.first_mut() {
            *first = ChannelState::Reserved;
        }
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            domain,
            slots: Mutex::new(ChannelSlots {
                states,
                virqs: vec![None; nr_virqs as usize],
            }),
            pending: (0..words).map(|_| AtomicU64::new(0)).collect(),
            masked: (0..words).map(|_| AtomicU64::new(0)).collect(),
            wake_tx,
            wake_rx,
        }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn capacity(&self) -> u32 {
        self.slots.lock().states.len() as u32
    }

    pub(crate) fn lock_slots(&self) -> MutexGuard<'_, ChannelSlots> {
        self.slots.lock()
    }

    pub(crate) fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Kick the dispatcher without raising any channel
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn invalid(&self, channel: ChannelId) -> AvzError {
        AvzError::InvalidChannel {
            domain: self.domain,
            channel,
        }
    }

    /// Current state of `channel`
    pub fn state(&self, channel: ChannelId) -> Result<ChannelState, AvzError> {
        self.slots
            .lock()
            .get(channel)
            .ok_or_else(|| self.invalid(channel))
    }

    /// Reserve a channel that `remote` may later bind to
    pub fn alloc_unbound(&self, remote: DomainId) -> Result<ChannelId, AvzError> {
        let mut slots = self.slots.lock();
        let channel = slots.first_free().ok_or_else(|| {
            warn!(domain = %self.domain, "event channel table exhausted");
            AvzError::NoChannelsAvailable {
                domain: self.domain,
            }
        })?;
        slots.set(channel, ChannelState::Unbound { remote });
        debug!(domain = %self.domain, %channel, %remote, "alloc_unbound");
        Ok(channel)
    }

    /// Attach a fresh channel to virtual IRQ `virq`
    pub fn bind_virq(&self, virq: VirqId) -> Result<ChannelId, AvzError> {
        let mut slots = self.slots.lock();
        match slots.virqs.get(virq.0 as usize) {
            None => return Err(AvzError::InvalidVirq(virq)),
            Some(Some(_)) => {
                return Err(AvzError::VirqInUse {
                    domain: self.domain,
                    virq,
                })
            }
            Some(None) => {}
        }
        let channel = slots.first_free().ok_or(AvzError::NoChannelsAvailable {
            domain: self.domain,
        })?;
        slots.set(channel, ChannelState::Virq { virq });
        slots.virqs[virq.0 as usize] = Some(channel);
        debug!(domain = %self.domain, %channel, %virq, "bind_virq");
        Ok(channel)
    }

    /// Raise `virq`. Returns false when no channel is bound to it.
    pub fn send_virq(&self, virq: VirqId) -> Result<bool, AvzError> {
        let channel = {
            let slots = self.slots.lock();
            *slots
                .virqs
                .get(virq.0 as usize)
                .ok_or(AvzError::InvalidVirq(virq))?
        };
        match channel {
            Some(channel) => {
                self.raise(channel);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Set the pending bit of `channel`, waking the dispatcher on a 0 to 1
    /// edge of an unmasked channel. Returns true on that edge.
    pub(crate) fn raise(&self, channel: ChannelId) -> bool {
        let (word, mask) = bit(channel);
        let Some(pending) = self.pending.get(word) else {
            return false;
        };
        let prev = pending.fetch_or(mask, Ordering::AcqRel);
        let edge = prev & mask == 0;
        if edge && !self.is_masked(channel) {
            self.wake();
        }
        trace!(domain = %self.domain, %channel, edge, "raise");
        edge
    }

    fn clear_pending(&self, channel: ChannelId) {
        let (word, mask) = bit(channel);
        if let Some(pending) = self.pending.get(word) {
            pending.fetch_and(!mask, Ordering::AcqRel);
        }
    }

    fn clear_mask(&self, channel: ChannelId) {
        let (word, mask) = bit(channel);
        if let Some(masked) = self.masked.get(word) {
            masked.fetch_and(!mask, Ordering::AcqRel);
        }
    }

    pub fn is_pending(&self, channel: ChannelId) -> bool {
        let (word, mask) = bit(channel);
        self.pending
            .get(word)
            .is_some_and(|p| p.load(Ordering::Acquire) & mask != 0)
    }

    pub fn is_masked(&self, channel: ChannelId) -> bool {
        let (word, mask) = bit(channel);
        self.masked
            .get(word)
            .is_some_and(|m| m.load(Ordering::Acquire) & mask != 0)
    }

    /// Hold back delivery of `channel`; its pending bit is kept.
    pub fn mask(&self, channel: ChannelId) -> Result<(), AvzError> {
        self.state(channel)?;
        let (word, mask) = bit(channel);
        self.masked
            .get(word)
            .ok_or_else(|| self.invalid(channel))?
            .fetch_or(mask, Ordering::AcqRel);
        Ok(())
    }

    /// Re-enable delivery of `channel`, delivering a held notification.
    pub fn unmask(&self, channel: ChannelId) -> Result<(), AvzError> {
        self.state(channel)?;
        let (word, mask) = bit(channel);
        let (Some(masked), Some(pending)) = (self.masked.get(word), self.pending.get(word)) else {
            return Err(self.invalid(channel));
        };
        let prev = masked.fetch_and(!mask, Ordering::AcqRel);
        if prev & mask != 0 && pending.load(Ordering::Acquire) & mask != 0 {
            self.wake();
        }
        Ok(())
    }

    pub fn status(&self, channel: ChannelId) -> Result<ChannelStatus, AvzError> {
        let state = self.state(channel)?;
        Ok(ChannelStatus {
            channel,
            state,
            pending: self.is_pending(channel),
            masked: self.is_masked(channel),
        })
    }

    /// Consume pending, unmasked channels in ascending id order.
    ///
    /// A pass walks the whole bitmap; when it found anything another pass
    /// runs, up to `max_passes`, so that bits raised while the scan was in
    /// progress are picked up. Masked channels keep their pending bit.
    pub fn dispatch_pending(&self, max_passes: u32) -> Vec<ChannelId> {
        let mut fired = Vec::new();
        for _ in 0..max_passes {
            let mut found = false;
            for (word, (pending, masked)) in self.pending.iter().zip(self.masked.iter()).enumerate() {
                let ready = pending.load(Ordering::Acquire) & !masked.load(Ordering::Acquire);
                if ready == 0 {
                    continue;
                }
                let taken = pending.fetch_and(!ready, Ordering::AcqRel) & ready;
                let mut bits = taken;
                while bits != 0 {
                    let offset = bits.trailing_zeros();
                    bits &= bits - 1;
                    fired.push(ChannelId(word as u32 * WORD_BITS + offset));
                    found = true;
                }
            }
            if !found {
                break;
            }
        }
        if !fired.is_empty() {
            trace!(domain = %self.domain, count = fired.len(), "dispatch_pending");
        }
        fired
    }

    /// Return a slot to Free, dropping its pending bit and virq binding.
    pub(crate) fn release(&self, slots: &mut ChannelSlots, channel: ChannelId) {
        self.clear_pending(channel);
        self.clear_mask(channel);
        if let Some(ChannelState::Virq { virq }) = slots.get(channel) {
            if let Some(binding) = slots.virqs.get_mut(virq.0 as usize) {
                *binding = None;
            }
        }
        slots.set(channel, ChannelState::Free);
    }

    /// Copy of every slot state, indexed by channel id
    pub fn snapshot(&self) -> Vec<ChannelState> {
        self.slots.lock().states.clone()
    }

    /// Virq bindings, indexed by virq number
    pub fn virq_bindings(&self) -> Vec<Option<ChannelId>> {
        self.slots.lock().virqs.clone()
    }

    /// Human-readable listing of every allocated channel
    pub fn dump(&self) -> String {
        let states = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "event channels of domain {}:", self.domain);
        for (i, state) in states.iter().enumerate() {
            if matches!(state, ChannelState::Free | ChannelState::Reserved) {
                continue;
            }
            let channel = ChannelId(i as u32);
            let _ = writeln!(
                out,
                "  {:4}: {:?} pending={} masked={}",
                i,
                state,
                self.is_pending(channel) as u8,
                self.is_masked(channel) as u8
            );
        }
        out
    }
}

/// Lock two distinct tables, lower domain id first. Guards come back in
/// argument order.
fn lock_ordered<'a>(
    a: &'a EventChannelTable,
    b: &'a EventChannelTable,
) -> (MutexGuard<'a, ChannelSlots>, MutexGuard<'a, ChannelSlots>) {
    if a.domain < b.domain {
        let ga = a.slots.lock();
        let gb = b.slots.lock();
        (ga, gb)
    } else {
        let gb = b.slots.lock();
        let ga = a.slots.lock();
        (ga, gb)
    }
}

// ============================================================================
// Cross-domain operations
// ============================================================================

impl DomainRegistry {
    /// Allocate a channel in `domain` that `remote` may bind to
    pub fn evtchn_alloc_unbound(
        &self,
        domain: DomainId,
        remote: DomainId,
    ) -> Result<ChannelId, AvzError> {
        let dom = self.live_domain(domain)?;
        self.domain(remote)?;
        dom.evtchn().alloc_unbound(remote)
    }

    /// Bind a new local channel to `remote_channel` of `remote_domain`
    ///
    /// The remote channel must be unbound and waiting for `local_domain`. If
    /// it is already paired with a channel of `local_domain` that points back
    /// at it, the pairing was made by an earlier call and its channel is
    /// returned unchanged.
    pub fn evtchn_bind_interdomain(
        &self,
        local_domain: DomainId,
        remote_domain: DomainId,
        remote_channel: ChannelId,
    ) -> Result<ChannelId, AvzError> {
        let bad_remote = AvzError::InvalidRemoteState {
            domain: remote_domain,
            channel: remote_channel,
        };
        if local_domain == remote_domain {
            return Err(bad_remote);
        }
        let local = self.live_domain(local_domain)?;
        let remote = self.live_domain(remote_domain)?;

        let (mut mine, mut theirs) = lock_ordered(local.evtchn(), remote.evtchn());
        match theirs.get(remote_channel) {
            Some(ChannelState::Unbound { remote: waiting_for }) if waiting_for == local_domain => {
                let channel = mine.first_free().ok_or(AvzError::NoChannelsAvailable {
                    domain: local_domain,
                })?;
                mine.set(
                    channel,
                    ChannelState::Interdomain {
                        remote_domain,
                        remote_channel,
                    },
                );
                theirs.set(
                    remote_channel,
                    ChannelState::Interdomain {
                        remote_domain: local_domain,
                        remote_channel: channel,
                    },
                );
                debug!(
                    domain = %local_domain, %channel, remote = %remote_domain, %remote_channel,
                    "bind_interdomain"
                );
                Ok(channel)
            }
            Some(ChannelState::Interdomain {
                remote_domain: paired_domain,
                remote_channel: paired_channel,
            }) if paired_domain == local_domain
                && mine.get(paired_channel)
                    == Some(ChannelState::Interdomain {
                        remote_domain,
                        remote_channel,
                    }) =>
            {
                debug!(domain = %local_domain, channel = %paired_channel, "bind_interdomain: already paired");
                Ok(paired_channel)
            }
            _ => Err(bad_remote),
        }
    }

    /// Pair two known channel ids, used after migration to restore the
    /// identifiers a ring was set up with
    pub fn evtchn_bind_existing_interdomain(
        &self,
        local_domain: DomainId,
        local_channel: ChannelId,
        remote_domain: DomainId,
        remote_channel: ChannelId,
    ) -> Result<(), AvzError> {
        if local_domain == remote_domain {
            return Err(AvzError::InvalidRemoteState {
                domain: remote_domain,
                channel: remote_channel,
            });
        }
        let local = self.live_domain(local_domain)?;
        let remote = self.live_domain(remote_domain)?;
        let (mut mine, mut theirs) = lock_ordered(local.evtchn(), remote.evtchn());

        let want_local = ChannelState::Interdomain {
            remote_domain,
            remote_channel,
        };
        let want_remote = ChannelState::Interdomain {
            remote_domain: local_domain,
            remote_channel: local_channel,
        };
        let local_state = mine.get(local_channel).ok_or(AvzError::InvalidChannel {
            domain: local_domain,
            channel: local_channel,
        })?;
        let remote_state = theirs.get(remote_channel).ok_or(AvzError::InvalidChannel {
            domain: remote_domain,
            channel: remote_channel,
        })?;
        if local_state == want_local && remote_state == want_remote {
            return Ok(());
        }

        let reusable = |state: ChannelState, peer: DomainId| match state {
            ChannelState::Free => true,
            ChannelState::Unbound { remote } => remote == peer,
            _ => false,
        };
        if !reusable(local_state, remote_domain) {
            return Err(AvzError::ChannelBusy {
                domain: local_domain,
                channel: local_channel,
            });
        }
        if !reusable(remote_state, local_domain) {
            return Err(AvzError::ChannelBusy {
                domain: remote_domain,
                channel: remote_channel,
            });
        }

        mine.set(local_channel, want_local);
        theirs.set(remote_channel, want_remote);
        debug!(
            domain = %local_domain, channel = %local_channel,
            remote = %remote_domain, %remote_channel, "bind_existing_interdomain"
        );
        Ok(())
    }

    /// Close `channel` of `domain`
    ///
    /// An interdomain peer goes back to Unbound waiting for `domain`. Closing
    /// a free channel reports `AlreadyClosed`.
    pub fn evtchn_close(&self, domain: DomainId, channel: ChannelId) -> Result<(), AvzError> {
        let dom = self.domain(domain)?;
        self.close_on(&dom, channel)
    }

    fn close_on(&self, dom: &Domain, channel: ChannelId) -> Result<(), AvzError> {
        let domain = dom.id();
        let table = dom.evtchn();
        loop {
            let observed = table.state(channel)?;
            match observed {
                ChannelState::Free => {
                    return Err(AvzError::AlreadyClosed { domain, channel });
                }
                ChannelState::Reserved => {
                    return Err(AvzError::InvalidChannel { domain, channel });
                }
                ChannelState::Interdomain {
                    remote_domain,
                    remote_channel,
                } => {
                    let Ok(remote) = self.domain(remote_domain) else {
                        let mut slots = table.lock_slots();
                        if slots.get(channel) != Some(observed) {
                            continue;
                        }
                        table.release(&mut slots, channel);
                        return Ok(());
                    };
                    let (mut mine, mut theirs) = lock_ordered(table, remote.evtchn());
                    // Re-check: the slot may have changed while no lock was held
                    if mine.get(channel) != Some(observed) {
                        continue;
                    }
                    table.release(&mut mine, channel);
                    let back = ChannelState::Interdomain {
                        remote_domain: domain,
                        remote_channel: channel,
                    };
                    if theirs.get(remote_channel) == Some(back) {
                        remote.evtchn().clear_pending(remote_channel);
                        theirs.set(remote_channel, ChannelState::Unbound { remote: domain });
                    }
                    debug!(%domain, %channel, remote = %remote_domain, %remote_channel, "close interdomain");
                    return Ok(());
                }
                ChannelState::Unbound { .. } | ChannelState::Virq { .. } => {
                    let mut slots = table.lock_slots();
                    if slots.get(channel) != Some(observed) {
                        continue;
                    }
                    table.release(&mut slots, channel);
                    debug!(%domain, %channel, "close");
                    return Ok(());
                }
            }
        }
    }

    /// Signal the other end of `channel`
    ///
    /// Interdomain raises the peer's pending bit; Virq raises the local one;
    /// an Unbound channel has nobody to signal yet and is a no-op.
    pub fn evtchn_notify(&self, domain: DomainId, channel: ChannelId) -> Result<(), AvzError> {
        let dom = self.domain(domain)?;
        let table = dom.evtchn();
        // Held across the raise so a concurrent close cannot re-pair the peer slot
        let slots = table.lock_slots();
        match slots.get(channel) {
            Some(ChannelState::Interdomain {
                remote_domain,
                remote_channel,
            }) => {
                if let Ok(remote) = self.domain(remote_domain) {
                    remote.evtchn().raise(remote_channel);
                }
                Ok(())
            }
            Some(ChannelState::Virq { .. }) => {
                table.raise(channel);
                Ok(())
            }
            Some(ChannelState::Unbound { .. }) => Ok(()),
            Some(ChannelState::Free) | Some(ChannelState::Reserved) | None => {
                Err(AvzError::InvalidChannel { domain, channel })
            }
        }
    }

    pub fn evtchn_bind_virq(&self, domain: DomainId, virq: VirqId) -> Result<ChannelId, AvzError> {
        self.live_domain(domain)?.evtchn().bind_virq(virq)
    }

    pub fn evtchn_send_virq(&self, domain: DomainId, virq: VirqId) -> Result<bool, AvzError> {
        self.domain(domain)?.evtchn().send_virq(virq)
    }

    pub fn evtchn_status(
        &self,
        domain: DomainId,
        channel: ChannelId,
    ) -> Result<ChannelStatus, AvzError> {
        self.domain(domain)?.evtchn().status(channel)
    }

    pub fn evtchn_mask(&self, domain: DomainId, channel: ChannelId) -> Result<(), AvzError> {
        self.domain(domain)?.evtchn().mask(channel)
    }

    pub fn evtchn_unmask(&self, domain: DomainId, channel: ChannelId) -> Result<(), AvzError> {
        self.domain(domain)?.evtchn().unmask(channel)
    }

    /// Consume the pending channels of `domain`, see
    /// [`EventChannelTable::dispatch_pending`]
    pub fn evtchn_dispatch_pending(&self, domain: DomainId) -> Result<Vec<ChannelId>, AvzError> {
        Ok(self
            .domain(domain)?
            .evtchn()
            .dispatch_pending(self.config().dispatch_passes))
    }

    /// Close every channel of a dying domain
    pub(crate) fn evtchn_destroy(&self, dom: &Domain) {
        let states = dom.evtchn().snapshot();
        for (i, state) in states.iter().enumerate() {
            if matches!(state, ChannelState::Free | ChannelState::Reserved) {
                continue;
            }
            let channel = ChannelId(i as u32);
            match self.close_on(dom, channel) {
                Ok(()) | Err(AvzError::AlreadyClosed { .. }) => {}
                Err(e) => warn!(domain = %dom.id(), %channel, error = %e, "close on teardown failed"),
            }
        }
    }
}
