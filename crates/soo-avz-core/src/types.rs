//! Core AVZ types
//!
//! Identifiers and plain-data descriptors shared by the event channel and
//! grant table layers. Nothing here holds a lock.

use std::fmt;

use serde::{Deserialize, Serialize};

pub use soo_hal::{DomainId, FrameId, VirtualAddress};

/// The Agency control domain.
pub const DOMID_AGENCY: DomainId = DomainId::AGENCY;

/// Channel 0 is never handed out.
pub const RESERVED_CHANNEL: ChannelId = ChannelId(0);

/// Periodic timer virq.
pub const VIRQ_TIMER: VirqId = VirqId(0);

/// Realtime timer virq.
pub const VIRQ_TIMER_RT: VirqId = VirqId(1);

/// Event channel identifier, local to one domain
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual IRQ source number
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirqId(pub u32);

impl fmt::Display for VirqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event channel state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Slot available for allocation
    Free,
    /// Never allocated (channel 0)
    Reserved,
    /// Allocated, waiting for `remote` to bind
    Unbound { remote: DomainId },
    /// Paired with a channel of another domain
    Interdomain {
        remote_domain: DomainId,
        remote_channel: ChannelId,
    },
    /// Attached to a local virtual IRQ source
    Virq { virq: VirqId },
}

impl ChannelState {
    pub fn is_free(&self) -> bool {
        matches!(self, ChannelState::Free)
    }
}

/// Snapshot of one channel, returned by `status`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: ChannelId,
    pub state: ChannelState,
    pub pending: bool,
    pub masked: bool,
}

/// Grant reference
///
/// `index` is the slot in the grantor's table and is what travels through the
/// store. `generation` is bumped every time the slot returns to the free list,
/// so a reference kept after `end_access` no longer matches its slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantRef {
    pub index: u32,
    pub generation: u32,
}

impl GrantRef {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Grant entry state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantState {
    /// On the free list
    Free,
    /// Kept out of the free list for the platform
    Reserved,
    /// Taken into a private pool, not yet granted
    Claimed,
    /// Granted to a remote domain, not mapped
    Granted,
    /// Granted and mapped by the remote domain at least once
    Mapped,
}

/// Result of `query_usage`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantUsage {
    pub read_in_progress: bool,
    pub write_in_progress: bool,
}

impl GrantUsage {
    pub fn in_use(&self) -> bool {
        self.read_in_progress || self.write_in_progress
    }
}

/// Handle of one foreign mapping, local to the mapping domain
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantHandle(pub u32);

impl fmt::Display for GrantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live foreign mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrantMapping {
    pub handle: GrantHandle,
    pub va: VirtualAddress,
}

/// Identifier of a registered free-grant callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(pub u64);
