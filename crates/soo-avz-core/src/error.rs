//! Error types for event channels, grant tables and the domain registry.

use soo_hal::HalError;

use crate::types::{ChannelId, DomainId, GrantHandle, GrantRef, VirqId};

/// Errors from AVZ operations.
///
/// Every operation returns these as values; nothing in this crate panics on a
/// caller mistake since most calls may come from notification context.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AvzError {
    /// Every channel slot of the domain is in use
    #[error("domain {domain}: no event channels available")]
    NoChannelsAvailable { domain: DomainId },

    /// Channel id out of range or not allocated
    #[error("domain {domain}: invalid channel {channel}")]
    InvalidChannel { domain: DomainId, channel: ChannelId },

    /// Remote channel is neither unbound for us nor already paired with us
    #[error("domain {domain}: channel {channel} is not bindable from here")]
    InvalidRemoteState { domain: DomainId, channel: ChannelId },

    /// Close on a channel that is already free
    #[error("domain {domain}: channel {channel} already closed")]
    AlreadyClosed { domain: DomainId, channel: ChannelId },

    /// Target slot of a re-bind is held by something else
    #[error("domain {domain}: channel {channel} is busy")]
    ChannelBusy { domain: DomainId, channel: ChannelId },

    /// Virq number outside the configured range
    #[error("invalid virq {0}")]
    InvalidVirq(VirqId),

    /// Virq already has a channel in this domain
    #[error("domain {domain}: virq {virq} already bound")]
    VirqInUse { domain: DomainId, virq: VirqId },

    /// Free list exhausted
    #[error("domain {domain}: out of grant entries")]
    OutOfGrants { domain: DomainId },

    /// Grant reference out of range, stale, or in the wrong state
    #[error("domain {domain}: invalid grant reference {gref}")]
    InvalidGrant { domain: DomainId, gref: GrantRef },

    /// Entry is still mapped by its target
    #[error("domain {domain}: grant {gref} still in use")]
    StillInUse { domain: DomainId, gref: GrantRef },

    /// Mapper is not the grant target, or asked for write on a read-only grant
    #[error("domain {domain}: access to grant {index} denied")]
    AccessDenied { domain: DomainId, index: u32 },

    /// Unknown mapping handle
    #[error("domain {domain}: unknown grant handle {handle}")]
    InvalidHandle { domain: DomainId, handle: GrantHandle },

    /// Grant table free list found inconsistent; the table refuses further updates
    #[error("domain {domain}: grant table corrupted: {detail}")]
    Corrupted { domain: DomainId, detail: String },

    /// Domain not registered
    #[error("domain {0} not found")]
    DomainNotFound(DomainId),

    /// Domain already registered
    #[error("domain {0} already exists")]
    DomainExists(DomainId),

    /// Domain id outside the configured range
    #[error("domain {0} out of range")]
    InvalidDomain(DomainId),

    /// Domain is being torn down
    #[error("domain {0} is dying")]
    DomainDying(DomainId),

    /// Memory layer failure
    #[error("memory layer: {0}")]
    Memory(#[from] HalError),

    /// Worker thread could not be started
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(String),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AvzError {
    /// Exhaustion and in-use conditions the caller is expected to retry or queue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AvzError::NoChannelsAvailable { .. }
                | AvzError::OutOfGrants { .. }
                | AvzError::StillInUse { .. }
                | AvzError::AlreadyClosed { .. }
        )
    }

    /// Invariant violations that disable the affected table.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AvzError::Corrupted { .. })
    }
}
