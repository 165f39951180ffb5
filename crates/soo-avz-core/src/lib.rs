//! AVZ core - event channels, grant tables and domains
//!
//! This crate holds the two per-domain tables of the SOO inter-domain
//! substrate and the registry that owns them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DomainRegistry                         │
//! │     create_domain / destroy_domain / cross-domain ops       │
//! │                                                             │
//! │   ┌────────────────────────┐   ┌────────────────────────┐   │
//! │   │ Domain 0 (Agency)      │   │ Domain 2 (ME)          │   │
//! │   │  EventChannelTable ◄───┼───┼──► EventChannelTable   │   │
//! │   │  GrantTable        ◄───┼───┼──► GrantTable          │   │
//! │   │  EventDispatcher       │   │  EventDispatcher       │   │
//! │   └────────────────────────┘   └────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ map_foreign_page / unmap
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 soo-hal MemoryLayer                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! - Each table has its own mutex; pending and mask bits are atomics.
//! - Operations holding two channel tables lock the lower domain id first.
//! - `notify` and grant free-list updates never wait on anything but a
//!   table mutex.
//!
//! # Module Organization
//!
//! - `types` - Identifiers and plain-data descriptors
//! - `evtchn` - Event channel table and cross-domain channel operations
//! - `dispatch` - Per-domain dispatcher thread and handler bindings
//! - `gnttab` - Grant table, deferred allocation callbacks, foreign mappings
//! - `domain` - `Domain` and `DomainRegistry`
//! - `invariants` - Runtime-checkable invariant assertions

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod evtchn;
pub mod gnttab;
pub mod invariants;
pub mod types;

pub use config::AvzConfig;
pub use dispatch::{EventDispatcher, EventHandler, EventHandlers};
pub use domain::{Domain, DomainRegistry};
pub use error::AvzError;
pub use evtchn::EventChannelTable;
pub use gnttab::{GrantAudit, GrantCallback, GrantPool, GrantTable};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use types::{
    CallbackId, ChannelId, ChannelState, ChannelStatus, DomainId, FrameId, GrantHandle,
    GrantMapping, GrantRef, GrantState, GrantUsage, VirqId, VirtualAddress, DOMID_AGENCY,
    RESERVED_CHANNEL, VIRQ_TIMER, VIRQ_TIMER_RT,
};
