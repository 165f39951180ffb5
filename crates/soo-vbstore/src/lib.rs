//! VBStore - watched, transactional key/value tree
//!
//! Split devices exchange their setup parameters (grant references, event
//! channel ids, connection states) through this store. It holds one tree of
//! named nodes, each with an optional string value and a list of watchers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Store                              │
//! │                                                              │
//! │   write/read/mkdir/rm ──► Mutex<Tree + open transactions>    │
//! │                                   │                          │
//! │                                   │ WatchEvent (never inline)│
//! │                                   ▼                          │
//! │                         crossbeam unbounded queue            │
//! │                                   │                          │
//! │                                   ▼                          │
//! │                         vbs-watch thread ──► callbacks       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Transaction ids, watch handles and events
//! - `path` - Path normalization and helpers
//! - `tree` - Generation-checked node arena
//! - `watch` - Watch delivery worker
//! - `store` - The [`Store`] and its operations
//! - `layout` - Well-known paths and the initial layout

pub mod error;
pub mod layout;
pub mod path;
pub mod store;
mod tree;
pub mod types;
mod watch;

pub use error::VbsError;
pub use layout::{
    StoreLayout, BACKEND_ROOT, DEVICE_ROOT, DIRECTCOMM_ROOT, DOMAIN_ROOT, GNTTAB_ROOT, ME_ROOT,
    SOO_ROOT,
};
pub use path::{join_path, normalize_path, parent_path};
pub use store::{InvariantViolation, Store};
pub use types::{NodeId, TxId, WatchCallback, WatchEvent, WatchHandle};
