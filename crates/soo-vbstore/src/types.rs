//! Identifiers shared by the store modules.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Transaction identifier. [`TxId::NIL`] runs an operation outside any
/// transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u32);

impl TxId {
    pub const NIL: TxId = TxId(0);
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered watch listener. One handle may watch any number of nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchHandle(pub u64);

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Arena slot of a node. The generation changes every time the slot is
/// reused, so an id kept across an `rm` stops resolving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub index: u32,
    pub generation: u32,
}

/// Notification delivered to a watch listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub handle: WatchHandle,
    /// Node the watch is attached to
    pub watched: String,
    /// Path whose write triggered the event; a child path when the write
    /// created a child of the watched node
    pub path: String,
}

/// Listener callback, run on the watch worker thread
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;
