//! The store
//!
//! One structural lock guards the node tree and the open transactions.
//! Writes notify asynchronously: the events of a write are queued while the
//! lock is held, so listeners observe writes in the order they applied, and
//! callbacks run later on the watch worker with no store lock held.
//!
//! # Notification rules
//!
//! - Writing a value to an existing node fires that node's watchers, whether
//!   the value changed or not.
//! - Creating a node (`write` or `mkdir`) fires the watchers of its parent.
//! - `rm` fires nothing; watchers in the removed subtree are dropped.
//! - Inside an open transaction, events are held back and deduplicated per
//!   (listener, watched node) until `transaction_end`.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::VbsError;
use crate::path::{filename, is_under, join_path, normalize_path, parent_path};
use crate::tree::Tree;
use crate::types::{NodeId, TxId, WatchCallback, WatchEvent, WatchHandle};
use crate::watch::{Listeners, WatchWorker};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

struct StoreState {
    tree: Tree,
    next_tx: u32,
    /// Events held back by each open transaction
    transactions: BTreeMap<TxId, Vec<WatchEvent>>,
}

/// Hierarchical key/value store with watches and transactions
pub struct Store {
    state: Mutex<StoreState>,
    listeners: Listeners,
    worker: WatchWorker,
    next_handle: AtomicU64,
}

impl Store {
    /// Create a store holding only the root and start its watch worker
    pub fn new() -> Result<Self, VbsError> {
        let listeners = Listeners::default();
        let worker = WatchWorker::spawn(listeners.clone())?;
        Ok(Self {
            state: Mutex::new(StoreState {
                tree: Tree::new(),
                next_tx: 1,
                transactions: BTreeMap::new(),
            }),
            listeners,
            worker,
            next_handle: AtomicU64::new(1),
        })
    }

    fn lock_tx(&self, tx: TxId) -> Result<MutexGuard<'_, StoreState>, VbsError> {
        let state = self.state.lock();
        if tx != TxId::NIL && !state.transactions.contains_key(&tx) {
            return Err(VbsError::InvalidTransaction(tx));
        }
        Ok(state)
    }

    fn dispatch(&self, event: WatchEvent) {
        if let Err(e) = self.worker.fire(event) {
            debug!(error = %e, "watch event dropped");
        }
    }

    /// Queue, or hold back under `tx`, an event for every watcher of `node`
    fn notify(&self, state: &mut StoreState, tx: TxId, node: NodeId, path: &str) {
        let Some(handles) = state
            .tree
            .get(node)
            .filter(|n| !n.watchers.is_empty())
            .map(|n| n.watchers.clone())
        else {
            return;
        };
        let Some(watched) = state.tree.path_of(node) else {
            return;
        };

        for handle in handles {
            let event = WatchEvent {
                handle,
                watched: watched.clone(),
                path: path.to_string(),
            };
            if tx == TxId::NIL {
                self.dispatch(event);
                continue;
            }
            let Some(pending) = state.transactions.get_mut(&tx) else {
                continue;
            };
            match pending
                .iter_mut()
                .find(|e| e.handle == handle && e.watched == watched)
            {
                Some(held) => held.path = event.path,
                None => pending.push(event),
            }
        }
    }

    /// Create `path` under its existing parent, firing the parent's watchers
    fn create(
        &self,
        state: &mut StoreState,
        tx: TxId,
        path: &str,
        value: Option<String>,
    ) -> Result<(), VbsError> {
        let Some(parent) = state.tree.lookup(parent_path(path)) else {
            warn!(%path, "parent missing");
            return Err(VbsError::ParentNotFound(path.to_string()));
        };
        if state.tree.insert(parent, filename(path), value).is_none() {
            return Err(VbsError::ParentNotFound(path.to_string()));
        }
        self.notify(state, tx, parent, path);
        Ok(())
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Set the value of `path`, creating the leaf if needed
    ///
    /// The parent must already exist; ancestors are never created.
    pub fn write(&self, tx: TxId, path: &str, value: &str) -> Result<(), VbsError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(VbsError::invalid_path("cannot write the root"));
        }
        let mut state = self.lock_tx(tx)?;
        match state.tree.lookup(&path) {
            Some(id) => {
                if let Some(node) = state.tree.get_mut(id) {
                    node.value = Some(value.to_string());
                }
                self.notify(&mut state, tx, id, &path);
            }
            None => self.create(&mut state, tx, &path, Some(value.to_string()))?,
        }
        debug!(%tx, %path, value, "write");
        Ok(())
    }

    /// Value of `path`
    pub fn read(&self, tx: TxId, path: &str) -> Result<String, VbsError> {
        let path = normalize_path(path)?;
        let state = self.lock_tx(tx)?;
        let id = state
            .tree
            .lookup(&path)
            .ok_or_else(|| VbsError::NotFound(path.clone()))?;
        let value = state
            .tree
            .get(id)
            .and_then(|n| n.value.clone())
            .ok_or_else(|| VbsError::NoValue(path.clone()))?;
        trace!(%tx, %path, %value, "read");
        Ok(value)
    }

    /// Create a valueless node under an existing parent. Idempotent.
    pub fn mkdir(&self, tx: TxId, path: &str) -> Result<(), VbsError> {
        let path = normalize_path(path)?;
        let mut state = self.lock_tx(tx)?;
        if state.tree.lookup(&path).is_some() {
            return Ok(());
        }
        self.create(&mut state, tx, &path, None)?;
        debug!(%tx, %path, "mkdir");
        Ok(())
    }

    /// Create `path` and every missing ancestor
    pub fn mkdir_p(&self, tx: TxId, path: &str) -> Result<(), VbsError> {
        let path = normalize_path(path)?;
        let mut state = self.lock_tx(tx)?;
        let mut current = String::from("/");
        for component in crate::path::components(&path) {
            current = join_path(&current, component);
            if state.tree.lookup(&current).is_none() {
                self.create(&mut state, tx, &current, None)?;
            }
        }
        debug!(%tx, %path, "mkdir_p");
        Ok(())
    }

    /// Remove `path` and everything below it
    ///
    /// Watches attached in the subtree are dropped without firing. Removing a
    /// missing path is a no-op.
    pub fn rm(&self, tx: TxId, path: &str) -> Result<(), VbsError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(VbsError::invalid_path("cannot remove the root"));
        }
        let mut state = self.lock_tx(tx)?;
        let Some(id) = state.tree.lookup(&path) else {
            debug!(%tx, %path, "rm of missing node");
            return Ok(());
        };
        let freed = state.tree.remove(id);
        for pending in state.transactions.values_mut() {
            pending.retain(|e| !is_under(&e.watched, &path));
        }
        debug!(%tx, %path, freed, "rm");
        Ok(())
    }

    /// Child names of `path` in creation order
    pub fn directory(&self, tx: TxId, path: &str) -> Result<Vec<String>, VbsError> {
        let path = normalize_path(path)?;
        let state = self.lock_tx(tx)?;
        let id = state
            .tree
            .lookup(&path)
            .ok_or_else(|| VbsError::NotFound(path.clone()))?;
        let node = state.tree.get(id).ok_or(VbsError::NotFound(path))?;
        Ok(node
            .children
            .iter()
            .filter_map(|c| state.tree.get(*c).map(|n| n.key.clone()))
            .collect())
    }

    pub fn exists(&self, tx: TxId, path: &str) -> Result<bool, VbsError> {
        let path = normalize_path(path)?;
        let state = self.lock_tx(tx)?;
        Ok(state.tree.lookup(&path).is_some())
    }

    /// True when `path` exists and is a directory: it has children or no value
    pub fn dir_exists(&self, tx: TxId, path: &str) -> Result<bool, VbsError> {
        let path = normalize_path(path)?;
        let state = self.lock_tx(tx)?;
        Ok(state
            .tree
            .lookup(&path)
            .and_then(|id| state.tree.get(id))
            .is_some_and(|n| n.value.is_none() || !n.children.is_empty()))
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    pub fn read_u32(&self, tx: TxId, path: &str) -> Result<u32, VbsError> {
        let value = self.read(tx, path)?;
        value.trim().parse().map_err(|_| VbsError::Parse {
            path: path.to_string(),
            value,
        })
    }

    pub fn write_u32(&self, tx: TxId, path: &str, value: u32) -> Result<(), VbsError> {
        self.write(tx, path, &value.to_string())
    }

    /// Read `dir/key` for every key, failing on the first missing one
    pub fn gather(&self, tx: TxId, dir: &str, keys: &[&str]) -> Result<Vec<String>, VbsError> {
        let dir = normalize_path(dir)?;
        keys.iter()
            .map(|key| self.read(tx, &join_path(&dir, key)))
            .collect()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction. Operations under it apply immediately; only
    /// their notifications wait for `transaction_end`.
    pub fn transaction_start(&self) -> TxId {
        let mut state = self.state.lock();
        loop {
            let tx = TxId(state.next_tx);
            state.next_tx = state.next_tx.wrapping_add(1);
            if tx != TxId::NIL && !state.transactions.contains_key(&tx) {
                state.transactions.insert(tx, Vec::new());
                trace!(%tx, "transaction_start");
                return tx;
            }
        }
    }

    /// Close `tx` and queue the notifications it held back
    pub fn transaction_end(&self, tx: TxId) -> Result<(), VbsError> {
        let mut state = self.state.lock();
        let pending = state
            .transactions
            .remove(&tx)
            .ok_or(VbsError::InvalidTransaction(tx))?;
        let count = pending.len();
        for event in pending {
            self.dispatch(event);
        }
        trace!(%tx, events = count, "transaction_end");
        Ok(())
    }

    // ========================================================================
    // Watches
    // ========================================================================

    /// Register a listener. It fires for every node it is later attached to
    /// with [`Store::watch`].
    pub fn register_watcher(&self, callback: WatchCallback) -> WatchHandle {
        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(handle, callback);
        handle
    }

    /// Attach `handle` to the node at `path`
    pub fn watch(&self, path: &str, handle: WatchHandle) -> Result<(), VbsError> {
        let path = normalize_path(path)?;
        let mut state = self.state.lock();
        if !self.listeners.contains(handle) {
            return Err(VbsError::UnknownHandle(handle));
        }
        let id = state
            .tree
            .lookup(&path)
            .ok_or_else(|| VbsError::NotFound(path.clone()))?;
        if let Some(node) = state.tree.get_mut(id) {
            if !node.watchers.contains(&handle) {
                node.watchers.push(handle);
            }
        }
        debug!(%path, %handle, "watch");
        Ok(())
    }

    /// Detach `handle` from `path`. Returns false if it was not attached.
    pub fn unwatch(&self, path: &str, handle: WatchHandle) -> Result<bool, VbsError> {
        let path = normalize_path(path)?;
        let mut state = self.state.lock();
        let Some(node) = state.tree.lookup(&path).and_then(|id| state.tree.get_mut(id)) else {
            return Ok(false);
        };
        let before = node.watchers.len();
        node.watchers.retain(|h| *h != handle);
        let removed = node.watchers.len() != before;
        if removed {
            debug!(%path, %handle, "unwatch");
        }
        Ok(removed)
    }

    /// Detach `handle` everywhere and unregister it. Events already queued
    /// for it are dropped at delivery. Returns the number of watches removed.
    pub fn remove_watches_for(&self, handle: WatchHandle) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        for node in state.tree.watched_nodes_mut() {
            let before = node.watchers.len();
            node.watchers.retain(|h| *h != handle);
            removed += before - node.watchers.len();
        }
        for pending in state.transactions.values_mut() {
            pending.retain(|e| e.handle != handle);
        }
        self.listeners.remove(handle);
        debug!(%handle, removed, "remove_watches_for");
        removed
    }

    /// Paths `handle` is attached to
    pub fn watched_paths(&self, handle: WatchHandle) -> Vec<String> {
        let state = self.state.lock();
        state
            .tree
            .watched_nodes()
            .filter(|(_, n)| n.watchers.contains(&handle))
            .filter_map(|(id, _)| state.tree.path_of(id))
            .collect()
    }

    /// Wait until every notification queued so far has been delivered.
    /// Returns at once when called from a watch callback.
    pub fn flush(&self) -> Result<(), VbsError> {
        self.worker.flush()
    }

    /// Deliver queued notifications and stop the watch worker. Later writes
    /// still apply but notify nobody.
    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn node_count(&self) -> usize {
        self.state.lock().tree.len()
    }

    /// Structural invariants: a single root, every other node has exactly
    /// one parent and is reachable from the root, and every attached
    /// watcher is a registered listener
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let state = self.state.lock();
        let mut violations: Vec<InvariantViolation> = state
            .tree
            .check()
            .into_iter()
            .map(|description| InvariantViolation {
                invariant: "tree_structure",
                description,
            })
            .collect();
        for (id, node) in state.tree.watched_nodes() {
            for handle in &node.watchers {
                if !self.listeners.contains(*handle) {
                    violations.push(InvariantViolation {
                        invariant: "watch_listeners",
                        description: format!(
                            "{} watched by unregistered {}",
                            state.tree.path_of(id).unwrap_or_default(),
                            handle
                        ),
                    });
                }
            }
        }
        violations
    }

    /// Indented listing of the whole tree
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        let mut stack = vec![(state.tree.root(), 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = state.tree.get(id) else {
                continue;
            };
            let name = if depth == 0 { "/" } else { node.key.as_str() };
            let _ = match &node.value {
                Some(v) => writeln!(out, "{:indent$}{} = {:?}", "", name, v, indent = depth * 2),
                None => writeln!(out, "{:indent$}{}", "", name, indent = depth * 2),
            };
            for child in node.children.iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
        out
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shutdown();
    }
}
