//! Watch delivery worker.
//!
//! Writers never run callbacks. They push [`WatchEvent`]s onto an unbounded
//! queue drained by a single `vbs-watch` thread, so events reach listeners
//! in the order the writes were applied.
//!
//! ```text
//!   write ──► tree lock ──► queue.send(event) ──► vbs-watch ──► callback(event)
//!                                      flush ──►  ack once everything before it ran
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::VbsError;
use crate::types::{WatchCallback, WatchEvent, WatchHandle};

pub(crate) enum WatchMsg {
    Fire(WatchEvent),
    Flush(Sender<()>),
    Shutdown,
}

/// Registered listeners, shared with the worker
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    inner: Arc<Mutex<BTreeMap<WatchHandle, WatchCallback>>>,
}

impl Listeners {
    pub(crate) fn insert(&self, handle: WatchHandle, callback: WatchCallback) {
        self.inner.lock().insert(handle, callback);
    }

    pub(crate) fn remove(&self, handle: WatchHandle) -> bool {
        self.inner.lock().remove(&handle).is_some()
    }

    pub(crate) fn contains(&self, handle: WatchHandle) -> bool {
        self.inner.lock().contains_key(&handle)
    }

    fn get(&self, handle: WatchHandle) -> Option<WatchCallback> {
        self.inner.lock().get(&handle).cloned()
    }
}

pub(crate) struct WatchWorker {
    tx: Sender<WatchMsg>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl WatchWorker {
    pub(crate) fn spawn(listeners: Listeners) -> Result<Self, VbsError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name("vbs-watch".to_string())
            .spawn(move || run(rx, listeners))
            .map_err(|e| VbsError::ThreadSpawn(e.to_string()))?;
        let thread_id = thread.thread().id();
        debug!("watch worker started");
        Ok(Self {
            tx,
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    /// Queue an event. Never blocks.
    pub(crate) fn fire(&self, event: WatchEvent) -> Result<(), VbsError> {
        self.tx
            .send(WatchMsg::Fire(event))
            .map_err(|_| VbsError::ShutDown)
    }

    pub(crate) fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Wait until every event queued before this call has been delivered
    pub(crate) fn flush(&self) -> Result<(), VbsError> {
        if self.on_worker_thread() {
            // Everything queued earlier already ran or is running below us
            return Ok(());
        }
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(WatchMsg::Flush(ack_tx))
            .map_err(|_| VbsError::ShutDown)?;
        ack_rx.recv().map_err(|_| VbsError::ShutDown)
    }

    /// Deliver what is queued, then stop the worker. Idempotent.
    pub(crate) fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(WatchMsg::Shutdown);
        if thread.thread().id() != thread::current().id() {
            let _ = thread.join();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }
}

fn run(rx: Receiver<WatchMsg>, listeners: Listeners) {
    for msg in rx.iter() {
        match msg {
            WatchMsg::Fire(event) => match listeners.get(event.handle) {
                Some(callback) => {
                    trace!(handle = %event.handle, path = %event.path, "watch fired");
                    callback(&event);
                }
                None => trace!(handle = %event.handle, "event for removed listener dropped"),
            },
            WatchMsg::Flush(ack) => {
                let _ = ack.send(());
            }
            WatchMsg::Shutdown => break,
        }
    }
    debug!("watch worker stopped");
}
