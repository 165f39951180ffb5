//! Per-domain event dispatcher thread.
//!
//! The dispatcher sleeps on the table's wake queue, drains
//! `dispatch_pending` and calls the handler bound to each fired channel.
//! Handlers run on the dispatcher thread, one at a time, in ascending channel
//! order within a pass.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::AvzError;
use crate::evtchn::EventChannelTable;
use crate::types::ChannelId;

/// Callback run for a fired channel
pub type EventHandler = Arc<dyn Fn(ChannelId) + Send + Sync>;

/// Channel to handler bindings of one domain
#[derive(Clone, Default)]
pub struct EventHandlers {
    inner: Arc<Mutex<BTreeMap<ChannelId, EventHandler>>>,
}

impl EventHandlers {
    pub fn bind(&self, channel: ChannelId, handler: EventHandler) {
        self.inner.lock().insert(channel, handler);
    }

    pub fn unbind(&self, channel: ChannelId) -> bool {
        self.inner.lock().remove(&channel).is_some()
    }

    pub fn get(&self, channel: ChannelId) -> Option<EventHandler> {
        self.inner.lock().get(&channel).cloned()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Running dispatcher; stopping joins the thread
pub struct EventDispatcher {
    stop: Arc<AtomicBool>,
    table: Arc<EventChannelTable>,
    thread: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn spawn(
        table: Arc<EventChannelTable>,
        handlers: EventHandlers,
        max_passes: u32,
    ) -> Result<Self, AvzError> {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = table.wake_receiver();
        let name = format!("evtchn-dom{}", table.domain());

        let thread = {
            let stop = stop.clone();
            let table = table.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || {
                    while wake.recv().is_ok() {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        for channel in table.dispatch_pending(max_passes) {
                            match handlers.get(channel) {
                                Some(handler) => handler(channel),
                                None => {
                                    trace!(domain = %table.domain(), %channel, "no handler bound")
                                }
                            }
                        }
                    }
                    debug!(domain = %table.domain(), "event dispatcher stopped");
                })
                .map_err(|e| AvzError::ThreadSpawn(e.to_string()))?
        };

        debug!(domain = %table.domain(), "event dispatcher started");
        Ok(Self {
            stop,
            table,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.table.wake();
        if let Some(thread) = self.thread.take() {
            // A handler tearing down its own domain cannot join itself
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
