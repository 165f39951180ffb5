//! Processing gate
//!
//! Data-plane work on a device runs between `begin` and the drop of the
//! returned [`ProcessingGuard`]. The gate only admits work while the device
//! is connected and not parked, and a suspend parks the gate and waits for
//! every admitted holder to leave before the device may report Suspended.
//!
//! ```text
//!   begin ──► wait until open ──► active += 1 ──► guard
//!                                                   │ drop
//!   park  ──► no new holders ──► wait active == 0   ▼
//!                                             active -= 1, wake parkers
//! ```
//!
//! Closing the gate wakes every waiter with the error it was closed with.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::VbusError;

#[derive(Debug, Default)]
struct GateState {
    connected: bool,
    parked: bool,
    active: u32,
    closed: Option<VbusError>,
}

impl GateState {
    fn is_open(&self) -> bool {
        self.connected && !self.parked
    }
}

#[derive(Debug, Default)]
pub struct ProcessingGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ProcessingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one holder, blocking until the device is connected
    pub fn begin(&self) -> Result<ProcessingGuard<'_>, VbusError> {
        let mut state = self.state.lock();
        loop {
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }
            if state.is_open() {
                state.active += 1;
                return Ok(ProcessingGuard { gate: self });
            }
            self.cond.wait(&mut state);
        }
    }

    /// Like `begin`, giving up after `timeout`
    ///
    /// `on_timeout` builds the error returned when the deadline passes.
    pub fn begin_timeout(
        &self,
        timeout: Duration,
        on_timeout: impl FnOnce() -> VbusError,
    ) -> Result<ProcessingGuard<'_>, VbusError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }
            if state.is_open() {
                state.active += 1;
                return Ok(ProcessingGuard { gate: self });
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() && !state.is_open() {
                return Err(state.closed.clone().unwrap_or_else(on_timeout));
            }
        }
    }

    /// Admit one holder only if the gate is open right now
    pub fn try_begin(&self) -> Option<ProcessingGuard<'_>> {
        let mut state = self.state.lock();
        if state.closed.is_none() && state.is_open() {
            state.active += 1;
            Some(ProcessingGuard { gate: self })
        } else {
            None
        }
    }

    fn end(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.cond.notify_all();
        }
    }

    /// Mark the device connected and unparked, releasing blocked holders
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.connected = true;
        state.parked = false;
        self.cond.notify_all();
    }

    /// Stop admitting holders without waiting for the current ones
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Stop admitting holders and wait until the active ones have left
    ///
    /// Returns the close error if the gate is closed while waiting.
    pub fn park(&self) -> Result<(), VbusError> {
        let mut state = self.state.lock();
        state.parked = true;
        while state.active > 0 {
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }
            self.cond.wait(&mut state);
        }
        Ok(())
    }

    /// Close for good; current and future waiters get `reason`
    pub fn close(&self, reason: VbusError) {
        let mut state = self.state.lock();
        state.connected = false;
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        self.cond.notify_all();
    }

    pub fn active(&self) -> u32 {
        self.state.lock().active
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.closed.is_none() && state.is_open()
    }

    pub fn is_parked(&self) -> bool {
        self.state.lock().parked
    }
}

/// One admitted data-plane holder; leaves the gate on drop
#[derive(Debug)]
pub struct ProcessingGuard<'a> {
    gate: &'a ProcessingGate,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.gate.end();
    }
}
