//! Connection states and endpoint roles
//!
//! The state of each endpoint travels through the store as the decimal
//! ordinal of [`VbusState`] under `<nodename>/state`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State published by one end of a split device
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum VbusState {
    /// No state published yet
    Unknown = 0,
    Initialising = 1,
    /// Backend ready, waiting for the frontend's ring details
    InitWait = 2,
    /// Frontend published its ring details
    Initialised = 3,
    Connected = 4,
    /// Teardown requested
    Closing = 5,
    Closed = 6,
    /// Frontend re-published its ring after migration
    Reconfiguring = 7,
    /// Backend re-mapped the ring after migration
    Reconfigured = 8,
    Suspending = 9,
    Suspended = 10,
    Resuming = 11,
}

impl VbusState {
    pub const ALL: [VbusState; 12] = [
        VbusState::Unknown,
        VbusState::Initialising,
        VbusState::InitWait,
        VbusState::Initialised,
        VbusState::Connected,
        VbusState::Closing,
        VbusState::Closed,
        VbusState::Reconfiguring,
        VbusState::Reconfigured,
        VbusState::Suspending,
        VbusState::Suspended,
        VbusState::Resuming,
    ];

    pub fn from_u32(value: u32) -> Option<VbusState> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            VbusState::Unknown => "Unknown",
            VbusState::Initialising => "Initialising",
            VbusState::InitWait => "InitWait",
            VbusState::Initialised => "Initialised",
            VbusState::Connected => "Connected",
            VbusState::Closing => "Closing",
            VbusState::Closed => "Closed",
            VbusState::Reconfiguring => "Reconfiguring",
            VbusState::Reconfigured => "Reconfigured",
            VbusState::Suspending => "Suspending",
            VbusState::Suspended => "Suspended",
            VbusState::Resuming => "Resuming",
        }
    }

    /// Closing or Closed
    pub fn is_terminal(self) -> bool {
        matches!(self, VbusState::Closing | VbusState::Closed)
    }
}

impl fmt::Display for VbusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VbusState {
    type Err = ();

    /// Parse the decimal ordinal found in the store
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .ok()
            .and_then(VbusState::from_u32)
            .ok_or(())
    }
}

/// Which end of the split device an endpoint is
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Consumer side, lives in the Mobile Entity and owns the ring page
    Frontend,
    /// Provider side, lives in the Agency and maps the ring
    Backend,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Frontend => Role::Backend,
            Role::Backend => Role::Frontend,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Frontend => f.write_str("frontend"),
            Role::Backend => f.write_str("backend"),
        }
    }
}
