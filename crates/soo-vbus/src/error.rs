//! Error types for split-device connections.

use soo_avz_core::{AvzError, DomainId};
use soo_hal::HalError;
use soo_vbstore::VbsError;

use crate::state::{Role, VbusState};

/// Errors from vbus operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VbusError {
    /// Event channel or grant table failure
    #[error(transparent)]
    Avz(#[from] AvzError),

    /// Store failure
    #[error(transparent)]
    Store(#[from] VbsError),

    /// Memory layer failure
    #[error("memory layer: {0}")]
    Memory(#[from] HalError),

    /// Peer published a state the transition table has no edge for
    #[error("{nodename}: peer moved to {peer} while local state is {local}")]
    ProtocolViolation {
        nodename: String,
        local: VbusState,
        peer: VbusState,
    },

    /// Ring or channel setup failed; the device keeps its last valid state
    #[error("{nodename}: connection setup failed: {reason}")]
    ConnectionSetupFailed { nodename: String, reason: String },

    /// The domain at either end is being torn down
    #[error("domain {domain} terminated")]
    DomainTerminated { domain: DomainId },

    /// The device has been closed
    #[error("{0}: device closed")]
    DeviceClosed(String),

    /// No driver registered for this device type and role
    #[error("no {role} driver for {devtype}")]
    NoDriver { devtype: String, role: Role },

    /// A device with this node name already exists on the bus
    #[error("{0}: device already exists")]
    DeviceExists(String),

    /// No device with this node name on the bus
    #[error("{0}: no such device")]
    DeviceNotFound(String),

    /// Operation not valid in the device's current state
    #[error("{nodename}: not allowed in state {state}")]
    InvalidState { nodename: String, state: VbusState },

    /// The device has no ring attached yet
    #[error("{0}: ring not set up")]
    RingNotReady(String),

    /// No free slot to produce into
    #[error("ring full")]
    RingFull,

    /// Payload larger than a ring slot
    #[error("payload of {len} bytes exceeds a ring slot")]
    PayloadTooLarge { len: usize },

    /// Shared ring indices or slot headers make no sense
    #[error("ring corrupted: {0}")]
    RingCorrupted(String),

    /// A wait gave up before the device reached the expected state
    #[error("{nodename}: timed out waiting for {expected}")]
    Timeout {
        nodename: String,
        expected: VbusState,
    },

    /// Failure reported by a device driver callback
    #[error("driver: {0}")]
    Driver(String),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A device worker thread could not be started
    #[error("{nodename}: cannot start worker: {reason}")]
    Worker { nodename: String, reason: String },
}

impl VbusError {
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    pub(crate) fn setup_failed(nodename: &str, reason: impl ToString) -> Self {
        Self::ConnectionSetupFailed {
            nodename: nodename.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Conditions the caller may retry after the peer or resources change.
    pub fn is_recoverable(&self) -> bool {
        match self {
            VbusError::Avz(e) => e.is_recoverable(),
            VbusError::Store(e) => e.is_not_found(),
            VbusError::ConnectionSetupFailed { .. }
            | VbusError::RingFull
            | VbusError::RingNotReady(_)
            | VbusError::Timeout { .. }
            | VbusError::Worker { .. } => true,
            _ => false,
        }
    }

    /// Conditions that end the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            VbusError::Avz(e) => e.is_fatal(),
            VbusError::ProtocolViolation { .. }
            | VbusError::RingCorrupted(_)
            | VbusError::DomainTerminated { .. }
            | VbusError::DeviceClosed(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let violation = VbusError::ProtocolViolation {
            nodename: "/backend/vdummy/2/0".into(),
            local: VbusState::InitWait,
            peer: VbusState::Suspended,
        };
        assert!(violation.is_fatal());
        assert!(!violation.is_recoverable());

        let exhausted: VbusError = AvzError::OutOfGrants {
            domain: DomainId(2),
        }
        .into();
        assert!(exhausted.is_recoverable());
        assert!(!exhausted.is_fatal());

        let missing: VbusError = VbsError::NotFound("/device/2".into()).into();
        assert!(missing.is_recoverable());

        assert!(VbusError::setup_failed("/device/2/vdummy/0", "no ring-ref").is_recoverable());
    }

    #[test]
    fn test_display() {
        let violation = VbusError::ProtocolViolation {
            nodename: "/backend/vdummy/2/0".into(),
            local: VbusState::InitWait,
            peer: VbusState::Suspended,
        };
        assert_eq!(
            violation.to_string(),
            "/backend/vdummy/2/0: peer moved to Suspended while local state is InitWait"
        );
        assert_eq!(
            VbusError::NoDriver {
                devtype: "vuart".into(),
                role: Role::Backend
            }
            .to_string(),
            "no backend driver for vuart"
        );
    }
}
