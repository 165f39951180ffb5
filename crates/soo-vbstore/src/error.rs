//! Error types for the store.

use thiserror::Error;

use crate::types::{TxId, WatchHandle};

/// Errors from store operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum VbsError {
    /// No node at this path
    #[error("{0}: not found")]
    NotFound(String),

    /// Node exists but carries no value (a directory)
    #[error("{0}: node has no value")]
    NoValue(String),

    /// Parent of the node to create does not exist
    #[error("{0}: parent does not exist")]
    ParentNotFound(String),

    /// Malformed path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Transaction id not open
    #[error("transaction {0} is not open")]
    InvalidTransaction(TxId),

    /// Watch handle not registered
    #[error("watch handle {0} is not registered")]
    UnknownHandle(WatchHandle),

    /// Value could not be parsed as the requested type
    #[error("{path}: cannot parse {value:?}")]
    Parse {
        /// Path that was read
        path: String,
        /// Raw value found there
        value: String,
    },

    /// Watch delivery has been shut down
    #[error("store is shut down")]
    ShutDown,

    /// Layout configuration rejected
    #[error("invalid layout: {0}")]
    InvalidConfig(String),

    /// Watch worker could not be started
    #[error("cannot spawn watch worker: {0}")]
    ThreadSpawn(String),
}

impl VbsError {
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Missing node or value. Callers usually re-poll through a watch.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VbsError::NotFound(_) | VbsError::NoValue(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        assert!(VbsError::NotFound("/a".into()).is_not_found());
        assert!(VbsError::NoValue("/a".into()).is_not_found());
        assert!(!VbsError::ParentNotFound("/a/b".into()).is_not_found());
        assert!(!VbsError::ShutDown.is_not_found());
    }

    #[test]
    fn test_display() {
        let err = VbsError::Parse {
            path: "/device/2/vdummy/0/state".into(),
            value: "x".into(),
        };
        assert_eq!(err.to_string(), "/device/2/vdummy/0/state: cannot parse \"x\"");
        assert_eq!(
            VbsError::InvalidTransaction(TxId(4)).to_string(),
            "transaction 4 is not open"
        );
    }
}
