//! Transition table
//!
//! Pure mapping from (role, local state, peer state) to what the local end
//! does next. Any combination missing from the table is a protocol
//! violation.
//!
//! ```text
//!   frontend                               backend
//!   Initialising                           InitWait
//!        │ peer InitWait: Probe                │
//!   Initialised ──────────────────────► peer Initialised: SetupRing
//!        │                                 Connected
//!        │ peer Connected: Connect ◄───────────┘
//!   Connected
//!
//!   Connected ◄── peer Suspending: Suspend    Suspending (external)
//!   Suspended ─────────────────────────► peer Suspended: Suspended
//!        │ peer Resuming: Resume            Resuming (external)
//!   Connected ─────────────────────────► peer Connected: Connect
//!
//!   Reconfiguring (after migration) ───► peer Reconfiguring: SetupRing
//!        │                                  (from InitWait or Suspended)
//!        │ peer Reconfigured: Connect       Reconfigured
//!   Connected ─────────────────────────► peer Connected: Connect
//! ```

use crate::state::{Role, VbusState};

/// Reaction of the local end to a new peer state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reaction {
    /// Nothing to do
    Stay,
    /// Frontend: allocate and grant the ring, publish its details, go Initialised
    Probe,
    /// Backend: map the peer's ring, bind its channel, go to `next`
    SetupRing { next: VbusState },
    /// Go Connected and open the data path
    Connect,
    /// Frontend: drain and park the data path, go Suspended
    Suspend,
    /// Backend: the frontend acknowledged the suspend, go Suspended
    Suspended,
    /// Frontend: reopen the data path, go Connected
    Resume,
    /// Peer is closing or gone: release the ring and publish Closed
    Close,
    /// Peer confirmed our close: release and remove the local node
    Finish,
    /// No edge for this combination
    Violation,
}

/// Look up the reaction of a `role` endpoint in state `local` to `peer`
pub fn react(role: Role, local: VbusState, peer: VbusState) -> Reaction {
    use VbusState::*;

    match (local, peer) {
        (Closed, _) => return Reaction::Stay,
        (Closing, Closed) => return Reaction::Finish,
        // Both ends asked to close at once
        (Closing, Closing) => return Reaction::Close,
        (Closing, _) => return Reaction::Stay,
        (_, Closing | Closed) => return Reaction::Close,
        (_, Unknown) => return Reaction::Stay,
        _ => {}
    }

    match role {
        Role::Frontend => match (local, peer) {
            (Initialising, Initialising) => Reaction::Stay,
            (Initialising, InitWait) => Reaction::Probe,
            (Initialised, InitWait) => Reaction::Stay,
            (Initialised, Connected) => Reaction::Connect,
            (Connected, Connected | Resuming | Reconfigured) => Reaction::Stay,
            (Connected, Suspending) => Reaction::Suspend,
            (Suspended, Suspending | Suspended) => Reaction::Stay,
            (Suspended, Resuming) => Reaction::Resume,
            // Backend restarted on another node, wait to be reconfigured
            (Suspended, Initialising | InitWait) => Reaction::Stay,
            (Reconfiguring, Initialising | InitWait | Suspended) => Reaction::Stay,
            (Reconfiguring, Reconfigured) => Reaction::Connect,
            _ => Reaction::Violation,
        },
        Role::Backend => match (local, peer) {
            (Initialising | InitWait, Initialising) => Reaction::Stay,
            (InitWait, Initialised) => Reaction::SetupRing { next: Connected },
            // Fresh backend after migration, or one left suspended while the frontend moved
            (Initialising | InitWait | Suspended, Reconfiguring) => {
                Reaction::SetupRing { next: Reconfigured }
            }
            (Connected, Initialised | Connected) => Reaction::Stay,
            (Reconfigured, Reconfiguring) => Reaction::Stay,
            (Reconfigured, Connected) => Reaction::Connect,
            (Suspending, Connected) => Reaction::Stay,
            (Suspending, Suspended) => Reaction::Suspended,
            (Suspended, Suspended) => Reaction::Stay,
            (Resuming, Suspended) => Reaction::Stay,
            (Resuming, Connected) => Reaction::Connect,
            _ => Reaction::Violation,
        },
    }
}

/// State the local end publishes after a successful reaction, if any
pub fn target_state(reaction: Reaction) -> Option<VbusState> {
    match reaction {
        Reaction::Stay | Reaction::Violation => None,
        Reaction::Probe => Some(VbusState::Initialised),
        Reaction::SetupRing { next } => Some(next),
        Reaction::Connect | Reaction::Resume => Some(VbusState::Connected),
        Reaction::Suspend | Reaction::Suspended => Some(VbusState::Suspended),
        Reaction::Close | Reaction::Finish => Some(VbusState::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VbusState::*;

    #[test]
    fn test_handshake_edges() {
        assert_eq!(react(Role::Frontend, Initialising, InitWait), Reaction::Probe);
        assert_eq!(
            react(Role::Backend, InitWait, Initialised),
            Reaction::SetupRing { next: Connected }
        );
        assert_eq!(react(Role::Frontend, Initialised, Connected), Reaction::Connect);
        assert_eq!(react(Role::Backend, Connected, Connected), Reaction::Stay);
    }

    #[test]
    fn test_suspend_resume_edges() {
        assert_eq!(react(Role::Frontend, Connected, Suspending), Reaction::Suspend);
        assert_eq!(react(Role::Backend, Suspending, Suspended), Reaction::Suspended);
        assert_eq!(react(Role::Frontend, Suspended, Resuming), Reaction::Resume);
        assert_eq!(react(Role::Backend, Resuming, Connected), Reaction::Connect);
    }

    #[test]
    fn test_reconfigure_edges() {
        assert_eq!(
            react(Role::Backend, InitWait, Reconfiguring),
            Reaction::SetupRing { next: Reconfigured }
        );
        assert_eq!(react(Role::Frontend, Reconfiguring, Reconfigured), Reaction::Connect);
        assert_eq!(react(Role::Backend, Reconfigured, Connected), Reaction::Connect);
    }

    #[test]
    fn test_suspended_backend_accepts_reconfigure() {
        assert_eq!(
            react(Role::Backend, Suspended, Reconfiguring),
            Reaction::SetupRing { next: Reconfigured }
        );
        assert_eq!(react(Role::Frontend, Reconfiguring, Suspended), Reaction::Stay);
        assert_eq!(react(Role::Backend, Suspending, Reconfiguring), Reaction::Violation);
    }

    #[test]
    fn test_close_edges() {
        for role in [Role::Frontend, Role::Backend] {
            assert_eq!(react(role, Connected, Closing), Reaction::Close);
            assert_eq!(react(role, Suspended, Closed), Reaction::Close);
            assert_eq!(react(role, Closing, Closed), Reaction::Finish);
            assert_eq!(react(role, Closing, Connected), Reaction::Stay);
            assert_eq!(react(role, Closing, Closing), Reaction::Close);
            assert_eq!(react(role, Closed, Initialised), Reaction::Stay);
        }
    }

    #[test]
    fn test_off_table_is_violation() {
        assert_eq!(react(Role::Backend, InitWait, Suspended), Reaction::Violation);
        assert_eq!(react(Role::Backend, Connected, Suspended), Reaction::Violation);
        assert_eq!(react(Role::Frontend, Initialising, Connected), Reaction::Violation);
        assert_eq!(react(Role::Frontend, Connected, InitWait), Reaction::Violation);
    }

    #[test]
    fn test_unknown_peer_is_ignored() {
        for role in [Role::Frontend, Role::Backend] {
            for local in VbusState::ALL {
                assert_eq!(react(role, local, Unknown), Reaction::Stay);
            }
        }
    }

    #[test]
    fn test_target_states() {
        assert_eq!(target_state(Reaction::Probe), Some(Initialised));
        assert_eq!(
            target_state(Reaction::SetupRing { next: Reconfigured }),
            Some(Reconfigured)
        );
        assert_eq!(target_state(Reaction::Suspend), Some(Suspended));
        assert_eq!(target_state(Reaction::Violation), None);
    }
}
