//! Property tests: the reaction table and a backend driven by arbitrary
//! peer states.

mod common;

use common::{fixture, ME, NIL};
use proptest::prelude::*;
use soo_avz_core::check_all_invariants;
use soo_vbus::{react, target_state, Reaction, Role, VbusState};

fn state() -> impl Strategy<Value = VbusState> {
    proptest::sample::select(VbusState::ALL.to_vec())
}

fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Frontend), Just(Role::Backend)]
}

proptest! {
    #[test]
    fn test_reactions_stay_on_their_side(role in role(), local in state(), peer in state()) {
        let reaction = react(role, local, peer);
        match role {
            Role::Frontend => prop_assert!(!matches!(
                reaction,
                Reaction::SetupRing { .. } | Reaction::Suspended
            ), "frontend produced backend reaction {:?}", reaction),
            Role::Backend => prop_assert!(!matches!(
                reaction,
                Reaction::Probe | Reaction::Suspend | Reaction::Resume
            ), "backend produced frontend reaction {:?}", reaction),
        }
        if peer == VbusState::Unknown || local == VbusState::Closed {
            prop_assert_eq!(reaction, Reaction::Stay);
        }
        if let Some(next) = target_state(reaction) {
            prop_assert_ne!(next, VbusState::Unknown);
            prop_assert_ne!(next, VbusState::Closing);
        }
    }

    #[test]
    fn test_peer_leaving_always_closes(role in role(), local in state()) {
        prop_assume!(!local.is_terminal());
        for peer in [VbusState::Closing, VbusState::Closed] {
            prop_assert_eq!(react(role, local, peer), Reaction::Close);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_backend_survives_arbitrary_peer(peers in proptest::collection::vec(state(), 1..8)) {
        let fx = fixture();
        let node = "/device/2/vdummy/0";
        fx.store.mkdir_p(NIL, node).unwrap();
        fx.store.write_u32(NIL, &format!("{node}/state"), 1).unwrap();
        let back = fx.agency.populate_devices(ME).unwrap().remove(0);

        let mut closed = false;
        for peer in peers {
            fx.store.write_u32(NIL, &format!("{node}/state"), peer.as_u32()).unwrap();
            fx.store.flush().unwrap();

            let local = back.state();
            if closed {
                prop_assert_eq!(local, VbusState::Closed);
            }
            closed = local == VbusState::Closed;
            if !back.is_removed() {
                prop_assert_eq!(fx.read_state("/backend/vdummy/2/0"), local);
            }
        }
        prop_assert!(check_all_invariants(&fx.registry).is_empty());
    }
}
