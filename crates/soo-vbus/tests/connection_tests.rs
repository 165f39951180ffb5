//! Frontend/backend handshake, data path, suspend and resume.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{fixture, AGENCY, DEVTYPE, ME, NIL, WAIT};
use soo_avz_core::{ChannelId, DomainId, EventHandler};
use soo_vbus::{paths, VbusError, VbusState};

#[test]
fn test_handshake_publishes_ring_and_connects() {
    let fx = fixture();
    // Channels 1 and 2 of the ME are taken by something else
    fx.registry.evtchn_alloc_unbound(ME, AGENCY).unwrap();
    fx.registry.evtchn_alloc_unbound(ME, AGENCY).unwrap();

    let front = fx.me.add_frontend(DEVTYPE, 0, AGENCY).unwrap();
    assert_eq!(front.state(), VbusState::Initialising);
    assert_eq!(front.nodename(), "/device/2/vdummy/0");
    assert_eq!(front.otherend(), "/backend/vdummy/2/0");

    let back = fx.agency.probe_backend(DEVTYPE, ME, 0).unwrap();
    back.wait_for_state(VbusState::Connected, WAIT).unwrap();
    front.wait_for_state(VbusState::Connected, WAIT).unwrap();

    assert_eq!(fx.read("/device/2/vdummy/0/ring-ref"), "7");
    assert_eq!(fx.read("/device/2/vdummy/0/ring-evtchn"), "3");
    assert_eq!(fx.read("/device/2/vdummy/0/backend"), "/backend/vdummy/2/0");
    assert_eq!(fx.read("/device/2/vdummy/0/backend-id"), "0");
    assert_eq!(fx.read("/backend/vdummy/2/0/frontend"), "/device/2/vdummy/0");
    assert_eq!(fx.read("/backend/vdummy/2/0/frontend-id"), "2");
    assert_eq!(fx.read("/device/2/vdummy/0/state"), "4");
    assert_eq!(fx.read("/backend/vdummy/2/0/state"), "4");

    assert_eq!(front.ring_ref().map(|g| g.index), Some(7));
    assert_eq!(front.evtchn(), Some(ChannelId(3)));
    assert!(back.ring_mapping().is_some());
    assert!(back.evtchn().is_some());

    assert_eq!(fx.frontend.count("probe"), 1);
    assert_eq!(fx.frontend.count("connected"), 1);
    assert_eq!(fx.backend.count("probe"), 1);
    assert_eq!(fx.backend.count("reconfigured"), 1);
    assert_eq!(fx.backend.count("connected"), 1);
}

#[test]
fn test_notify_wakes_peer_handler() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();

    let (tx, rx) = crossbeam_channel::unbounded();
    let handler: EventHandler = Arc::new(move |channel| {
        let _ = tx.send(channel);
    });
    back.set_event_handler(handler).unwrap();
    fx.registry.start_dispatcher(AGENCY).unwrap();

    front.notify().unwrap();
    let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(Some(fired), back.evtchn());
}

#[test]
fn test_requests_and_responses_cross_the_ring() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();

    {
        let _guard = front.begin_processing().unwrap();
        let notify = front
            .with_front_ring(|ring| {
                ring.push_request(b"ping")?;
                ring.push_request(b"pong")?;
                ring.push_requests_and_check_notify()
            })
            .unwrap();
        assert!(notify);
        front.notify().unwrap();
    }
    assert_eq!(
        fx.registry.evtchn_dispatch_pending(AGENCY).unwrap(),
        vec![back.evtchn().unwrap()]
    );

    {
        let _guard = back.begin_processing().unwrap();
        let requests = back
            .with_back_ring(|ring| {
                let mut seen = Vec::new();
                while let Some(request) = ring.pop_request()? {
                    ring.push_response(&request)?;
                    seen.push(request);
                }
                ring.push_responses_and_check_notify()?;
                Ok(seen)
            })
            .unwrap();
        assert_eq!(requests, vec![b"ping".to_vec(), b"pong".to_vec()]);
    }

    let responses = front
        .with_front_ring(|ring| {
            let mut seen = Vec::new();
            while let Some(response) = ring.pop_response()? {
                seen.push(response);
            }
            Ok(seen)
        })
        .unwrap();
    assert_eq!(responses, vec![b"ping".to_vec(), b"pong".to_vec()]);
}

#[test]
fn test_suspend_resume_keeps_grant_and_channels() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();
    let gref = front.ring_ref();
    let front_channel = front.evtchn();
    let back_channel = back.evtchn();
    let mapping = back.ring_mapping();

    assert_eq!(fx.agency.suspend_all_devices(ME).unwrap(), 1);
    assert_eq!(back.state(), VbusState::Suspended);
    front.wait_for_state(VbusState::Suspended, WAIT).unwrap();
    assert!(front.try_begin_processing().is_none());
    assert_eq!(fx.frontend.count("suspend"), 1);
    assert_eq!(fx.backend.count("suspend"), 1);

    // Nothing to suspend a second time
    assert_eq!(fx.agency.suspend_all_devices(ME).unwrap(), 0);

    assert_eq!(fx.agency.resume_all_devices(ME).unwrap(), 1);
    front.wait_for_state(VbusState::Connected, WAIT).unwrap();
    assert_eq!(back.state(), VbusState::Connected);
    assert!(front.try_begin_processing().is_some());

    assert_eq!(front.ring_ref(), gref);
    assert_eq!(front.evtchn(), front_channel);
    assert_eq!(back.evtchn(), back_channel);
    assert_eq!(back.ring_mapping(), mapping);
    assert_eq!(fx.read("/device/2/vdummy/0/ring-ref"), "7");
}

#[test]
fn test_suspend_waits_for_data_path_holders() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();

    let guard = front.begin_processing().unwrap();
    assert_eq!(front.processing_active(), 1);

    let agency = fx.agency.clone();
    let suspender = thread::spawn(move || agency.suspend_all_devices(ME));

    back.wait_for_state(VbusState::Suspending, WAIT).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(front.state(), VbusState::Connected);

    drop(guard);
    assert_eq!(suspender.join().unwrap().unwrap(), 1);
    front.wait_for_state(VbusState::Suspended, WAIT).unwrap();
    assert_eq!(front.processing_active(), 0);
}

#[test]
fn test_drain_does_not_stall_other_devices() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();

    let guard = front.begin_processing().unwrap();
    let agency = fx.agency.clone();
    let suspender = thread::spawn(move || agency.suspend_all_devices(ME));
    back.wait_for_state(VbusState::Suspending, WAIT).unwrap();

    // vdummy/1 connects while vdummy/0 is still draining
    let front1 = fx.me.add_frontend(DEVTYPE, 1, AGENCY).unwrap();
    let back1 = fx.agency.probe_backend(DEVTYPE, ME, 1).unwrap();
    back1.wait_for_state(VbusState::Connected, WAIT).unwrap();
    front1.wait_for_state(VbusState::Connected, WAIT).unwrap();
    assert_eq!(front.state(), VbusState::Connected);
    assert!(!suspender.is_finished());

    drop(guard);
    assert_eq!(suspender.join().unwrap().unwrap(), 1);
    front.wait_for_state(VbusState::Suspended, WAIT).unwrap();
    assert_eq!(front1.state(), VbusState::Connected);
    assert_eq!(back1.state(), VbusState::Connected);
}

#[test]
fn test_reconfigure_reaches_suspended_backend() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();
    let gref = front.ring_ref();
    let front_channel = front.evtchn();
    let back_channel = back.evtchn();

    assert_eq!(fx.agency.suspend_all_devices(ME).unwrap(), 1);
    front.wait_for_state(VbusState::Suspended, WAIT).unwrap();

    assert_eq!(fx.me.reconfigure_all_devices().unwrap(), 1);
    back.wait_for_state(VbusState::Connected, WAIT).unwrap();
    front.wait_for_state(VbusState::Connected, WAIT).unwrap();
    assert!(back.last_error().is_none());
    assert_eq!(fx.backend.count("reconfigured"), 2);

    // Both ends kept their ids
    assert_eq!(front.ring_ref(), gref);
    assert_eq!(front.evtchn(), front_channel);
    assert_eq!(back.evtchn(), back_channel);

    back.notify().unwrap();
    assert_eq!(
        fx.registry.evtchn_dispatch_pending(ME).unwrap(),
        vec![front_channel.unwrap()]
    );
}

#[test]
fn test_begin_processing_blocks_until_resume() {
    let fx = fixture();
    let (front, _back) = fx.connected_pair();
    fx.agency.suspend_all_devices(ME).unwrap();
    front.wait_for_state(VbusState::Suspended, WAIT).unwrap();

    let waiter = {
        let front = front.clone();
        thread::spawn(move || {
            let admitted = front
                .begin_processing_timeout(Duration::from_secs(5))
                .map(|_guard| ());
            admitted
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    fx.agency.resume_all_devices(ME).unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(()));
}

#[test]
fn test_suspended_channel_holds_notifications() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();
    fx.agency.suspend_all_devices(ME).unwrap();
    front.wait_for_state(VbusState::Suspended, WAIT).unwrap();

    back.notify().unwrap();
    assert!(fx.registry.evtchn_dispatch_pending(ME).unwrap().is_empty());

    fx.agency.resume_all_devices(ME).unwrap();
    front.wait_for_state(VbusState::Connected, WAIT).unwrap();
    assert_eq!(
        fx.registry.evtchn_dispatch_pending(ME).unwrap(),
        vec![front.evtchn().unwrap()]
    );
}

#[test]
fn test_backend_probe_failure_can_be_retried() {
    let fx = fixture();
    let front = fx.me.add_frontend(DEVTYPE, 0, AGENCY).unwrap();
    fx.backend.fail_probe(true);

    let err = fx.agency.probe_backend(DEVTYPE, ME, 0).unwrap_err();
    assert!(matches!(err, VbusError::ConnectionSetupFailed { .. }));
    let back = fx.agency.device("/backend/vdummy/2/0").unwrap();
    assert_eq!(back.state(), VbusState::Initialising);
    assert_eq!(front.state(), VbusState::Initialising);

    fx.backend.fail_probe(false);
    fx.agency.retry_probe(back.nodename()).unwrap();
    back.wait_for_state(VbusState::Connected, WAIT).unwrap();
    front.wait_for_state(VbusState::Connected, WAIT).unwrap();
    assert_eq!(fx.backend.count("probe"), 2);
}

#[test]
fn test_device_paths_and_lookup() {
    let fx = fixture();
    let (front, back) = fx.connected_pair();
    assert_eq!(back.nodename(), paths::backend_node(DEVTYPE, ME, 0));
    assert_eq!(back.otherend_id(), ME);
    assert_eq!(front.otherend_id(), AGENCY);
    assert!(fx.agency.device(back.nodename()).is_some());
    assert_eq!(fx.agency.devices_of(ME).len(), 1);
    assert!(fx.me.devices_of(DomainId(5)).is_empty());
    assert!(fx.store.exists(NIL, "/backend/vdummy/2/0/state").unwrap());
    assert!(fx.agency.dump().contains("/backend/vdummy/2/0"));

    // A second frontend on the same node is refused
    assert_eq!(
        fx.me.add_frontend(DEVTYPE, 0, AGENCY).unwrap_err(),
        VbusError::DeviceExists("/device/2/vdummy/0".into())
    );
}
