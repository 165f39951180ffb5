//! Store behavior under concurrent writers and random operation sequences.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use soo_vbstore::{TxId, WatchEvent};

const NIL: TxId = TxId::NIL;

#[test]
fn test_no_missed_notifications_under_concurrent_writers() {
    let store = Arc::new(common::store());
    store.mkdir_p(NIL, "/device/2/vdummy/0").unwrap();
    store.write(NIL, "/device/2/vdummy/0/state", "0").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handle = store.register_watcher(Arc::new(move |_: &WatchEvent| {
        h.fetch_add(1, Ordering::SeqCst);
    }));
    store.watch("/device/2/vdummy/0/state", handle).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    store
                        .write(NIL, "/device/2/vdummy/0/state", &format!("{}", t * 100 + i))
                        .unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    store.flush().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 400);
}

#[test]
fn test_last_delivered_event_matches_final_value() {
    let store = Arc::new(common::store());
    store.write(NIL, "/soo/me/state", "0").unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let weak = Arc::downgrade(&store);
    let s = seen.clone();
    let handle = store.register_watcher(Arc::new(move |e: &WatchEvent| {
        if let Some(store) = weak.upgrade() {
            if let Ok(v) = store.read(NIL, &e.path) {
                s.lock().push(v);
            }
        }
    }));
    store.watch("/soo/me/state", handle).unwrap();

    for i in 1..=20 {
        store.write(NIL, "/soo/me/state", &i.to_string()).unwrap();
    }
    store.flush().unwrap();
    let seen = seen.lock();
    assert_eq!(seen.len(), 20);
    assert_eq!(seen.last().map(String::as_str), Some("20"));
}

#[test]
fn test_transactions_are_independent() {
    let store = common::store();
    store.write(NIL, "/soo/me/a", "0").unwrap();
    store.write(NIL, "/soo/me/b", "0").unwrap();
    let (tx_events, rx_events) = crossbeam_channel::unbounded();
    let handle = store.register_watcher(Arc::new(move |e: &WatchEvent| {
        let _ = tx_events.send(e.watched.clone());
    }));
    store.watch("/soo/me/a", handle).unwrap();
    store.watch("/soo/me/b", handle).unwrap();

    let t1 = store.transaction_start();
    let t2 = store.transaction_start();
    assert_ne!(t1, t2);
    store.write(t1, "/soo/me/a", "1").unwrap();
    store.write(t2, "/soo/me/b", "1").unwrap();

    store.transaction_end(t2).unwrap();
    store.flush().unwrap();
    assert_eq!(rx_events.try_iter().collect::<Vec<_>>(), vec!["/soo/me/b"]);

    store.transaction_end(t1).unwrap();
    store.flush().unwrap();
    assert_eq!(rx_events.try_iter().collect::<Vec<_>>(), vec!["/soo/me/a"]);
}

#[test]
fn test_rm_inside_transaction_discards_held_events() {
    let store = common::store();
    store.mkdir(NIL, "/device/3").unwrap();
    store.write(NIL, "/device/3/state", "1").unwrap();
    let (tx_events, rx_events) = crossbeam_channel::unbounded();
    let handle = store.register_watcher(Arc::new(move |e: &WatchEvent| {
        let _ = tx_events.send(e.clone());
    }));
    store.watch("/device/3/state", handle).unwrap();

    let tx = store.transaction_start();
    store.write(tx, "/device/3/state", "5").unwrap();
    store.rm(tx, "/device/3").unwrap();
    store.transaction_end(tx).unwrap();
    store.flush().unwrap();
    assert!(rx_events.try_recv().is_err());
    assert!(store.check_invariants().is_empty());
}

#[derive(Clone, Debug)]
enum Op {
    Write(usize, usize, u8),
    Mkdir(usize, usize),
    Rm(usize),
}

const DIRS: [&str; 3] = ["/device/a", "/device/b", "/device/a/c"];
const LEAVES: [&str; 3] = ["state", "ring-ref", "ring-evtchn"];

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..DIRS.len(), 0..LEAVES.len(), any::<u8>()).prop_map(|(d, l, v)| Op::Write(d, l, v)),
        (0..DIRS.len(), 0..LEAVES.len()).prop_map(|(d, l)| Op::Mkdir(d, l)),
        (0..DIRS.len()).prop_map(Op::Rm),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn store_matches_flat_model(ops in prop::collection::vec(op(), 1..60)) {
        let store = common::store();
        // path -> Some(value) for leaves, None for directories
        let mut model: BTreeMap<String, Option<String>> = BTreeMap::new();
        model.insert("/device".to_string(), None);

        for op in ops {
            match op {
                Op::Mkdir(d, _) => {
                    let dir = DIRS[d];
                    let parent = soo_vbstore::parent_path(dir).to_string();
                    let result = store.mkdir(NIL, dir);
                    if model.contains_key(&parent) {
                        prop_assert!(result.is_ok());
                        model.entry(dir.to_string()).or_insert(None);
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
                Op::Write(d, l, v) => {
                    let path = format!("{}/{}", DIRS[d], LEAVES[l]);
                    let result = store.write(NIL, &path, &v.to_string());
                    if model.contains_key(DIRS[d]) {
                        prop_assert!(result.is_ok());
                        model.insert(path, Some(v.to_string()));
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
                Op::Rm(d) => {
                    let dir = DIRS[d];
                    store.rm(NIL, dir).unwrap();
                    model.retain(|p, _| !soo_vbstore::path::is_under(p, dir));
                }
            }

            for (path, value) in &model {
                prop_assert!(store.exists(NIL, path).unwrap());
                if let Some(v) = value {
                    prop_assert_eq!(&store.read(NIL, path).unwrap(), v);
                }
            }
            for dir in DIRS {
                prop_assert_eq!(store.exists(NIL, dir).unwrap(), model.contains_key(dir));
            }
            prop_assert!(store.check_invariants().is_empty());
        }
    }
}
