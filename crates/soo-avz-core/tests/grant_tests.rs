//! Grant and foreign mapping tests over simulated memory.

mod common;

use std::sync::Arc;

use common::registry;
use soo_avz_core::{check_all_invariants, AvzError, DomainId, GrantState, GrantTable};
use soo_hal::{HalError, MemoryLayer};

const AGENCY: DomainId = DomainId(0);
const ME: DomainId = DomainId(2);

#[test]
fn test_shared_page_visible_through_mapping() {
    let (reg, mem) = registry(&[0, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let frame = mem.frame_of(va).unwrap();
    mem.page(va).unwrap().write_u32(0, 0xfeed).unwrap();

    let gref = reg.grant_access(ME, frame, AGENCY, false).unwrap();
    let mapping = reg.map_grant(AGENCY, ME, gref.index, false).unwrap();
    assert_eq!(mem.foreign_mapping_count(frame), 1);

    let view = mem.page(mapping.va).unwrap();
    assert_eq!(view.read_u32(0).unwrap(), 0xfeed);
    view.write_u32(4, 7).unwrap();
    assert_eq!(mem.page(va).unwrap().read_u32(4).unwrap(), 7);

    reg.unmap_grant(AGENCY, mapping.handle).unwrap();
    assert_eq!(mem.foreign_mapping_count(frame), 0);
    reg.end_access(ME, gref).unwrap();
    mem.free_pages(va).unwrap();
    assert!(check_all_invariants(&reg).is_empty());
}

#[test]
fn test_end_access_refused_while_mapped() {
    let (reg, mem) = registry(&[0, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let frame = mem.frame_of(va).unwrap();
    let gref = reg.grant_access(ME, frame, AGENCY, false).unwrap();
    let mapping = reg.map_grant(AGENCY, ME, gref.index, false).unwrap();

    let err = reg.end_access(ME, gref).unwrap_err();
    assert_eq!(err, AvzError::StillInUse { domain: ME, gref });
    assert!(err.is_recoverable());
    assert!(reg.query_usage(ME, gref).unwrap().write_in_progress);
    assert_eq!(mem.free_pages(va), Err(HalError::FrameBusy));

    reg.unmap_grant(AGENCY, mapping.handle).unwrap();
    reg.end_access(ME, gref).unwrap();
    assert!(check_all_invariants(&reg).is_empty());
}

#[test]
fn test_readonly_grant_maps_readonly() {
    let (reg, mem) = registry(&[0, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let frame = mem.frame_of(va).unwrap();
    let gref = reg.grant_access(ME, frame, AGENCY, true).unwrap();

    assert!(matches!(
        reg.map_grant(AGENCY, ME, gref.index, false),
        Err(AvzError::AccessDenied { .. })
    ));
    let mapping = reg.map_grant(AGENCY, ME, gref.index, true).unwrap();
    let view = mem.page(mapping.va).unwrap();
    assert_eq!(view.write_u32(0, 1), Err(HalError::AccessDenied));

    let usage = reg.query_usage(ME, gref).unwrap();
    assert!(usage.read_in_progress);
    assert!(!usage.write_in_progress);
    reg.unmap_grant(AGENCY, mapping.handle).unwrap();
}

#[test]
fn test_map_by_wrong_domain_denied() {
    let (reg, mem) = registry(&[0, 1, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let gref = reg
        .grant_access(ME, mem.frame_of(va).unwrap(), AGENCY, false)
        .unwrap();
    assert_eq!(
        reg.map_grant(DomainId(1), ME, gref.index, false),
        Err(AvzError::AccessDenied {
            domain: ME,
            index: gref.index
        })
    );
}

#[test]
fn test_map_free_entry_rejected() {
    let (reg, _) = registry(&[0, 2]);
    assert!(matches!(
        reg.map_grant(AGENCY, ME, 100, false),
        Err(AvzError::InvalidGrant { .. })
    ));
    assert!(matches!(
        reg.map_grant(AGENCY, ME, 100_000, false),
        Err(AvzError::InvalidGrant { .. })
    ));
}

#[test]
fn test_two_mappings_keep_entry_mapped() {
    let (reg, mem) = registry(&[0, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let gref = reg
        .grant_access(ME, mem.frame_of(va).unwrap(), AGENCY, false)
        .unwrap();
    let a = reg.map_grant(AGENCY, ME, gref.index, true).unwrap();
    let b = reg.map_grant(AGENCY, ME, gref.index, false).unwrap();
    assert_ne!(a.handle, b.handle);

    reg.unmap_grant(AGENCY, b.handle).unwrap();
    let usage = reg.query_usage(ME, gref).unwrap();
    assert!(usage.read_in_progress && !usage.write_in_progress);
    assert!(reg.end_access(ME, gref).is_err());

    reg.unmap_grant(AGENCY, a.handle).unwrap();
    assert!(matches!(
        reg.unmap_grant(AGENCY, a.handle),
        Err(AvzError::InvalidHandle { .. })
    ));
    reg.end_access(ME, gref).unwrap();
}

#[test]
fn test_mapper_teardown_releases_grantor_entry() {
    let (reg, mem) = registry(&[0, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let frame = mem.frame_of(va).unwrap();
    let gref = reg.grant_access(ME, frame, AGENCY, false).unwrap();
    reg.map_grant(AGENCY, ME, gref.index, false).unwrap();

    reg.destroy_domain(AGENCY).unwrap();
    assert_eq!(mem.foreign_mapping_count(frame), 0);
    reg.end_access(ME, gref).unwrap();
    assert!(check_all_invariants(&reg).is_empty());
}

#[test]
fn test_grantor_teardown_leaves_mapping_until_unmapped() {
    let (reg, mem) = registry(&[0, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let frame = mem.frame_of(va).unwrap();
    let gref = reg.grant_access(ME, frame, AGENCY, false).unwrap();
    let mapping = reg.map_grant(AGENCY, ME, gref.index, false).unwrap();

    reg.destroy_domain(ME).unwrap();
    assert_eq!(mem.foreign_mapping_count(frame), 1);
    reg.unmap_grant(AGENCY, mapping.handle).unwrap();
    assert_eq!(mem.foreign_mapping_count(frame), 0);
}

#[test]
fn test_deferred_grant_after_exhaustion() {
    let config = soo_avz_core::AvzConfig {
        nr_grant_entries: 10,
        nr_reserved_grants: 8,
        ..Default::default()
    };
    let (reg, mem) = common::registry_with(config, &[0, 2]);
    let dom = reg.domain(ME).unwrap();
    let va = mem.alloc_contig_pages(ME, 3).unwrap();
    let frames: Vec<_> = (0..3)
        .map(|i| mem.frame_of(va.page_offset(i)).unwrap())
        .collect();

    let a = dom.gnttab().grant_access(frames[0], AGENCY, false).unwrap();
    let _b = dom.gnttab().grant_access(frames[1], AGENCY, false).unwrap();
    assert!(dom
        .gnttab()
        .grant_access(frames[2], AGENCY, false)
        .unwrap_err()
        .is_recoverable());

    let (tx, rx) = crossbeam_channel::unbounded();
    let frame = frames[2];
    dom.gnttab().on_grants_available(
        1,
        Box::new(move |table: &GrantTable| {
            let _ = tx.send(table.grant_access(frame, AGENCY, false));
        }),
    );
    assert!(rx.try_recv().is_err());

    dom.gnttab().end_access(a).unwrap();
    let late = rx.try_recv().unwrap().unwrap();
    assert_eq!(late.index, a.index);
    assert_eq!(dom.gnttab().free_count(), 0);
}

#[test]
fn test_grants_from_many_threads_stay_consistent() {
    let (reg, _) = registry(&[0, 2]);
    let reg = Arc::new(reg);
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for i in 0..50u64 {
                    let frame = soo_avz_core::FrameId(t * 100 + i);
                    let gref = reg.grant_access(ME, frame, AGENCY, i % 2 == 0).unwrap();
                    if i % 3 != 0 {
                        reg.end_access(ME, gref).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let audit = reg.domain(ME).unwrap().gnttab().audit();
    // 17 of every 50 grants are kept
    assert_eq!(audit.capacity - audit.free_count - 8, 4 * 17);
    assert!(check_all_invariants(&reg).is_empty());
}

#[test]
fn test_dump_lists_mappings() {
    let (reg, mem) = registry(&[0, 2]);
    let va = mem.alloc_contig_pages(ME, 1).unwrap();
    let gref = reg
        .grant_access(ME, mem.frame_of(va).unwrap(), AGENCY, false)
        .unwrap();
    reg.map_grant(AGENCY, ME, gref.index, false).unwrap();

    let grantor = reg.domain(ME).unwrap().gnttab().dump();
    assert!(grantor.contains(&format!("{:?}", GrantState::Mapped)));
    let mapper = reg.domain(AGENCY).unwrap().gnttab().dump();
    assert!(mapper.contains("grantor=2"));
}
