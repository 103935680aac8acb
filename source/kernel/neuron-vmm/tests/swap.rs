// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for swap-out and swap-in
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! TEST_COVERAGE: 7 integration tests
//!
//! TEST_SCOPE:
//!   - Page content and frame counters across a swap round trip
//!   - Restoration of the mapping when the swap write fails
//!   - Pinned and copy-on-write pages are never chosen
//!   - Victim selection by least recent access
//!   - Shared regions leave and return for every owner at once
//!   - Swapping to a real file on disk
//!
//! TEST_SCENARIOS:
//!   - swap_round_trip_restores_content_and_counters(): evict, fault back, compare
//!   - failed_write_keeps_page_resident(): injected write error leaves the page mapped
//!   - locked_and_cow_pages_stay_resident(): nothing evictable means nothing swapped
//!   - fork_duplicates_swapped_pages(): each copy owns its own swap block
//!   - oldest_region_is_evicted_first(): least recently touched region loses its page
//!   - shared_region_swaps_for_every_owner(): counters of both owners follow the page
//!   - swap_to_temp_file(): std::fs::File as swap backend

use std::sync::Arc;

use neuron_vmm::hal::host::{HostMemory, MemFile};
use neuron_vmm::hal::FileBackend;
use neuron_vmm::{
    Access, FrameCounters, MapFlags, MapRequest, Resolution, ThreadId, VmConfig, VmError, Vmm, PAGE_SIZE,
};

const BASE: usize = 0x10_0000;

fn swapping(file: Arc<dyn FileBackend>) -> (Arc<HostMemory>, Arc<Vmm>) {
    let memory = Arc::new(HostMemory::new(16));
    let vmm = Vmm::builder(VmConfig::default(), memory.clone())
        .swap_file(file)
        .swap_seed(1)
        .build()
        .unwrap();
    (memory, vmm)
}

#[test]
fn swap_round_trip_restores_content_and_counters() {
    let file = Arc::new(MemFile::new());
    let (memory, vmm) = swapping(file.clone());
    let space = vmm.create_space().unwrap();
    space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE)).unwrap();
    space.write_bytes(BASE, b"hello swap").unwrap();
    let resident = space.counters();
    assert_eq!(resident, FrameCounters { own: 1, shared: 0, swapped: 0 });

    assert_eq!(vmm.swap_out(1).unwrap(), 1);
    assert!(space.translate(BASE).is_none());
    assert_eq!(space.counters(), FrameCounters { own: 0, shared: 0, swapped: 1 });
    assert_eq!(memory.allocated(), 0);
    assert_eq!(vmm.swap().used_blocks(), 1);
    assert!(file.writes() >= 1);

    assert_eq!(space.handle_fault(BASE, Access::Read).unwrap(), Resolution::SwappedIn);
    let mut buf = [0u8; 10];
    space.read_bytes(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"hello swap");
    assert_eq!(space.counters(), resident);
    assert_eq!(vmm.swap().used_blocks(), 0);
    assert_eq!(space.handle_fault(BASE, Access::Read).unwrap(), Resolution::Benign);
    assert_eq!(vmm.fault_stats().snapshot().swap_ins, 1);
}

#[test]
fn failed_write_keeps_page_resident() {
    let file = Arc::new(MemFile::new());
    let (memory, vmm) = swapping(file.clone());
    let space = vmm.create_space().unwrap();
    space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE)).unwrap();
    space.write_bytes(BASE, b"stay").unwrap();
    let frame = space.translate(BASE).unwrap().frame();

    file.set_fail_writes(true);
    assert!(matches!(vmm.swap_out(1), Err(VmError::Io { .. })));
    assert_eq!(space.translate(BASE).unwrap().frame(), frame);
    assert_eq!(space.counters(), FrameCounters { own: 1, shared: 0, swapped: 0 });
    assert_eq!(vmm.swap().used_blocks(), 0);
    assert_eq!(memory.allocated(), 1);

    file.set_fail_writes(false);
    let mut buf = [0u8; 4];
    space.read_bytes(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"stay");
    assert_eq!(vmm.swap_out(1).unwrap(), 1);
}

#[test]
fn locked_and_cow_pages_stay_resident() {
    let (_memory, vmm) = swapping(Arc::new(MemFile::new()));
    let parent = vmm.create_space().unwrap();
    parent.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::LOCKED)).unwrap();
    parent
        .map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE + 0x1_0000).flags(MapFlags::POPULATE))
        .unwrap();
    let child = vmm.create_space().unwrap();
    parent.clone_all(&child, ThreadId::from_raw(1)).unwrap();

    assert_eq!(vmm.swap_out(4).unwrap(), 0);
    assert!(parent.translate(BASE).is_some());
    assert!(parent.translate(BASE + 0x1_0000).is_some());
    assert_eq!(vmm.swap().used_blocks(), 0);
}

#[test]
fn fork_duplicates_swapped_pages() {
    let (_memory, vmm) = swapping(Arc::new(MemFile::new()));
    let parent = vmm.create_space().unwrap();
    parent.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE)).unwrap();
    parent.write_bytes(BASE, b"old").unwrap();
    assert_eq!(vmm.swap_out(1).unwrap(), 1);

    let child = vmm.create_space().unwrap();
    parent.clone_all(&child, ThreadId::from_raw(1)).unwrap();
    assert_eq!(vmm.swap().used_blocks(), 2);
    assert_eq!(child.counters().swapped, 1);

    child.write_bytes(BASE, b"new").unwrap();
    let mut buf = [0u8; 3];
    parent.read_bytes(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"old");
    child.read_bytes(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"new");
    assert_eq!(vmm.swap().used_blocks(), 0);
}

#[test]
fn oldest_region_is_evicted_first() {
    let (_memory, vmm) = swapping(Arc::new(MemFile::new()));
    let space = vmm.create_space().unwrap();
    let old = BASE;
    let new = BASE + 0x1_0000;
    space.map(MapRequest::anonymous(PAGE_SIZE).fixed(old).flags(MapFlags::POPULATE)).unwrap();
    space.map(MapRequest::anonymous(PAGE_SIZE).fixed(new).flags(MapFlags::POPULATE)).unwrap();

    assert_eq!(vmm.swap_out(1).unwrap(), 1);
    assert!(space.translate(old).is_none());
    assert!(space.translate(new).is_some());

    assert_eq!(space.handle_fault(old, Access::Read).unwrap(), Resolution::SwappedIn);
    assert_eq!(vmm.swap_out(1).unwrap(), 1);
    assert!(space.translate(old).is_some());
    assert!(space.translate(new).is_none());
}

#[test]
fn shared_region_swaps_for_every_owner() {
    const DST: usize = 0x20_0000;
    let (memory, vmm) = swapping(Arc::new(MemFile::new()));
    let a = vmm.create_space().unwrap();
    let b = vmm.create_space().unwrap();
    a.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::SHARED | MapFlags::POPULATE))
        .unwrap();
    a.write_bytes(BASE, b"both").unwrap();
    b.join(&a, BASE, Some(DST)).unwrap();
    let resident = FrameCounters { own: 0, shared: 1, swapped: 0 };
    assert_eq!(a.counters(), resident);
    assert_eq!(b.counters(), resident);

    assert_eq!(vmm.swap_out(1).unwrap(), 1);
    let swapped = FrameCounters { own: 0, shared: 0, swapped: 1 };
    assert_eq!(a.counters(), swapped);
    assert_eq!(b.counters(), swapped);
    assert!(a.translate(BASE).is_none());
    assert!(b.translate(DST).is_none());
    assert_eq!(memory.allocated(), 0);

    let mut buf = [0u8; 4];
    b.read_bytes(DST, &mut buf).unwrap();
    assert_eq!(&buf, b"both");
    assert_eq!(a.counters(), resident);
    assert_eq!(b.counters(), resident);
    assert_eq!(a.translate(BASE).unwrap().frame(), b.translate(DST).unwrap().frame());
    assert_eq!(memory.allocated(), 1);
    assert_eq!(vmm.swap().used_blocks(), 0);
}

#[cfg(unix)]
#[test]
fn swap_to_temp_file() {
    let file: Arc<dyn FileBackend> = Arc::new(tempfile::tempfile().unwrap());
    let (memory, vmm) = swapping(file);
    let space = vmm.create_space().unwrap();
    space.map(MapRequest::anonymous(2 * PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE)).unwrap();
    space.write_bytes(BASE, &[0xa5; PAGE_SIZE]).unwrap();
    space.write_bytes(BASE + PAGE_SIZE, &[0x5a; PAGE_SIZE]).unwrap();

    assert_eq!(vmm.swap_out(2).unwrap(), 2);
    assert_eq!(memory.allocated(), 0);
    assert_eq!(space.counters().swapped, 2);

    let mut page = vec![0u8; PAGE_SIZE];
    space.read_bytes(BASE + PAGE_SIZE, &mut page).unwrap();
    assert!(page.iter().all(|byte| *byte == 0x5a));
    space.read_bytes(BASE, &mut page).unwrap();
    assert!(page.iter().all(|byte| *byte == 0xa5));

    space.unmap(BASE).unwrap();
    assert_eq!(vmm.swap().used_blocks(), 0);
    assert_eq!(memory.allocated(), 0);
}
