// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for copy-on-write fork
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCOPE:
//!   - Frame accounting of both spaces across fork and the following writes
//!   - Isolation of parent and child after copy-on-write resolution
//!   - Frame release once every sharer is gone
//!
//! TEST_SCENARIOS:
//!   - fork_moves_private_pages_to_shared(): own drops and shared rises by one per page
//!   - writes_after_fork_are_isolated(): copy for the first writer, takeover for the last
//!   - teardown_frees_every_frame(): destroying both spaces empties memory and the COW table

use std::sync::Arc;

use neuron_vmm::hal::host::HostMemory;
use neuron_vmm::{AddressSpace, FrameCounters, MapFlags, MapRequest, ThreadId, VmConfig, Vmm, PAGE_SIZE};

const BASE: usize = 0x10_0000;
const PAGES: usize = 3;

fn forked() -> (Arc<HostMemory>, Arc<Vmm>, Arc<AddressSpace>, Arc<AddressSpace>) {
    let memory = Arc::new(HostMemory::new(32));
    let vmm = Vmm::builder(VmConfig::default(), memory.clone()).build().unwrap();
    let parent = vmm.create_space().unwrap();
    parent
        .map(MapRequest::anonymous(PAGES * PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE))
        .unwrap();
    for page in 0..PAGES {
        parent.write_bytes(BASE + page * PAGE_SIZE, &[page as u8 + 1; 8]).unwrap();
    }
    let child = vmm.create_space().unwrap();
    parent.clone_all(&child, ThreadId::from_raw(1)).unwrap();
    (memory, vmm, parent, child)
}

#[test]
fn fork_moves_private_pages_to_shared() {
    let memory = Arc::new(HostMemory::new(32));
    let vmm = Vmm::builder(VmConfig::default(), memory.clone()).build().unwrap();
    let parent = vmm.create_space().unwrap();
    parent
        .map(MapRequest::anonymous(PAGES * PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE))
        .unwrap();
    let before = parent.counters();
    assert_eq!(before, FrameCounters { own: PAGES, shared: 0, swapped: 0 });

    let child = vmm.create_space().unwrap();
    parent.clone_all(&child, ThreadId::from_raw(1)).unwrap();

    let after = parent.counters();
    let child_counters = child.counters();
    assert_eq!(before.own - after.own, PAGES);
    assert_eq!(after.shared - before.shared, PAGES);
    assert_eq!(child_counters.shared, after.shared - before.shared);
    assert_eq!(child_counters.own, 0);
    assert_eq!(memory.allocated(), PAGES);

    for page in 0..PAGES {
        let va = BASE + page * PAGE_SIZE;
        let ours = parent.translate(va).unwrap();
        let theirs = child.translate(va).unwrap();
        assert_eq!(ours.frame(), theirs.frame());
        assert!(!ours.is_writable());
        assert!(!theirs.is_writable());
        assert_eq!(vmm.cow().sharers(ours.frame()), 2);
    }
}

#[test]
fn writes_after_fork_are_isolated() {
    let (memory, vmm, parent, child) = forked();
    let frame = parent.translate(BASE).unwrap().frame();

    child.write_bytes(BASE, b"child").unwrap();
    assert_eq!(memory.allocated(), PAGES + 1);
    assert_eq!(vmm.cow().sharers(frame), 1);
    assert_eq!(child.counters(), FrameCounters { own: 1, shared: PAGES - 1, swapped: 0 });

    let mut buf = [0u8; 5];
    parent.read_bytes(BASE, &mut buf).unwrap();
    assert_eq!(buf, [1u8; 5]);
    child.read_bytes(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"child");

    parent.write_bytes(BASE, b"again").unwrap();
    assert_eq!(memory.allocated(), PAGES + 1, "last sharer reuses the frame");
    assert_eq!(parent.translate(BASE).unwrap().frame(), frame);
    assert_eq!(vmm.cow().sharers(frame), 0);
    assert_eq!(parent.counters(), FrameCounters { own: 1, shared: PAGES - 1, swapped: 0 });
    assert_eq!(vmm.fault_stats().snapshot().cow_faults, 2);
}

#[test]
fn teardown_frees_every_frame() {
    let (memory, vmm, parent, child) = forked();
    child.write_bytes(BASE + PAGE_SIZE, b"x").unwrap();
    assert_eq!(memory.allocated(), PAGES + 1);

    drop(child);
    assert_eq!(memory.allocated(), PAGES);
    let mut byte = [0u8; 1];
    parent.read_bytes(BASE + 2 * PAGE_SIZE, &mut byte).unwrap();
    assert_eq!(byte, [3]);

    parent.destroy();
    assert_eq!(memory.allocated(), 0);
    assert!(vmm.cow().is_empty());
    assert_eq!(parent.counters(), FrameCounters::default());
}
