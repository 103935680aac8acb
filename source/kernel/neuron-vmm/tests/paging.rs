// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for demand paging and stack growth
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! TEST_COVERAGE: 5 integration tests
//!
//! TEST_SCOPE:
//!   - Zero fill of file-backed pages past the loaded byte count
//!   - Stack size limits on explicit growth, on map and on fault
//!   - One file read per page under concurrent faults from several spaces
//!
//! TEST_SCENARIOS:
//!   - pages_past_load_count_are_zero_filled(): no file read for the zero-fill tail
//!   - stack_growth_past_limit_is_rejected(): LimitExceeded, layout unchanged
//!   - fault_below_stack_grows_it(): implicit growth up to the maximum size
//!   - concurrent_shared_faults_read_once(): racing faults across two spaces
//!   - lock_all_resolves_pending_pages(): every page resident afterwards

use std::sync::Arc;
use std::thread;

use neuron_vmm::hal::host::{HostMemory, MemFile};
use neuron_vmm::{
    Access, MapFlags, MapRequest, Prot, Resolution, ThreadId, VmConfig, VmError, Vmm, PAGE_SIZE,
};

const BASE: usize = 0x10_0000;

fn vmm(config: VmConfig) -> (Arc<HostMemory>, Arc<Vmm>) {
    let memory = Arc::new(HostMemory::new(32));
    let vmm = Vmm::builder(config, memory.clone()).build().unwrap();
    (memory, vmm)
}

#[test]
fn pages_past_load_count_are_zero_filled() {
    let (_memory, vmm) = vmm(VmConfig::default());
    let file = Arc::new(MemFile::with_contents(vec![9u8; 3 * PAGE_SIZE]));
    let space = vmm.create_space().unwrap();
    space
        .map(MapRequest::file(file.clone(), 0, 3 * PAGE_SIZE, PAGE_SIZE + 16).fixed(BASE))
        .unwrap();

    let mut tail = [0xffu8; 8];
    space.read_bytes(BASE + 2 * PAGE_SIZE, &mut tail).unwrap();
    assert_eq!(tail, [0u8; 8]);
    assert_eq!(file.reads(), 0);

    let mut edge = [0u8; 32];
    space.read_bytes(BASE + PAGE_SIZE, &mut edge).unwrap();
    assert_eq!(&edge[..16], &[9u8; 16]);
    assert_eq!(&edge[16..], &[0u8; 16]);
    assert_eq!(file.reads(), 1);

    let mut head = [0u8; 4];
    space.read_bytes(BASE, &mut head).unwrap();
    assert_eq!(head, [9u8; 4]);
    assert_eq!(file.reads(), 2);
    assert_eq!(vmm.fault_stats().snapshot().demand_loads, 3);
}

#[test]
fn stack_growth_past_limit_is_rejected() {
    let config = VmConfig { max_stack_pages: 4, ..VmConfig::default() };
    let (_memory, vmm) = vmm(config);
    let space = vmm.create_space().unwrap();
    assert!(matches!(
        space.map(MapRequest::stack(5 * PAGE_SIZE, ThreadId::from_raw(1))),
        Err(VmError::LimitExceeded)
    ));

    let stack = space.map(MapRequest::stack(PAGE_SIZE, ThreadId::from_raw(1))).unwrap();
    let snapshot = space.snapshot();
    assert!(matches!(space.grow(stack.base, 4), Err(VmError::LimitExceeded)));
    assert_eq!(space.snapshot(), snapshot);

    space.grow(stack.base, 3).unwrap();
    let grown = space.region_at(stack.base).unwrap();
    assert_eq!(grown.base, stack.base - 3 * PAGE_SIZE);
    assert_eq!(grown.len, 4 * PAGE_SIZE);
    assert!(matches!(space.grow(grown.base, 1), Err(VmError::LimitExceeded)));
}

#[test]
fn fault_below_stack_grows_it() {
    let config = VmConfig { max_stack_pages: 4, ..VmConfig::default() };
    let (_memory, vmm) = vmm(config);
    let space = vmm.create_space().unwrap();
    let stack = space.map(MapRequest::stack(PAGE_SIZE, ThreadId::from_raw(1))).unwrap();

    let below = stack.base - 2 * PAGE_SIZE + 8;
    assert_eq!(space.handle_fault(below, Access::Write).unwrap(), Resolution::DemandLoaded);
    let grown = space.region_at(stack.base).unwrap();
    assert_eq!(grown.base, stack.base - 2 * PAGE_SIZE);
    assert_eq!(vmm.fault_stats().snapshot().stack_growths, 1);

    let too_far = grown.base - 2 * PAGE_SIZE;
    assert!(matches!(space.handle_fault(too_far, Access::Write), Err(VmError::Unmapped { .. })));
    assert_eq!(space.region_at(stack.base).unwrap(), grown);
}

#[test]
fn concurrent_shared_faults_read_once() {
    let (memory, vmm) = vmm(VmConfig::default());
    let file = Arc::new(MemFile::with_contents(vec![0x42u8; PAGE_SIZE]));
    let req = MapRequest::file(file.clone(), 0, PAGE_SIZE, PAGE_SIZE)
        .prot(Prot::READ)
        .flags(MapFlags::SHARED);
    let spaces = [vmm.create_space().unwrap(), vmm.create_space().unwrap()];
    let bases = [spaces[0].map(req.clone()).unwrap().base, spaces[1].map(req).unwrap().base];

    thread::scope(|scope| {
        for worker in 0..8 {
            let space = &spaces[worker % 2];
            let base = bases[worker % 2];
            scope.spawn(move || {
                let mut byte = [0u8; 1];
                space.read_bytes(base + worker, &mut byte).unwrap();
                assert_eq!(byte, [0x42]);
            });
        }
    });

    assert_eq!(file.reads(), 1);
    assert_eq!(memory.allocated(), 1);
    assert_eq!(vmm.fault_stats().snapshot().demand_loads, 1);
    for space in &spaces {
        assert_eq!(space.counters().shared, 1);
    }
}

#[test]
fn lock_all_resolves_pending_pages() {
    let (memory, vmm) = vmm(VmConfig::default());
    let file = Arc::new(MemFile::with_contents(vec![1u8; 2 * PAGE_SIZE]));
    let space = vmm.create_space().unwrap();
    space.map(MapRequest::anonymous(2 * PAGE_SIZE).fixed(BASE)).unwrap();
    space
        .map(MapRequest::file(file.clone(), 0, 2 * PAGE_SIZE, 2 * PAGE_SIZE).fixed(BASE + 0x1_0000))
        .unwrap();
    assert_eq!(memory.allocated(), 0);

    assert_eq!(space.lock_all().unwrap(), 4);
    assert_eq!(memory.allocated(), 4);
    assert_eq!(file.reads(), 2);
    assert_eq!(space.lock_all().unwrap(), 0);
    assert_eq!(vmm.swap_out(4).unwrap(), 0);
}
