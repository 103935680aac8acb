// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault dispatcher and demand loading
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::handle_fault, Resolution, FaultStats
//! DEPENDS_ON: vm::address_space, vm::cow, vm::swap, hal::FileBackend
//! INVARIANTS: per-page transitions are one-shot and cleared only after success; a page
//!             found already resolved is a benign race and performs no I/O
//!
//! Dispatch order per page: swapped, demand-load, copy-on-write (writes only), none.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::hal::FrameReservation;
use crate::mm::page_table::{MapError, PteFlags};
use crate::types::{page_align_down, Access, PAGE_SIZE};
use crate::vm::address_space::{install_page, leaf_flags, AddressSpace};
use crate::vm::region::{PageState, RegionFlags, RegionState};

/// How a fault was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing left to do; another thread got there first.
    Benign,
    DemandLoaded,
    CopiedOnWrite,
    SwappedIn,
}

/// Process-wide fault statistics.
#[derive(Debug, Default)]
pub struct FaultStats {
    faults: AtomicU64,
    demand_loads: AtomicU64,
    cow_faults: AtomicU64,
    swap_ins: AtomicU64,
    stack_growths: AtomicU64,
}

/// Copy of [`FaultStats`] at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultStatsSnapshot {
    pub faults: u64,
    pub demand_loads: u64,
    pub cow_faults: u64,
    pub swap_ins: u64,
    pub stack_growths: u64,
}

impl FaultStats {
    fn record(&self, resolution: Resolution) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        let counter = match resolution {
            Resolution::Benign => return,
            Resolution::DemandLoaded => &self.demand_loads,
            Resolution::CopiedOnWrite => &self.cow_faults,
            Resolution::SwappedIn => &self.swap_ins,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            demand_loads: self.demand_loads.load(Ordering::Relaxed),
            cow_faults: self.cow_faults.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
        }
    }
}

impl AddressSpace {
    /// Resolves a fault at `addr` caused by `access`.
    ///
    /// Faults just below a grows-down stack extend the stack first, as long as the
    /// stack stays within its maximum size.
    pub fn handle_fault(&self, addr: usize, access: Access) -> VmResult<Resolution> {
        let mut remote = Vec::new();
        let mut state = self.state.lock();
        if self.is_destroyed() {
            return Err(VmError::InvalidHandle);
        }
        let page = page_align_down(addr);
        let base = match state.find_base(addr) {
            Some(base) => base,
            None => {
                let stack = self.stack_above(&state, page).ok_or(VmError::Unmapped { addr })?;
                let len = state.tree.get(&stack).map_or(0, |vm| vm.len);
                let missing = (stack - page) / PAGE_SIZE;
                let limit = self.vmm.config().max_stack_pages;
                if len / PAGE_SIZE + missing > limit {
                    return Err(VmError::Unmapped { addr });
                }
                self.grow_locked(&mut state, stack, missing as isize)?;
                self.vmm.fault_stats().stack_growths.fetch_add(1, Ordering::Relaxed);
                log::debug!(target: "vmm::fault", "{:?}: stack grown to {:#x}", self.id(), page);
                page
            }
        };
        let vm = state.tree.get(&base).cloned().ok_or(VmError::Unmapped { addr })?;
        let mut region = vm.region.lock();
        let flags = region.flags();
        let permitted = match access {
            Access::Read => true,
            Access::Write => flags.contains(RegionFlags::WRITABLE),
            Access::Execute => flags.contains(RegionFlags::EXECUTABLE),
        };
        if !permitted {
            log::debug!(target: "vmm::fault", "{:?}: {:?} denied at {:#x}", self.id(), access, addr);
            return Err(VmError::PermissionDenied { addr });
        }
        vm.region.touch(self.vmm.tick());

        let index = (page - base) / PAGE_SIZE;
        let resolution = self.resolve(&mut region, base, index, access, &mut remote)?;
        self.vmm.fault_stats().record(resolution);
        log::trace!(
            target: "vmm::fault",
            "{:?}: {:?} at {:#x} -> {:?}",
            self.id(),
            access,
            addr,
            resolution
        );
        Ok(resolution)
    }

    fn resolve(
        &self,
        region: &mut RegionState,
        base: usize,
        index: usize,
        access: Access,
        remote: &mut Vec<(std::sync::Arc<AddressSpace>, usize)>,
    ) -> VmResult<Resolution> {
        let page = region.page_state(index);
        let memory = self.vmm.memory();
        if page.contains(PageState::SWAPPED) {
            let mut reservation = FrameReservation::new(memory, 1)?;
            let targets = self.owner_targets(region, base, remote);
            let swapped_in =
                self.vmm.swap().swap_in(&self.vmm, region, index, &mut reservation, &targets)?;
            return Ok(if swapped_in { Resolution::SwappedIn } else { Resolution::Benign });
        }
        if page.contains(PageState::DEMAND_LOAD) {
            let mut reservation = FrameReservation::new(memory, 1)?;
            let targets = self.owner_targets(region, base, remote);
            self.demand_load(region, index, &mut reservation, &targets)?;
            return Ok(Resolution::DemandLoaded);
        }
        if page.contains(PageState::COPY_ON_WRITE) && access.is_write() {
            let mut reservation = FrameReservation::new(memory, 1)?;
            self.resolve_cow(region, base, index, &mut reservation)?;
            return Ok(Resolution::CopiedOnWrite);
        }
        Ok(Resolution::Benign)
    }

    /// Loads page `index` from the backing file (or zero fill) into a fresh frame and
    /// maps it in every target.
    pub(crate) fn demand_load(
        &self,
        region: &mut RegionState,
        index: usize,
        reservation: &mut FrameReservation<'_>,
        targets: &[(&AddressSpace, usize)],
    ) -> VmResult<()> {
        let (offset, bytes) = region.load_range(index);
        let mut staging = vec![0u8; PAGE_SIZE];
        if bytes > 0 {
            if let Some(file) = region.file() {
                if let Err(err) = file.read_full_at(offset, &mut staging[..bytes]) {
                    log::error!(target: "vmm::fault", "demand load at offset {:#x} failed: {}", offset, err);
                    return Err(VmError::io("demand load", err));
                }
            }
        }
        let memory = self.vmm.memory();
        let frame = reservation.take()?;
        memory.write_frame(frame, 0, &staging);
        if let Err(err) = install_page(targets, index, frame, leaf_flags(region.flags(), false)) {
            memory.free(frame);
            return Err(err);
        }
        region.clear_page_state(index, PageState::DEMAND_LOAD);
        Ok(())
    }

    /// Gives this space a private writable copy of a copy-on-write page.
    fn resolve_cow(
        &self,
        region: &mut RegionState,
        base: usize,
        index: usize,
        reservation: &mut FrameReservation<'_>,
    ) -> VmResult<()> {
        let va = base + index * PAGE_SIZE;
        let cow = self.vmm.cow();
        let memory = self.vmm.memory();
        let pte = self.mmu.lock().lookup(va).ok_or(VmError::Mapping(MapError::NotMapped))?;
        let fault = cow.pagefault(pte.frame(), memory, reservation)?;
        let owned = leaf_flags(region.flags(), false);
        {
            let mut table = self.mmu.lock();
            if fault.copied {
                table.unmap(va)?;
                if let Err(err) = table.map(va, fault.frame, owned) {
                    let _ = table.map(va, pte.frame(), pte.flags());
                    let _ = cow.add(pte.frame());
                    memory.free(fault.frame);
                    return Err(err.into());
                }
            } else {
                table.update(va, owned, PteFlags::SHARED)?;
            }
        }
        self.vmm.tlb().shootdown(self.id(), va);
        self.counters.unshare(fault.converted);
        region.clear_page_state(index, PageState::COPY_ON_WRITE);
        Ok(())
    }
}
