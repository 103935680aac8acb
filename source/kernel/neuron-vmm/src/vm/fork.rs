// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space duplication for fork
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::clone_all
//! DEPENDS_ON: vm::address_space, vm::cow, vm::swap
//! INVARIANTS: on success every resident private page is COW in both spaces and registered
//!             once per sharer; on failure the destination is empty again and the source
//!             is exactly as before
//!
//! Shareable regions are attached by reference. Private regions are deep-copied; pages
//! still pending a demand load stay pending in both copies and swapped pages get their
//! own swap block. Physically contiguous regions are copied up front.

use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::mm::page_table::{clone_pages, PteFlags};
use crate::types::{FrameNo, ThreadId, PAGE_SIZE};
use crate::vm::address_space::{leaf_flags, lock_states, lock_tables, AddressSpace, SpaceState, VmRegion};
use crate::vm::region::{PageState, Region, RegionFlags, RegionState};

/// Source page turned copy-on-write during the walk.
struct CowMark {
    region: Arc<Region>,
    index: usize,
    va: usize,
    frame: FrameNo,
}

impl AddressSpace {
    /// Duplicates this space into the empty space `dst`.
    ///
    /// Thread-local mappings (stacks, TLS) are copied only when they belong to
    /// `current`, the forking thread.
    pub fn clone_all(&self, dst: &AddressSpace, current: ThreadId) -> VmResult<()> {
        if dst.id() == self.id() || !Arc::ptr_eq(&self.vmm, &dst.vmm) {
            return Err(VmError::InvalidArgs);
        }
        if self.is_destroyed() || dst.is_destroyed() {
            return Err(VmError::InvalidHandle);
        }
        let (state, mut dst_state) = lock_states(self, dst);
        if !dst_state.tree.is_empty() {
            return Err(VmError::InvalidArgs);
        }
        let selected: Vec<VmRegion> = state
            .tree
            .values()
            .filter(|vm| vm.thread.map_or(true, |thread| thread == current))
            .cloned()
            .collect();

        let mut journal = Vec::new();
        for vm in &selected {
            if let Err(err) = self.clone_vm(dst, &mut dst_state, vm, &mut journal) {
                log::warn!(
                    target: "vmm",
                    "fork {:?} -> {:?} failed at {:#x}: {}; rolling back",
                    self.id(),
                    dst.id(),
                    vm.base,
                    err
                );
                dst.discard_all(&mut dst_state);
                self.unwind(journal);
                return Err(err);
            }
        }
        dst_state.data_segment = state.data_segment;
        dst_state.stack_cursor = state.stack_cursor;
        log::debug!(
            target: "vmm",
            "fork {:?} -> {:?}: {} mappings, {} pages marked copy-on-write",
            self.id(),
            dst.id(),
            selected.len(),
            journal.len()
        );
        Ok(())
    }

    fn clone_vm(
        &self,
        dst: &AddressSpace,
        dst_state: &mut SpaceState,
        vm: &VmRegion,
        journal: &mut Vec<CowMark>,
    ) -> VmResult<()> {
        let mut region = vm.region.lock();
        if region.is_shareable() {
            region.add_owner(dst.id(), vm.base)?;
            dst_state.tree.insert(vm.base, vm.clone());
            dst.counters.add_swapped_n(region.swapped_pages());
            let (src_table, mut dst_table) = lock_tables(self, dst);
            let cloned = clone_pages(&**src_table, &mut **dst_table, vm.base, vm.base, region.page_count(), true)?;
            dst.counters.add_resident_n(true, cloned);
            return Ok(());
        }

        let copy = region.clone_for(dst.id(), vm.base)?;
        let child = Arc::new(Region::new(self.vmm.next_region_id(), copy, vm.region.last_access()));
        dst_state.tree.insert(vm.base, VmRegion { region: child.clone(), ..vm.clone() });
        let mut child_state = child.lock();
        let flags = region.flags();
        if flags.contains(RegionFlags::CONTIGUOUS) {
            return self.copy_contiguous(dst, vm.base, &region);
        }
        let cow = self.vmm.cow();

        for index in 0..region.page_count() {
            let va = vm.base + index * PAGE_SIZE;
            let page = region.page_state(index);
            if page.contains(PageState::SWAPPED) {
                if let Some(block) = region.swap_block(index) {
                    let copy = self.vmm.swap().duplicate_block(block)?;
                    child_state.set_swap_block(index, Some(copy));
                    dst.counters.add_swapped();
                }
                continue;
            }
            if page.contains(PageState::DEMAND_LOAD) {
                continue;
            }
            let Some(pte) = self.mmu.lock().lookup(va) else {
                continue;
            };
            let frame = pte.frame();
            if flags.contains(RegionFlags::NO_FREE) {
                dst.mmu.lock().map(va, frame, pte.flags())?;
                dst.counters.add_resident(true);
                continue;
            }

            let already_cow = page.contains(PageState::COPY_ON_WRITE);
            cow.add_many(frame, if already_cow { 1 } else { 2 })?;
            if !already_cow {
                if let Err(err) = self.mmu.lock().update(va, PteFlags::SHARED, PteFlags::WRITE) {
                    cow.remove(frame);
                    cow.remove(frame);
                    return Err(err.into());
                }
                self.vmm.tlb().shootdown(self.id(), va);
                region.insert_page_state(index, PageState::COPY_ON_WRITE);
                self.counters.share_one();
                journal.push(CowMark { region: vm.region.clone(), index, va, frame });
            }
            if let Err(err) = dst.mmu.lock().map(va, frame, leaf_flags(flags, true)) {
                cow.remove(frame);
                return Err(err.into());
            }
            child_state.set_page_state(index, PageState::COPY_ON_WRITE);
            dst.counters.add_resident(true);
        }
        Ok(())
    }

    /// Copies a physically contiguous region into a fresh run of frames with the
    /// same alignment. The copy is never copy-on-write.
    fn copy_contiguous(&self, dst: &AddressSpace, base: usize, region: &RegionState) -> VmResult<()> {
        let memory = self.vmm.memory();
        let pages = region.page_count();
        let first = memory
            .allocate_contiguous(pages, region.phys_align())
            .ok_or(VmError::OutOfMemory)?;
        let flags = leaf_flags(region.flags(), false);
        for index in 0..pages {
            let va = base + index * PAGE_SIZE;
            let frame = FrameNo::new(first.raw() + index);
            match self.mmu.lock().lookup(va) {
                Some(pte) => memory.copy_frame(pte.frame(), frame),
                None => memory.zero_frame(frame),
            }
            if let Err(err) = dst.mmu.lock().map(va, frame, flags) {
                for rest in index..pages {
                    memory.free(FrameNo::new(first.raw() + rest));
                }
                return Err(err.into());
            }
            dst.counters.add_resident(false);
        }
        log::trace!(target: "vmm", "fork copied {} contiguous pages at {:#x}", pages, base);
        Ok(())
    }

    /// Restores the source pages marked copy-on-write by a failed fork. The
    /// destination has already dropped its registrations.
    fn unwind(&self, journal: Vec<CowMark>) {
        let cow = self.vmm.cow();
        for mark in journal.into_iter().rev() {
            let mut region = mark.region.lock();
            cow.remove(mark.frame);
            let restore = leaf_flags(region.flags(), false);
            let restored = self.mmu.lock().update(mark.va, restore, PteFlags::SHARED);
            if let Err(err) = restored {
                log::error!(target: "vmm", "fork unwind at {:#x} failed: {:?}", mark.va, err);
                continue;
            }
            region.clear_page_state(mark.index, PageState::COPY_ON_WRITE);
            self.counters.unshare(1);
        }
    }
}
