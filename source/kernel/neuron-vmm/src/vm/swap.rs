// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide page swapper: LRU victim scan, swap block allocation, swap I/O
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SwapManager
//! DEPENDS_ON: vm::region, vm::address_space, hal::{FileBackend, PhysicalMemory, TlbShootdown}
//! INVARIANTS: the scanner only try-locks address spaces and regions; a frame is freed only
//!             after every owner's mapping is gone and every TLB flush acknowledged; a
//!             failed swap-out write leaves the page resident and mapped as before
//!
//! Swap block `n` lives at byte offset `n * PAGE_SIZE` of the swap file.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;

use crate::error::{VmError, VmResult};
use crate::hal::{FileBackend, FrameReservation};
use crate::mm::page_table::{Pte, PteFlags};
use crate::types::{RegionId, PAGE_SIZE};
use crate::vm::address_space::{install_page, leaf_flags, AddressSpace};
use crate::vm::region::{PageState, Region, RegionState};
use crate::vm::slots::SlotTable;
use crate::vm::Vmm;

/// Region chosen by the LRU scan, returned locked.
pub(crate) struct Victim {
    pub region: Arc<Region>,
    pub guard: ArcMutexGuard<RawMutex, RegionState>,
}

pub struct SwapManager {
    file: Option<Arc<dyn FileBackend>>,
    blocks: Mutex<SlotTable<()>>,
    rng: Mutex<StdRng>,
}

impl SwapManager {
    /// `capacity` bounds the number of blocks in use at once. Without a file every
    /// block allocation fails.
    pub fn new(file: Option<Arc<dyn FileBackend>>, capacity: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { file, blocks: Mutex::new(SlotTable::with_limit(capacity)), rng: Mutex::new(rng) }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Swap blocks currently holding page content.
    pub fn used_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn allocate_block(&self) -> VmResult<usize> {
        if self.file.is_none() {
            return Err(VmError::LimitExceeded);
        }
        self.blocks.lock().insert(()).map_err(|()| VmError::LimitExceeded)
    }

    pub fn release_block(&self, block: usize) {
        if self.blocks.lock().remove(block).is_none() {
            log::warn!(target: "vmm::swap", "release of free swap block {}", block);
        }
    }

    /// Copies the content of `block` into a newly allocated block.
    pub fn duplicate_block(&self, block: usize) -> VmResult<usize> {
        let mut staging = vec![0u8; PAGE_SIZE];
        self.read_block(block, &mut staging)?;
        let copy = self.allocate_block()?;
        if let Err(err) = self.write_block(copy, &staging) {
            self.release_block(copy);
            return Err(err);
        }
        Ok(copy)
    }

    fn swap_file(&self) -> VmResult<&Arc<dyn FileBackend>> {
        self.file.as_ref().ok_or(VmError::LimitExceeded)
    }

    fn write_block(&self, block: usize, data: &[u8]) -> VmResult<()> {
        self.swap_file()?
            .write_all_at((block * PAGE_SIZE) as u64, data)
            .map_err(|err| VmError::io("swap write", err))
    }

    pub(crate) fn read_block(&self, block: usize, buf: &mut [u8]) -> VmResult<()> {
        let read = self
            .swap_file()?
            .read_full_at((block * PAGE_SIZE) as u64, buf)
            .map_err(|err| VmError::io("swap read", err))?;
        if read != buf.len() {
            return Err(VmError::io(
                "swap read",
                io::Error::new(io::ErrorKind::UnexpectedEof, "truncated swap block"),
            ));
        }
        Ok(())
    }

    /// Finds the region with the oldest access stamp that still has an evictable page.
    ///
    /// Address spaces and regions whose locks are contended are skipped. Spaces
    /// visited are parked in `keep` so none of them can be dropped while the victim
    /// lock is held.
    pub(crate) fn get_lru_region(
        &self,
        vmm: &Vmm,
        keep: &mut Vec<Arc<AddressSpace>>,
        skip: &HashSet<RegionId>,
    ) -> Option<Victim> {
        keep.extend(vmm.live_spaces());
        let mut seen = HashSet::new();
        let mut best: Option<Victim> = None;
        for space in keep.iter() {
            let Some(regions) = space.try_regions() else {
                log::trace!(target: "vmm::swap", "space {:?} busy, skipped", space.id());
                continue;
            };
            for region in regions {
                if skip.contains(&region.id()) || !seen.insert(region.id()) {
                    continue;
                }
                let stamp = region.last_access();
                if best.as_ref().is_some_and(|victim| victim.region.last_access() <= stamp) {
                    continue;
                }
                let Some(guard) = region.try_lock_arc() else {
                    continue;
                };
                if guard.is_destroyed() || guard.evictable_pages().next().is_none() {
                    continue;
                }
                best = Some(Victim { region, guard });
            }
        }
        best
    }

    /// Picks a resident, non-COW, not yet swapped page uniformly at random.
    pub(crate) fn get_pg_idx_for_swap(&self, region: &RegionState) -> Option<usize> {
        let mut rng = self.rng.lock();
        region.evictable_pages().choose(&mut *rng)
    }

    /// Evicts up to `count` pages and returns how many were written out.
    pub(crate) fn swap_out(&self, vmm: &Vmm, count: usize) -> VmResult<usize> {
        let mut done = 0;
        let mut skip = HashSet::new();
        while done < count {
            let mut keep = Vec::new();
            let mut targets: Vec<(Arc<AddressSpace>, usize)> = Vec::new();
            let Some(mut victim) = self.get_lru_region(vmm, &mut keep, &skip) else {
                break;
            };
            let Some(index) = self.get_pg_idx_for_swap(&victim.guard) else {
                skip.insert(victim.region.id());
                continue;
            };
            if !vmm.collect_owners(&victim.guard, &mut targets) {
                // An owner is being torn down; leave the region to it.
                skip.insert(victim.region.id());
                continue;
            }
            let block = match self.allocate_block() {
                Ok(block) => block,
                Err(err) if done == 0 => return Err(err),
                Err(_) => break,
            };
            match self.evict(vmm, &mut victim.guard, index, block, &targets) {
                Ok(true) => {
                    log::debug!(
                        target: "vmm::swap",
                        "region {:?} page {} -> block {}",
                        victim.region.id(),
                        index,
                        block
                    );
                    done += 1;
                }
                Ok(false) => {
                    self.release_block(block);
                    skip.insert(victim.region.id());
                }
                Err(err) => {
                    self.release_block(block);
                    return Err(err);
                }
            }
            drop(victim);
        }
        Ok(done)
    }

    fn evict(
        &self,
        vmm: &Vmm,
        region: &mut RegionState,
        index: usize,
        block: usize,
        targets: &[(Arc<AddressSpace>, usize)],
    ) -> VmResult<bool> {
        let offset = index * PAGE_SIZE;
        let mut removed: Vec<(&AddressSpace, usize, Pte)> = Vec::new();
        for (space, base) in targets {
            let va = base + offset;
            let result = space.mmu.lock().unmap(va);
            if let Ok((pte, _)) = result {
                space.counters.sub_resident(pte.is_shared());
                space.counters.add_swapped();
                removed.push((space.as_ref(), va, pte));
            }
        }
        let Some(frame) = removed.first().map(|(_, _, pte)| pte.frame()) else {
            log::warn!(target: "vmm::swap", "evictable page {} has no mapping", index);
            return Ok(false);
        };
        for (space, va, _) in &removed {
            vmm.tlb().shootdown(space.id(), *va);
        }

        let mut staging = vec![0u8; PAGE_SIZE];
        vmm.memory().read_frame(frame, 0, &mut staging);
        if let Err(err) = self.write_block(block, &staging) {
            log::error!(target: "vmm::swap", "swap-out of page {} failed: {}", index, err);
            for (space, va, pte) in &removed {
                let restored = space.mmu.lock().map(*va, pte.frame(), pte.flags());
                if restored.is_ok() {
                    space.counters.sub_swapped();
                    space.counters.add_resident(pte.is_shared());
                }
            }
            return Err(err);
        }
        vmm.memory().free(frame);
        let dirty = removed.iter().any(|(_, _, pte)| pte.flags().contains(PteFlags::DIRTY));
        if dirty && region.is_shareable() && region.file().is_some() {
            region.mark_dirty(index);
        }
        region.insert_page_state(index, PageState::SWAPPED);
        region.set_swap_block(index, Some(block));
        Ok(true)
    }

    /// Brings page `index` of a locked region back from swap into every target.
    ///
    /// Returns `Ok(false)` when the page is no longer swapped out.
    pub(crate) fn swap_in(
        &self,
        vmm: &Vmm,
        region: &mut RegionState,
        index: usize,
        reservation: &mut FrameReservation<'_>,
        targets: &[(&AddressSpace, usize)],
    ) -> VmResult<bool> {
        if !region.page_state(index).contains(PageState::SWAPPED) {
            return Ok(false);
        }
        let block = region.swap_block(index).ok_or(VmError::InvalidHandle)?;
        let mut staging = vec![0u8; PAGE_SIZE];
        if let Err(err) = self.read_block(block, &mut staging) {
            log::error!(target: "vmm::swap", "swap-in of block {} failed: {}", block, err);
            return Err(err);
        }
        let frame = reservation.take()?;
        vmm.memory().write_frame(frame, 0, &staging);

        let flags = leaf_flags(region.flags(), false);
        if let Err(err) = install_page(targets, index, frame, flags) {
            vmm.memory().free(frame);
            return Err(err);
        }
        for (space, _) in targets {
            space.counters.sub_swapped();
        }
        region.clear_page_state(index, PageState::SWAPPED);
        region.set_swap_block(index, None);
        self.release_block(block);
        log::debug!(target: "vmm::swap", "block {} -> page {} ({})", block, index, frame);
        Ok(true)
    }
}
