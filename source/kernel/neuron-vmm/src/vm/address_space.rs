// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address space: VmRegion interval map, placement, map/unmap/join/grow
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, VmRegion, VmRegionInfo, MapRequest, MapFlags, Prot, FrameCounters
//! DEPENDS_ON: vm::region, vm::cow, vm::swap, mm::page_table, hal
//! INVARIANTS: VmRegions never overlap; counters equal the resident/shared/swapped pages of
//!             every mapped region; failed operations leave tree, regions and PTEs untouched
//!
//! Lock order: address-space state, then region, then page table. The page table is a
//! leaf lock; when two are needed they are taken in `SpaceId` order. Counters are
//! atomics so the swapper can adjust them without the address-space lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{VmError, VmResult};
use crate::hal::{FileBackend, FrameReservation};
use crate::mm::page_table::{clone_pages, MapError, PageTable, Pte, PteFlags};
use crate::types::{
    is_page_aligned, page_align_down, page_align_up, Access, FrameNo, RegionId, SpaceId, ThreadId,
    PAGE_SIZE,
};
use crate::vm::region::{PageState, Region, RegionFlags, RegionState, Release};
use crate::vm::Vmm;

bitflags! {
    /// Access protection requested for a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u16 {
        /// Map exactly at the requested address or fail.
        const FIXED = 1 << 0;
        /// Shareable region; file-backed shareable mappings are joined by file range.
        const SHARED = 1 << 1;
        /// Resolve every page before returning.
        const POPULATE = 1 << 2;
        /// Grows-down stack placed in the stack area.
        const STACK = 1 << 3;
        const GROWABLE = 1 << 4;
        /// Physically contiguous anonymous memory.
        const CONTIGUOUS = 1 << 5;
        /// Fixed physical frames owned by a device.
        const DEVICE = 1 << 6;
        /// Never swapped out.
        const LOCKED = 1 << 7;
    }
}

/// Arguments of [`AddressSpace::map`].
#[derive(Clone)]
pub struct MapRequest {
    pub addr: Option<usize>,
    pub length: usize,
    /// Bytes backed by the file; the rest of the mapping is zero fill.
    pub load_count: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub file: Option<Arc<dyn FileBackend>>,
    pub offset: u64,
    /// First frame of a device mapping.
    pub phys: Option<FrameNo>,
    /// Frame alignment of a contiguous mapping.
    pub phys_align: usize,
    /// Thread owning a stack or TLS mapping.
    pub thread: Option<ThreadId>,
}

impl MapRequest {
    pub fn anonymous(length: usize) -> Self {
        Self {
            addr: None,
            length,
            load_count: 0,
            prot: Prot::READ | Prot::WRITE,
            flags: MapFlags::empty(),
            file: None,
            offset: 0,
            phys: None,
            phys_align: 1,
            thread: None,
        }
    }

    pub fn file(file: Arc<dyn FileBackend>, offset: u64, length: usize, load_count: usize) -> Self {
        Self { file: Some(file), offset, load_count, prot: Prot::READ, ..Self::anonymous(length) }
    }

    pub fn stack(length: usize, thread: ThreadId) -> Self {
        Self { flags: MapFlags::STACK, thread: Some(thread), ..Self::anonymous(length) }
    }

    pub fn device(phys: FrameNo, length: usize) -> Self {
        Self { phys: Some(phys), flags: MapFlags::DEVICE, ..Self::anonymous(length) }
    }

    /// Placement hint; combine with [`MapFlags::FIXED`] to make it mandatory.
    pub fn at(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn fixed(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self.flags |= MapFlags::FIXED;
        self
    }

    pub fn prot(mut self, prot: Prot) -> Self {
        self.prot = prot;
        self
    }

    pub fn flags(mut self, flags: MapFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn align(mut self, frames: usize) -> Self {
        self.phys_align = frames;
        self
    }

    pub fn thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }
}

/// Frame usage of one address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub own: usize,
    pub shared: usize,
    pub swapped: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    own: AtomicUsize,
    shared: AtomicUsize,
    swapped: AtomicUsize,
}

impl Counters {
    fn resident(&self, shared: bool) -> &AtomicUsize {
        if shared {
            &self.shared
        } else {
            &self.own
        }
    }

    pub fn add_resident(&self, shared: bool) {
        self.add_resident_n(shared, 1);
    }

    pub fn add_resident_n(&self, shared: bool, count: usize) {
        self.resident(shared).fetch_add(count, Ordering::Relaxed);
    }

    pub fn sub_resident(&self, shared: bool) {
        self.resident(shared).fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_swapped(&self) {
        self.add_swapped_n(1);
    }

    pub fn add_swapped_n(&self, count: usize) {
        self.swapped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sub_swapped(&self) {
        self.swapped.fetch_sub(1, Ordering::Relaxed);
    }

    /// Resident private page became shared copy-on-write, or the reverse.
    pub fn share_one(&self) {
        self.own.fetch_sub(1, Ordering::Relaxed);
        self.shared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unshare(&self, count: usize) {
        self.shared.fetch_sub(count, Ordering::Relaxed);
        self.own.fetch_add(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FrameCounters {
        FrameCounters {
            own: self.own.load(Ordering::Relaxed),
            shared: self.shared.load(Ordering::Relaxed),
            swapped: self.swapped.load(Ordering::Relaxed),
        }
    }
}

/// Binding of a region at a virtual base inside one address space.
#[derive(Clone)]
pub struct VmRegion {
    pub(crate) base: usize,
    pub(crate) len: usize,
    pub(crate) region: Arc<Region>,
    pub(crate) thread: Option<ThreadId>,
}

impl VmRegion {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub(crate) fn info(&self, flags: RegionFlags) -> VmRegionInfo {
        VmRegionInfo {
            base: self.base,
            len: self.len,
            flags,
            region: self.region.id(),
            thread: self.thread,
        }
    }
}

impl fmt::Debug for VmRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .field("region", &self.region.id())
            .finish()
    }
}

/// Point-in-time description of a mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmRegionInfo {
    pub base: usize,
    pub len: usize,
    pub flags: RegionFlags,
    pub region: RegionId,
    pub thread: Option<ThreadId>,
}

pub(crate) struct SpaceState {
    pub tree: BTreeMap<usize, VmRegion>,
    pub data_segment: usize,
    /// Lowest address reserved for stacks so far; general placement stays below it.
    pub stack_cursor: usize,
}

impl SpaceState {
    pub(crate) fn find_base(&self, addr: usize) -> Option<usize> {
        self.tree
            .range(..=addr)
            .next_back()
            .filter(|(_, vm)| addr < vm.end())
            .map(|(base, _)| *base)
    }

    fn overlapping(&self, start: usize, end: usize) -> Option<usize> {
        self.tree
            .range(..end)
            .next_back()
            .filter(|(_, vm)| vm.end() > start)
            .map(|(base, _)| *base)
    }

    fn first_fit(&self, len: usize, lower: usize, upper: usize) -> Option<usize> {
        let mut cursor = match self.find_base(lower) {
            Some(base) => self.tree.get(&base)?.end(),
            None => lower,
        };
        for (base, vm) in self.tree.range(cursor..) {
            if *base >= upper {
                break;
            }
            if base - cursor >= len {
                return Some(cursor);
            }
            cursor = cursor.max(vm.end());
        }
        cursor.checked_add(len).filter(|end| *end <= upper).map(|_| cursor)
    }
}

/// Leaf PTE flags for a resident page of a region with `flags`.
pub(crate) fn leaf_flags(flags: RegionFlags, cow: bool) -> PteFlags {
    let mut pte = PteFlags::VALID | PteFlags::READ | PteFlags::USER;
    if flags.contains(RegionFlags::WRITABLE) && !cow {
        pte |= PteFlags::WRITE;
    }
    if flags.contains(RegionFlags::EXECUTABLE) {
        pte |= PteFlags::EXECUTE;
    }
    if cow || flags.intersects(RegionFlags::SHAREABLE | RegionFlags::NO_FREE) {
        pte |= PteFlags::SHARED;
    }
    pte
}

/// Maps `frame` as page `index` in every target and accounts it. All or nothing.
pub(crate) fn install_page(
    targets: &[(&AddressSpace, usize)],
    index: usize,
    frame: FrameNo,
    flags: PteFlags,
) -> VmResult<()> {
    let offset = index * PAGE_SIZE;
    for (done, (space, base)) in targets.iter().enumerate() {
        let result = space.mmu.lock().map(base + offset, frame, flags);
        if let Err(err) = result {
            for (space, base) in &targets[..done] {
                let _ = space.mmu.lock().unmap(base + offset);
            }
            return Err(err.into());
        }
    }
    for (space, _) in targets {
        space.counters.add_resident(flags.contains(PteFlags::SHARED));
    }
    Ok(())
}

/// Locks the states of two distinct spaces in id order; returns them as `(a, b)`.
pub(crate) fn lock_states<'a>(
    a: &'a AddressSpace,
    b: &'a AddressSpace,
) -> (MutexGuard<'a, SpaceState>, MutexGuard<'a, SpaceState>) {
    if a.id < b.id {
        let first = a.state.lock();
        (first, b.state.lock())
    } else {
        let first = b.state.lock();
        (a.state.lock(), first)
    }
}

pub(crate) fn lock_tables<'a>(
    a: &'a AddressSpace,
    b: &'a AddressSpace,
) -> (MutexGuard<'a, Box<dyn PageTable>>, MutexGuard<'a, Box<dyn PageTable>>) {
    if a.id < b.id {
        let first = a.mmu.lock();
        (first, b.mmu.lock())
    } else {
        let first = b.mmu.lock();
        (a.mmu.lock(), first)
    }
}

/// Retries of the translate/fault loop used by the byte accessors.
const ACCESS_RETRIES: usize = 4;

pub struct AddressSpace {
    id: SpaceId,
    pub(crate) vmm: Arc<Vmm>,
    pub(crate) state: Mutex<SpaceState>,
    pub(crate) mmu: Mutex<Box<dyn PageTable>>,
    pub(crate) counters: Counters,
    destroyed: AtomicBool,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId, vmm: Arc<Vmm>, table: Box<dyn PageTable>) -> Self {
        let config = vmm.config();
        let state = SpaceState {
            tree: BTreeMap::new(),
            data_segment: config.user_base,
            stack_cursor: config.stack_top,
        };
        Self {
            id,
            vmm,
            state: Mutex::new(state),
            mmu: Mutex::new(table),
            counters: Counters::default(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn vmm(&self) -> &Arc<Vmm> {
        &self.vmm
    }

    pub fn counters(&self) -> FrameCounters {
        self.counters.snapshot()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> VmResult<()> {
        if self.is_destroyed() {
            return Err(VmError::InvalidHandle);
        }
        Ok(())
    }

    /// Page-table entry currently installed for `vaddr`.
    pub fn translate(&self, vaddr: usize) -> Option<Pte> {
        self.mmu.lock().lookup(page_align_down(vaddr))
    }

    /// Ordered description of every mapping.
    pub fn snapshot(&self) -> Vec<VmRegionInfo> {
        let state = self.state.lock();
        state.tree.values().map(|vm| vm.info(vm.region.lock().flags())).collect()
    }

    /// Mapping containing `addr`.
    pub fn region_at(&self, addr: usize) -> Option<VmRegionInfo> {
        let state = self.state.lock();
        let vm = state.tree.get(&state.find_base(addr)?)?;
        let flags = vm.region.lock().flags();
        Some(vm.info(flags))
    }

    pub fn data_segment(&self) -> usize {
        self.state.lock().data_segment
    }

    /// Moves the floor of the free-area search.
    pub fn set_data_segment(&self, addr: usize) -> VmResult<()> {
        let config = self.vmm.config();
        if !is_page_aligned(addr) || addr < config.user_base || addr >= config.user_top {
            return Err(VmError::InvalidArgs);
        }
        self.state.lock().data_segment = addr;
        Ok(())
    }

    /// Regions mapped here, or `None` when the state lock is contended.
    pub(crate) fn try_regions(&self) -> Option<Vec<Arc<Region>>> {
        let state = self.state.try_lock()?;
        Some(state.tree.values().map(|vm| vm.region.clone()).collect())
    }

    /// Owners that must see page updates of `region`: every live owner of a shareable
    /// region, or just this space at `base`.
    pub(crate) fn owner_targets<'a>(
        &'a self,
        region: &RegionState,
        base: usize,
        remote: &'a mut Vec<(Arc<AddressSpace>, usize)>,
    ) -> Vec<(&'a AddressSpace, usize)> {
        if !region.is_shareable() {
            return vec![(self, base)];
        }
        self.vmm.collect_owners(region, remote);
        let remote: &'a Vec<(Arc<AddressSpace>, usize)> = remote;
        remote.iter().map(|(space, base)| (space.as_ref(), *base)).collect()
    }

    /// Creates a mapping and returns its description.
    pub fn map(&self, req: MapRequest) -> VmResult<VmRegionInfo> {
        self.check_alive()?;
        let mut remote = Vec::new();
        let mut state = self.state.lock();
        self.map_locked(&mut state, &req, &mut remote)
    }

    fn region_flags(&self, req: &MapRequest) -> VmResult<RegionFlags> {
        let mut flags = RegionFlags::empty();
        if req.prot.contains(Prot::WRITE) {
            flags |= RegionFlags::WRITABLE;
        }
        if req.prot.contains(Prot::EXEC) {
            flags |= RegionFlags::EXECUTABLE;
        }
        if flags.contains(RegionFlags::WRITABLE | RegionFlags::EXECUTABLE) {
            return Err(VmError::InvalidArgs);
        }
        let anonymous = req.file.is_none();
        let f = req.flags;
        if f.contains(MapFlags::SHARED) {
            if f.intersects(MapFlags::STACK | MapFlags::GROWABLE) {
                return Err(VmError::InvalidArgs);
            }
            flags |= RegionFlags::SHAREABLE;
        }
        if f.contains(MapFlags::STACK) {
            if !anonymous || f.contains(MapFlags::FIXED) {
                return Err(VmError::InvalidArgs);
            }
            flags |= RegionFlags::STACK | RegionFlags::GROWABLE | RegionFlags::GROWS_DOWN;
        }
        if f.contains(MapFlags::GROWABLE) {
            if !anonymous {
                return Err(VmError::InvalidArgs);
            }
            flags |= RegionFlags::GROWABLE;
        }
        if f.intersects(MapFlags::CONTIGUOUS | MapFlags::DEVICE) {
            if !anonymous
                || f.contains(MapFlags::CONTIGUOUS | MapFlags::DEVICE)
                || flags.contains(RegionFlags::GROWABLE)
            {
                return Err(VmError::InvalidArgs);
            }
            flags |= RegionFlags::LOCKED;
        }
        if f.contains(MapFlags::CONTIGUOUS) {
            flags |= RegionFlags::CONTIGUOUS;
        }
        if f.contains(MapFlags::DEVICE) {
            if req.phys.is_none() {
                return Err(VmError::InvalidArgs);
            }
            flags |= RegionFlags::NO_FREE;
        }
        if f.contains(MapFlags::LOCKED) {
            flags |= RegionFlags::LOCKED;
        }
        Ok(flags)
    }

    fn check_fixed(&self, state: &SpaceState, addr: usize, len: usize) -> VmResult<()> {
        let config = self.vmm.config();
        let end = addr.checked_add(len).ok_or(VmError::InvalidArgs)?;
        if !is_page_aligned(addr) || addr < config.user_base || end > config.user_top {
            return Err(VmError::InvalidArgs);
        }
        if state.overlapping(addr, end).is_some() {
            return Err(VmError::AddressConflict { addr });
        }
        Ok(())
    }

    fn find_free_area(&self, state: &SpaceState, len: usize) -> VmResult<usize> {
        let lower = state.data_segment.max(self.vmm.config().user_base);
        state.first_fit(len, lower, state.stack_cursor).ok_or(VmError::OutOfMemory)
    }

    /// Places a stack of `len` bytes at the top of a fresh stack reservation below the
    /// cursor. Returns `(base, new cursor)`.
    fn find_stack_area(&self, state: &SpaceState, len: usize) -> VmResult<(usize, usize)> {
        let config = self.vmm.config();
        let reservation = config.stack_reservation();
        if len > config.max_stack_pages * PAGE_SIZE {
            return Err(VmError::LimitExceeded);
        }
        let lower = state.data_segment.max(config.user_base);
        let mut top = state.stack_cursor;
        loop {
            let bottom = top.checked_sub(reservation).filter(|bottom| *bottom >= lower);
            let Some(bottom) = bottom else {
                return Err(VmError::OutOfMemory);
            };
            match state.overlapping(bottom, top) {
                Some(base) => top = base,
                None => return Ok((top - len, bottom)),
            }
        }
    }

    fn place(&self, state: &SpaceState, req: &MapRequest, len: usize) -> VmResult<(usize, Option<usize>)> {
        if req.flags.contains(MapFlags::STACK) {
            let (base, cursor) = self.find_stack_area(state, len)?;
            return Ok((base, Some(cursor)));
        }
        match req.addr {
            Some(addr) if req.flags.contains(MapFlags::FIXED) => {
                self.check_fixed(state, addr, len)?;
                Ok((addr, None))
            }
            Some(addr) if self.check_fixed(state, addr, len).is_ok() => Ok((addr, None)),
            _ => Ok((self.find_free_area(state, len)?, None)),
        }
    }

    pub(crate) fn map_locked(
        &self,
        state: &mut SpaceState,
        req: &MapRequest,
        remote: &mut Vec<(Arc<AddressSpace>, usize)>,
    ) -> VmResult<VmRegionInfo> {
        if req.length == 0 || req.load_count > req.length {
            return Err(VmError::InvalidArgs);
        }
        if req.file.is_none() && req.load_count != 0 {
            return Err(VmError::InvalidArgs);
        }
        let len = page_align_up(req.length).ok_or(VmError::InvalidArgs)?;
        let flags = self.region_flags(req)?;
        let (base, cursor) = self.place(state, req, len)?;

        let shared_file = flags.contains(RegionFlags::SHAREABLE) && req.file.is_some();
        let (region, joined) = match &req.file {
            Some(file) if shared_file => self.vmm.shared_region(file, req, len, flags)?,
            _ => {
                let page_state = if req.flags.intersects(MapFlags::CONTIGUOUS | MapFlags::DEVICE) {
                    PageState::empty()
                } else {
                    PageState::DEMAND_LOAD
                };
                let region_state =
                    RegionState::new(req.file.clone(), len, req.load_count, req.offset, page_state, flags)?
                        .with_phys_align(req.phys_align);
                let region = Region::new(self.vmm.next_region_id(), region_state, self.vmm.tick());
                (Arc::new(region), false)
            }
        };

        let vm = VmRegion { base, len, region: region.clone(), thread: req.thread };
        let mut guard = region.lock();
        if joined {
            if guard.byte_count() != len || guard.owners().contains(self.id) {
                return Err(VmError::AddressConflict { addr: base });
            }
        }
        guard.add_owner(self.id, base)?;
        state.tree.insert(base, vm.clone());
        region.touch(self.vmm.tick());

        let populated = if joined {
            self.attach_shared(&guard, base, remote)
        } else {
            self.populate_new(&mut guard, base, req, remote)
        };
        if let Err(err) = populated {
            log::warn!(target: "vmm", "map at {:#x} rolled back: {}", base, err);
            drop(guard);
            state.tree.remove(&base);
            self.release_vm(&vm);
            return Err(err);
        }
        if let Some(cursor) = cursor {
            state.stack_cursor = cursor;
        }
        log::debug!(
            target: "vmm",
            "{:?}: mapped {:#x}..{:#x} {:?}{}",
            self.id,
            base,
            base + len,
            flags,
            if joined { " (joined)" } else { "" }
        );
        Ok(vm.info(guard.flags()))
    }

    /// Makes the pages already resident in another owner visible here.
    fn attach_shared(
        &self,
        region: &RegionState,
        base: usize,
        remote: &mut Vec<(Arc<AddressSpace>, usize)>,
    ) -> VmResult<()> {
        self.counters.add_swapped_n(region.swapped_pages());
        self.vmm.collect_owners(region, remote);
        let Some((source, source_base)) = remote.iter().find(|(space, _)| space.id != self.id) else {
            return Ok(());
        };
        let (source_table, mut table) = lock_tables(source, self);
        let cloned = clone_pages(
            &**source_table,
            &mut **table,
            *source_base,
            base,
            region.page_count(),
            true,
        )?;
        self.counters.add_resident_n(true, cloned);
        Ok(())
    }

    fn populate_new(
        &self,
        region: &mut RegionState,
        base: usize,
        req: &MapRequest,
        remote: &mut Vec<(Arc<AddressSpace>, usize)>,
    ) -> VmResult<()> {
        let pages = region.page_count();
        if let Some(phys) = req.phys.filter(|_| req.flags.contains(MapFlags::DEVICE)) {
            let flags = leaf_flags(region.flags(), false);
            let mut table = self.mmu.lock();
            for index in 0..pages {
                table.map(base + index * PAGE_SIZE, FrameNo::new(phys.raw() + index), flags)?;
                self.counters.add_resident(true);
            }
            return Ok(());
        }
        if req.flags.contains(MapFlags::CONTIGUOUS) {
            let memory = self.vmm.memory();
            let first = memory
                .allocate_contiguous(pages, req.phys_align.max(1))
                .ok_or(VmError::OutOfMemory)?;
            let flags = leaf_flags(region.flags(), false);
            let mut table = self.mmu.lock();
            for index in 0..pages {
                let frame = FrameNo::new(first.raw() + index);
                if let Err(err) = table.map(base + index * PAGE_SIZE, frame, flags) {
                    for rest in index..pages {
                        memory.free(FrameNo::new(first.raw() + rest));
                    }
                    return Err(err.into());
                }
                self.counters.add_resident(false);
            }
            return Ok(());
        }
        if req.flags.intersects(MapFlags::POPULATE | MapFlags::LOCKED) {
            self.populate(region, base, remote)?;
        }
        Ok(())
    }

    /// Resolves every pending page of a locked region.
    pub(crate) fn populate(
        &self,
        region: &mut RegionState,
        base: usize,
        remote: &mut Vec<(Arc<AddressSpace>, usize)>,
    ) -> VmResult<usize> {
        let pending: Vec<usize> = (0..region.page_count())
            .filter(|index| {
                region.page_state(*index).intersects(PageState::DEMAND_LOAD | PageState::SWAPPED)
            })
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut reservation = FrameReservation::new(self.vmm.memory(), pending.len())?;
        let targets = self.owner_targets(region, base, remote);
        for index in &pending {
            if region.page_state(*index).contains(PageState::SWAPPED) {
                self.vmm.swap().swap_in(&self.vmm, region, *index, &mut reservation, &targets)?;
            } else {
                self.demand_load(region, *index, &mut reservation, &targets)?;
            }
        }
        Ok(pending.len())
    }

    /// Removes the mapping whose base is `addr`.
    pub fn unmap(&self, addr: usize) -> VmResult<()> {
        let mut state = self.state.lock();
        let vm = state.tree.remove(&addr).ok_or(VmError::Unmapped { addr })?;
        self.release_vm(&vm);
        log::debug!(target: "vmm", "{:?}: unmapped {:#x}..{:#x}", self.id, vm.base, vm.end());
        Ok(())
    }

    /// Drops this space's ownership of a mapping already removed from the tree.
    ///
    /// The last owner writes back dirty shared file pages and frees every frame and
    /// swap block; other owners only lose their PTEs.
    pub(crate) fn release_vm(&self, vm: &VmRegion) {
        let mut region = vm.region.lock();
        let last = match region.remove_owner(self.id) {
            Ok(release) => release == Release::Destroyed,
            Err(err) => {
                log::warn!(target: "vmm", "{:?}: release of {:?}: {}", self.id, vm.region.id(), err);
                return;
            }
        };
        if last && region.is_shareable() && region.file().is_some() {
            if let Err(err) = self.write_back(&mut region, &[(self, vm.base)]) {
                log::error!(target: "vmm", "write-back of {:?} failed: {}", vm.region.id(), err);
            }
        }
        for index in 0..region.page_count() {
            let page = region.page_state(index);
            if page.contains(PageState::SWAPPED) {
                if let Some(block) = region.swap_block(index) {
                    self.counters.sub_swapped();
                    if last {
                        self.vmm.swap().release_block(block);
                        region.set_swap_block(index, None);
                    }
                }
                continue;
            }
            self.release_page(&mut region, index, vm.base + index * PAGE_SIZE, last);
        }
        drop(region);
        if last {
            self.vmm.unregister_shared(&vm.region);
        }
    }

    /// Unmaps page `index` of a locked region and frees its frame when nobody else
    /// holds it. A departing owner's dirty bit is kept in the region for write-back.
    fn release_page(&self, region: &mut RegionState, index: usize, va: usize, last: bool) {
        let removed = self.mmu.lock().unmap(va);
        let Ok((pte, _)) = removed else {
            return;
        };
        self.vmm.tlb().shootdown(self.id, va);
        self.counters.sub_resident(pte.is_shared());
        let flags = region.flags();
        let page = region.page_state(index);
        if !last && pte.flags().contains(PteFlags::DIRTY) && region.is_shareable() && region.file().is_some() {
            region.mark_dirty(index);
        }
        let memory = self.vmm.memory();
        if page.contains(PageState::COPY_ON_WRITE) {
            let (freed, _) = self.vmm.cow().remove(pte.frame());
            if freed == 1 {
                memory.free(pte.frame());
            }
        } else if !flags.contains(RegionFlags::NO_FREE) && (last || !pte.is_shared()) {
            memory.free(pte.frame());
        }
    }

    /// Writes dirty pages of a shared file region back to the file.
    ///
    /// A page is dirty when the region carries its marker or any target PTE has the
    /// DIRTY bit. Both are cleared before the write and the marker is restored if the
    /// write fails. Swapped pages are written from their swap block.
    fn write_back(&self, region: &mut RegionState, targets: &[(&AddressSpace, usize)]) -> VmResult<usize> {
        let Some(file) = region.file().cloned() else {
            return Ok(0);
        };
        let memory = self.vmm.memory();
        let mut staging = vec![0u8; PAGE_SIZE];
        let mut written = 0;
        for index in 0..region.page_count() {
            let (offset, bytes) = region.load_range(index);
            let page = region.page_state(index);
            if bytes == 0 || page.contains(PageState::DEMAND_LOAD) {
                continue;
            }
            let mut dirty = region.take_dirty(index);
            let mut frame = None;
            if !page.contains(PageState::SWAPPED) {
                for (space, base) in targets {
                    let va = base + index * PAGE_SIZE;
                    let mut table = space.mmu.lock();
                    let Some(pte) = table.lookup(va) else {
                        continue;
                    };
                    frame = Some(pte.frame());
                    if pte.flags().contains(PteFlags::DIRTY) {
                        if let Err(err) = table.update(va, PteFlags::empty(), PteFlags::DIRTY) {
                            region.mark_dirty(index);
                            return Err(err.into());
                        }
                        dirty = true;
                    }
                }
            }
            if !dirty {
                continue;
            }
            let staged = match (page.contains(PageState::SWAPPED), frame) {
                (true, _) => match region.swap_block(index) {
                    Some(block) => self.vmm.swap().read_block(block, &mut staging),
                    None => Err(VmError::InvalidHandle),
                },
                (false, Some(frame)) => {
                    memory.read_frame(frame, 0, &mut staging);
                    Ok(())
                }
                (false, None) => Err(VmError::Mapping(MapError::NotMapped)),
            };
            let result = staged.and_then(|()| {
                file.write_all_at(offset, &staging[..bytes])
                    .map_err(|err| VmError::io("write-back", err))
            });
            if let Err(err) = result {
                region.mark_dirty(index);
                return Err(err);
            }
            written += 1;
        }
        Ok(written)
    }

    /// Writes back the dirty pages of the shared file mapping containing `addr`.
    pub fn sync(&self, addr: usize) -> VmResult<usize> {
        let mut remote = Vec::new();
        let state = self.state.lock();
        let vm = state.tree.get(&state.find_base(addr).ok_or(VmError::Unmapped { addr })?).cloned();
        let vm = vm.ok_or(VmError::Unmapped { addr })?;
        let mut region = vm.region.lock();
        if !region.is_shareable() || region.file().is_none() {
            return Ok(0);
        }
        let targets = self.owner_targets(&region, vm.base, &mut remote);
        let written = self.write_back(&mut region, &targets)?;
        log::debug!(target: "vmm", "{:?}: synced {} pages at {:#x}", self.id, written, vm.base);
        Ok(written)
    }

    /// Joins the shareable region mapped at `src_addr` in `src` into this space.
    pub fn join(&self, src: &AddressSpace, src_addr: usize, dst_addr: Option<usize>) -> VmResult<VmRegionInfo> {
        self.check_alive()?;
        src.check_alive()?;
        if src.id == self.id {
            return Err(VmError::AddressConflict { addr: dst_addr.unwrap_or(src_addr) });
        }
        if !Arc::ptr_eq(&self.vmm, &src.vmm) {
            return Err(VmError::InvalidArgs);
        }
        let (mut state, src_state) = lock_states(self, src);
        let src_base = src_state.find_base(src_addr).ok_or(VmError::Unmapped { addr: src_addr })?;
        let vm = src_state.tree.get(&src_base).cloned().ok_or(VmError::Unmapped { addr: src_addr })?;
        let mut region = vm.region.lock();
        if !region.is_shareable() {
            return Err(VmError::NotShareable);
        }
        let base = match dst_addr {
            Some(addr) => {
                self.check_fixed(&state, addr, vm.len)?;
                addr
            }
            None => self.find_free_area(&state, vm.len)?,
        };
        region.add_owner(self.id, base)?;
        let cloned = {
            let (src_table, mut table) = lock_tables(src, self);
            clone_pages(
                &**src_table,
                &mut **table,
                src_base,
                base,
                region.page_count(),
                true,
            )
        };
        let cloned = match cloned {
            Ok(cloned) => cloned,
            Err(err) => {
                let _ = region.remove_owner(self.id);
                return Err(err.into());
            }
        };
        self.counters.add_resident_n(true, cloned);
        self.counters.add_swapped_n(region.swapped_pages());
        let joined = VmRegion { base, len: vm.len, region: vm.region.clone(), thread: None };
        state.tree.insert(base, joined.clone());
        vm.region.touch(self.vmm.tick());
        log::debug!(target: "vmm", "{:?}: joined {:?} from {:?} at {:#x}", self.id, vm.region.id(), src.id, base);
        Ok(joined.info(region.flags()))
    }

    /// Resizes the growable mapping containing `addr` by `delta` pages and returns the
    /// number of swapped pages released by a shrink.
    pub fn grow(&self, addr: usize, delta: isize) -> VmResult<usize> {
        let mut state = self.state.lock();
        let base = state.find_base(addr).ok_or(VmError::Unmapped { addr })?;
        self.grow_locked(&mut state, base, delta)
    }

    pub(crate) fn grow_locked(&self, state: &mut SpaceState, base: usize, delta: isize) -> VmResult<usize> {
        let vm = state.tree.get(&base).cloned().ok_or(VmError::Unmapped { addr: base })?;
        let config = self.vmm.config();
        let mut region = vm.region.lock();
        let flags = region.flags();
        if !flags.contains(RegionFlags::GROWABLE) || flags.contains(RegionFlags::SHAREABLE) {
            return Err(VmError::NotGrowable);
        }
        if delta == 0 {
            return Ok(0);
        }
        let down = flags.contains(RegionFlags::GROWS_DOWN);
        let pages = region.page_count();
        let count = delta.unsigned_abs();
        let bytes = count.checked_mul(PAGE_SIZE).ok_or(VmError::InvalidArgs)?;

        if delta > 0 {
            let total = pages.checked_add(count).ok_or(VmError::LimitExceeded)?;
            if flags.contains(RegionFlags::STACK) && total > config.max_stack_pages {
                return Err(VmError::LimitExceeded);
            }
            let (start, end) = if down {
                let start = base.checked_sub(bytes).filter(|start| *start >= config.user_base);
                (start.ok_or(VmError::LimitExceeded)?, base)
            } else {
                let end = vm.end().checked_add(bytes).filter(|end| *end <= config.user_top);
                (vm.end(), end.ok_or(VmError::OutOfMemory)?)
            };
            let guard_gap = if down { config.stack_guard_pages * PAGE_SIZE } else { 0 };
            if let Some(other) = state.overlapping(start.saturating_sub(guard_gap), end) {
                return Err(VmError::AddressConflict { addr: other });
            }
            region.grow(delta, PageState::DEMAND_LOAD)?;
            if down {
                region.rebase_owner(self.id, start);
            }
            drop(region);
            state.tree.remove(&base);
            let new_base = if down { start } else { base };
            state.tree.insert(new_base, VmRegion { base: new_base, len: vm.len + bytes, ..vm });
            return Ok(0);
        }

        if count >= pages {
            return Err(VmError::InvalidArgs);
        }
        let dropped = if down { 0..count } else { pages - count..pages };
        for index in dropped {
            let page = region.page_state(index);
            if !page.intersects(PageState::SWAPPED | PageState::DEMAND_LOAD) {
                self.release_page(&mut region, index, base + index * PAGE_SIZE, true);
            }
        }
        let released = region.grow(delta, PageState::empty())?;
        for block in &released {
            self.vmm.swap().release_block(*block);
            self.counters.sub_swapped();
        }
        let new_base = if down { base + bytes } else { base };
        if down {
            region.rebase_owner(self.id, new_base);
        }
        drop(region);
        state.tree.remove(&base);
        state.tree.insert(new_base, VmRegion { base: new_base, len: vm.len - bytes, ..vm });
        Ok(released.len())
    }

    /// Grows the stack right above `addr` down far enough to cover it.
    pub fn grow_stack_to(&self, addr: usize) -> VmResult<()> {
        let mut state = self.state.lock();
        if state.find_base(addr).is_some() {
            return Ok(());
        }
        let base = self.stack_above(&state, addr).ok_or(VmError::Unmapped { addr })?;
        let pages = (base - page_align_down(addr)) / PAGE_SIZE;
        self.grow_locked(&mut state, base, pages as isize)?;
        Ok(())
    }

    /// Base of the grows-down mapping directly above `addr`, if any.
    pub(crate) fn stack_above(&self, state: &SpaceState, addr: usize) -> Option<usize> {
        let (base, vm) = state.tree.range(addr..).next()?;
        let flags = vm.region.lock().flags();
        flags.contains(RegionFlags::GROWS_DOWN).then_some(*base)
    }

    /// Marks every region locked and resolves all of their pending pages.
    ///
    /// On failure the regions locked by this call are unlocked again. Pages already
    /// resolved stay resident.
    pub fn lock_all(&self) -> VmResult<usize> {
        self.check_alive()?;
        let state = self.state.lock();
        let mut locked = Vec::new();
        let mut resolved = 0;
        for vm in state.tree.values() {
            let mut remote = Vec::new();
            let mut region = vm.region.lock();
            if !region.flags().contains(RegionFlags::LOCKED) {
                region.insert_flags(RegionFlags::LOCKED);
                locked.push(vm.region.clone());
            }
            match self.populate(&mut region, vm.base, &mut remote) {
                Ok(count) => resolved += count,
                Err(err) => {
                    drop(region);
                    for region in &locked {
                        region.lock().remove_flags(RegionFlags::LOCKED);
                    }
                    log::warn!(target: "vmm", "{:?}: lock_all rolled back: {}", self.id, err);
                    return Err(err);
                }
            }
        }
        Ok(resolved)
    }

    /// Unmaps everything. Further map requests fail with `InvalidHandle`.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        self.destroyed.store(true, Ordering::Release);
        self.discard_all(&mut state);
    }

    pub(crate) fn discard_all(&self, state: &mut SpaceState) {
        let tree = std::mem::take(&mut state.tree);
        if !tree.is_empty() {
            log::debug!(target: "vmm", "{:?}: releasing {} mappings", self.id, tree.len());
        }
        for vm in tree.values() {
            self.release_vm(vm);
        }
    }

    /// Copies `buf.len()` bytes from user memory at `addr`, faulting pages in.
    pub fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> VmResult<()> {
        let memory = self.vmm.memory();
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(VmError::Unmapped { addr })?;
            let offset = va - page_align_down(va);
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            self.with_frame(va, Access::Read, |frame| memory.read_frame(frame, offset, dst))?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` into user memory at `addr`, resolving copy-on-write and marking
    /// the pages dirty.
    pub fn write_bytes(&self, addr: usize, data: &[u8]) -> VmResult<()> {
        let memory = self.vmm.memory();
        let mut done = 0;
        while done < data.len() {
            let va = addr.checked_add(done).ok_or(VmError::Unmapped { addr })?;
            let offset = va - page_align_down(va);
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let src = &data[done..done + chunk];
            self.with_frame(va, Access::Write, |frame| memory.write_frame(frame, offset, src))?;
            done += chunk;
        }
        Ok(())
    }

    /// Runs `f` on the frame behind `va` while its PTE grants `access`.
    fn with_frame(&self, va: usize, access: Access, f: impl FnOnce(FrameNo)) -> VmResult<()> {
        let page = page_align_down(va);
        let needed = match access {
            Access::Read => PteFlags::READ,
            Access::Write => PteFlags::WRITE,
            Access::Execute => PteFlags::EXECUTE,
        };
        let mut f = Some(f);
        for _ in 0..ACCESS_RETRIES {
            {
                let mut table = self.mmu.lock();
                if let Some(pte) = table.lookup(page).filter(|pte| pte.flags().contains(needed)) {
                    if let Some(f) = f.take() {
                        f(pte.frame());
                    }
                    let mut touched = PteFlags::ACCESSED;
                    if access.is_write() {
                        touched |= PteFlags::DIRTY;
                    }
                    table.update(page, touched, PteFlags::empty())?;
                    return Ok(());
                }
            }
            self.handle_fault(va, access)?;
        }
        Err(VmError::Unmapped { addr: va })
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("counters", &self.counters())
            .finish()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let tree = std::mem::take(&mut state.tree);
        for vm in tree.values() {
            self.release_vm(vm);
        }
        self.vmm.unregister_space(self.id, self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::hal::host::{HostMemory, MemFile};
    use crate::hal::PhysicalMemory;
    use crate::vm::Vmm;

    const BASE: usize = 0x10_0000;

    fn setup(frames: usize) -> (Arc<HostMemory>, Arc<Vmm>) {
        let memory = Arc::new(HostMemory::new(frames));
        let vmm = Vmm::builder(VmConfig::default(), memory.clone()).build().unwrap();
        (memory, vmm)
    }

    #[test]
    fn fixed_overlap_is_a_conflict() {
        let (_memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        space.map(MapRequest::anonymous(2 * PAGE_SIZE).fixed(BASE)).unwrap();
        let err = space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE + PAGE_SIZE)).unwrap_err();
        assert!(matches!(err, VmError::AddressConflict { addr } if addr == BASE + PAGE_SIZE));
        assert_eq!(space.snapshot().len(), 1);
    }

    #[test]
    fn hint_falls_back_to_search() {
        let (_memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE)).unwrap();
        let moved = space.map(MapRequest::anonymous(PAGE_SIZE).at(BASE)).unwrap();
        assert_ne!(moved.base, BASE);
        let free = space.map(MapRequest::anonymous(PAGE_SIZE).at(BASE + 8 * PAGE_SIZE)).unwrap();
        assert_eq!(free.base, BASE + 8 * PAGE_SIZE);
    }

    #[test]
    fn first_fit_fills_holes() {
        let (_memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        let floor = VmConfig::default().user_base;
        space.map(MapRequest::anonymous(PAGE_SIZE).fixed(floor + PAGE_SIZE)).unwrap();
        let first = space.map(MapRequest::anonymous(PAGE_SIZE)).unwrap();
        assert_eq!(first.base, floor);
        let second = space.map(MapRequest::anonymous(2 * PAGE_SIZE)).unwrap();
        assert_eq!(second.base, floor + 2 * PAGE_SIZE);
    }

    #[test]
    fn data_segment_raises_search_floor() {
        let (_memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        space.set_data_segment(0x200_0000).unwrap();
        let vm = space.map(MapRequest::anonymous(PAGE_SIZE)).unwrap();
        assert_eq!(vm.base, 0x200_0000);
        assert!(space.set_data_segment(0x123).is_err());
    }

    #[test]
    fn writable_executable_is_rejected() {
        let (_memory, vmm) = setup(4);
        let space = vmm.create_space().unwrap();
        let req = MapRequest::anonymous(PAGE_SIZE).prot(Prot::READ | Prot::WRITE | Prot::EXEC);
        assert!(matches!(space.map(req), Err(VmError::InvalidArgs)));
    }

    #[test]
    fn populate_counts_own_frames_and_unmap_frees_them() {
        let (memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        let req = MapRequest::anonymous(3 * PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE);
        space.map(req).unwrap();
        assert_eq!(space.counters(), FrameCounters { own: 3, shared: 0, swapped: 0 });
        assert_eq!(memory.allocated(), 3);
        space.unmap(BASE).unwrap();
        assert_eq!(space.counters(), FrameCounters::default());
        assert_eq!(memory.allocated(), 0);
        assert!(matches!(space.unmap(BASE), Err(VmError::Unmapped { .. })));
    }

    #[test]
    fn populate_without_frames_rolls_back() {
        let (memory, vmm) = setup(2);
        let space = vmm.create_space().unwrap();
        let req = MapRequest::anonymous(3 * PAGE_SIZE).fixed(BASE).flags(MapFlags::POPULATE);
        assert!(matches!(space.map(req), Err(VmError::OutOfMemory)));
        assert!(space.snapshot().is_empty());
        assert_eq!(memory.allocated(), 0);
        assert_eq!(memory.reserved(), 0);
    }

    #[test]
    fn contiguous_mapping_is_aligned_and_locked() {
        let (memory, vmm) = setup(32);
        let space = vmm.create_space().unwrap();
        let req = MapRequest::anonymous(4 * PAGE_SIZE).fixed(BASE).flags(MapFlags::CONTIGUOUS).align(8);
        let vm = space.map(req).unwrap();
        assert!(vm.flags.contains(RegionFlags::LOCKED));
        let first = space.translate(BASE).unwrap().frame();
        assert_eq!(first.raw() % 8, 0);
        for page in 1..4 {
            assert_eq!(space.translate(BASE + page * PAGE_SIZE).unwrap().frame().raw(), first.raw() + page);
        }
        space.unmap(BASE).unwrap();
        assert_eq!(memory.allocated(), 0);
    }

    #[test]
    fn device_frames_are_never_freed() {
        let (memory, vmm) = setup(8);
        let space = vmm.create_space().unwrap();
        let device = memory.allocate().unwrap();
        let vm = space.map(MapRequest::device(device, PAGE_SIZE).fixed(BASE)).unwrap();
        assert!(vm.flags.contains(RegionFlags::NO_FREE));
        assert_eq!(space.counters().shared, 1);
        space.write_bytes(BASE, b"mmio").unwrap();
        space.unmap(BASE).unwrap();
        assert!(memory.is_allocated(device));
        let mut buf = [0u8; 4];
        memory.read_frame(device, 0, &mut buf);
        assert_eq!(&buf, b"mmio");
    }

    #[test]
    fn stacks_are_placed_below_each_other() {
        let (_memory, vmm) = setup(8);
        let config = VmConfig::default();
        let space = vmm.create_space().unwrap();
        let first = space.map(MapRequest::stack(PAGE_SIZE, ThreadId::from_raw(1))).unwrap();
        assert_eq!(first.base, config.stack_top - PAGE_SIZE);
        let second = space.map(MapRequest::stack(PAGE_SIZE, ThreadId::from_raw(2))).unwrap();
        assert_eq!(second.base, config.stack_top - config.stack_reservation() - PAGE_SIZE);
        let heap = space.map(MapRequest::anonymous(PAGE_SIZE)).unwrap();
        assert!(heap.base < second.base);
    }

    #[test]
    fn grow_up_and_shrink() {
        let (memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        let req = MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::GROWABLE);
        space.map(req).unwrap();
        space.grow(BASE, 2).unwrap();
        assert_eq!(space.region_at(BASE).unwrap().len, 3 * PAGE_SIZE);
        space.write_bytes(BASE + 2 * PAGE_SIZE, b"tail").unwrap();
        assert_eq!(memory.allocated(), 1);
        space.grow(BASE, -2).unwrap();
        assert_eq!(memory.allocated(), 0);
        assert_eq!(space.counters(), FrameCounters::default());
        assert!(space.region_at(BASE + PAGE_SIZE).is_none());
    }

    #[test]
    fn grow_into_neighbour_conflicts() {
        let (_memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::GROWABLE)).unwrap();
        space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE + 2 * PAGE_SIZE)).unwrap();
        let before = space.snapshot();
        assert!(matches!(space.grow(BASE, 2), Err(VmError::AddressConflict { .. })));
        assert_eq!(space.snapshot(), before);
        assert!(matches!(space.grow(BASE + 2 * PAGE_SIZE, 1), Err(VmError::NotGrowable)));
    }

    #[test]
    fn sync_writes_dirty_shared_pages() {
        let (_memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        let file = Arc::new(MemFile::with_contents(vec![1u8; 2 * PAGE_SIZE]));
        let req = MapRequest::file(file.clone(), 0, 2 * PAGE_SIZE, 2 * PAGE_SIZE)
            .prot(Prot::READ | Prot::WRITE)
            .flags(MapFlags::SHARED)
            .fixed(BASE);
        space.map(req).unwrap();
        let mut byte = [0u8; 1];
        space.read_bytes(BASE, &mut byte).unwrap();
        space.write_bytes(BASE + PAGE_SIZE + 1, &[9, 9]).unwrap();
        assert_eq!(space.sync(BASE).unwrap(), 1);
        assert_eq!(&file.contents()[PAGE_SIZE..PAGE_SIZE + 4], &[1, 9, 9, 1]);
        assert_eq!(space.sync(BASE).unwrap(), 0);
    }

    #[test]
    fn failed_lock_all_unlocks_regions_again() {
        let (memory, vmm) = setup(3);
        let space = vmm.create_space().unwrap();
        space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE).flags(MapFlags::LOCKED)).unwrap();
        space.map(MapRequest::anonymous(PAGE_SIZE).fixed(BASE + 0x1_0000)).unwrap();
        space.map(MapRequest::anonymous(2 * PAGE_SIZE).fixed(BASE + 0x2_0000)).unwrap();

        assert!(matches!(space.lock_all(), Err(VmError::OutOfMemory)));
        let locked: Vec<bool> =
            space.snapshot().iter().map(|info| info.flags.contains(RegionFlags::LOCKED)).collect();
        assert_eq!(locked, vec![true, false, false]);
        assert!(space.translate(BASE + 0x1_0000).is_some());
        assert_eq!(memory.allocated(), 2);
        assert_eq!(memory.reserved(), 0);
    }

    #[test]
    fn destroy_releases_everything() {
        let (memory, vmm) = setup(16);
        let space = vmm.create_space().unwrap();
        space.map(MapRequest::anonymous(2 * PAGE_SIZE).flags(MapFlags::POPULATE)).unwrap();
        space.map(MapRequest::stack(PAGE_SIZE, ThreadId::from_raw(1)).flags(MapFlags::POPULATE)).unwrap();
        space.destroy();
        assert_eq!(memory.allocated(), 0);
        assert!(space.snapshot().is_empty());
        assert!(matches!(space.map(MapRequest::anonymous(PAGE_SIZE)), Err(VmError::InvalidHandle)));
    }
}
