// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shareable backing descriptor for a range of pages
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Region, RegionState, RegionFlags, PageState, Owner, OwnerSet, Release
//! DEPENDS_ON: hal::FileBackend, parking_lot::Mutex
//! INVARIANTS: refcount == |owners|; a region whose last owner left is destroyed exactly
//!             once and never revived; per-page arrays always cover byte_count
//!
//! All mutation goes through [`RegionState`], reachable only with the region lock held.
//! The access timestamp sits outside the lock so the swap scanner can peek at it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, MutexGuard, RawMutex};

use crate::error::{VmError, VmResult};
use crate::hal::FileBackend;
use crate::types::{pages_for, RegionId, SpaceId, PAGE_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        const WRITABLE = 1 << 0;
        const EXECUTABLE = 1 << 1;
        const GROWABLE = 1 << 2;
        const SHAREABLE = 1 << 3;
        const STACK = 1 << 4;
        const GROWS_DOWN = 1 << 5;
        /// Never swapped out.
        const LOCKED = 1 << 6;
        /// Frames belong to someone else (device memory) and are never freed.
        const NO_FREE = 1 << 7;
        /// Backed by one physically contiguous run of frames.
        const CONTIGUOUS = 1 << 8;
    }
}

bitflags! {
    /// Pending work recorded for a single page.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PageState: u8 {
        const DEMAND_LOAD = 1 << 0;
        const COPY_ON_WRITE = 1 << 1;
        const SWAPPED = 1 << 2;
    }
}

/// One address space currently mapping the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    pub space: SpaceId,
    /// Virtual base of the region inside `space`.
    pub base: usize,
}

/// Non-owning membership records, one per mapping address space.
#[derive(Clone, Debug, Default)]
pub struct OwnerSet {
    owners: Vec<Owner>,
}

impl OwnerSet {
    /// Returns false when `owner.space` is already a member.
    pub fn add(&mut self, owner: Owner) -> bool {
        if self.contains(owner.space) {
            return false;
        }
        self.owners.push(owner);
        true
    }

    pub fn remove(&mut self, space: SpaceId) -> Option<Owner> {
        let index = self.owners.iter().position(|owner| owner.space == space)?;
        Some(self.owners.swap_remove(index))
    }

    pub fn contains(&self, space: SpaceId) -> bool {
        self.owners.iter().any(|owner| owner.space == space)
    }

    pub fn rebase(&mut self, space: SpaceId, base: usize) {
        if let Some(owner) = self.owners.iter_mut().find(|owner| owner.space == space) {
            owner.base = base;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Owner> {
        self.owners.iter()
    }

    pub fn to_vec(&self) -> Vec<Owner> {
        self.owners.clone()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Outcome of dropping an owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Other owners keep the region alive.
    Remaining(usize),
    /// The last owner left; the caller releases every frame and swap block.
    Destroyed,
}

/// Lock-protected part of a region.
pub struct RegionState {
    byte_count: usize,
    load_count: usize,
    file_offset: u64,
    file: Option<Arc<dyn FileBackend>>,
    flags: RegionFlags,
    pages: Vec<PageState>,
    swap_blocks: Vec<Option<usize>>,
    /// Written through a mapping that has since been torn down or evicted.
    dirty: Vec<bool>,
    /// Frame alignment of a contiguous region.
    phys_align: usize,
    owners: OwnerSet,
    destroyed: bool,
}

impl RegionState {
    /// Creates the state for a fresh region; every page starts as `page_state`.
    pub fn new(
        file: Option<Arc<dyn FileBackend>>,
        size: usize,
        load_count: usize,
        offset: u64,
        page_state: PageState,
        flags: RegionFlags,
    ) -> VmResult<Self> {
        if size == 0 || load_count > size || (file.is_none() && load_count != 0) {
            return Err(VmError::InvalidArgs);
        }
        let page_count = pages_for(size);
        let mut pages = Vec::new();
        let mut swap_blocks = Vec::new();
        let mut dirty = Vec::new();
        if pages.try_reserve_exact(page_count).is_err()
            || swap_blocks.try_reserve_exact(page_count).is_err()
            || dirty.try_reserve_exact(page_count).is_err()
        {
            return Err(VmError::OutOfMemory);
        }
        pages.resize(page_count, page_state);
        swap_blocks.resize(page_count, None);
        dirty.resize(page_count, false);
        Ok(Self {
            byte_count: page_count * PAGE_SIZE,
            load_count,
            file_offset: offset,
            file,
            flags,
            pages,
            swap_blocks,
            dirty,
            phys_align: 1,
            owners: OwnerSet::default(),
            destroyed: false,
        })
    }

    pub fn with_phys_align(mut self, frames: usize) -> Self {
        self.phys_align = frames.max(1);
        self
    }

    pub fn phys_align(&self) -> usize {
        self.phys_align
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn load_count(&self) -> usize {
        self.load_count
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn file(&self) -> Option<&Arc<dyn FileBackend>> {
        self.file.as_ref()
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn insert_flags(&mut self, flags: RegionFlags) {
        self.flags.insert(flags);
    }

    pub fn remove_flags(&mut self, flags: RegionFlags) {
        self.flags.remove(flags);
    }

    pub fn is_shareable(&self) -> bool {
        self.flags.contains(RegionFlags::SHAREABLE)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn owners(&self) -> &OwnerSet {
        &self.owners
    }

    pub fn refcount(&self) -> usize {
        self.owners.len()
    }

    pub fn add_owner(&mut self, space: SpaceId, base: usize) -> VmResult<usize> {
        if self.destroyed {
            return Err(VmError::InvalidHandle);
        }
        if !self.owners.add(Owner { space, base }) {
            return Err(VmError::AddressConflict { addr: base });
        }
        Ok(self.owners.len())
    }

    pub fn remove_owner(&mut self, space: SpaceId) -> VmResult<Release> {
        self.owners.remove(space).ok_or(VmError::InvalidHandle)?;
        if self.owners.is_empty() {
            self.destroyed = true;
            return Ok(Release::Destroyed);
        }
        Ok(Release::Remaining(self.owners.len()))
    }

    pub(crate) fn rebase_owner(&mut self, space: SpaceId, base: usize) {
        self.owners.rebase(space, base);
    }

    pub fn page_state(&self, index: usize) -> PageState {
        self.pages.get(index).copied().unwrap_or_default()
    }

    pub fn set_page_state(&mut self, index: usize, state: PageState) {
        if let Some(slot) = self.pages.get_mut(index) {
            *slot = state;
        }
    }

    pub fn insert_page_state(&mut self, index: usize, state: PageState) {
        if let Some(slot) = self.pages.get_mut(index) {
            slot.insert(state);
        }
    }

    pub fn clear_page_state(&mut self, index: usize, state: PageState) {
        if let Some(slot) = self.pages.get_mut(index) {
            slot.remove(state);
        }
    }

    /// Records that page `index` holds data not yet written back to the file.
    pub fn mark_dirty(&mut self, index: usize) {
        if let Some(slot) = self.dirty.get_mut(index) {
            *slot = true;
        }
    }

    /// Clears and returns the dirty marker of page `index`.
    pub fn take_dirty(&mut self, index: usize) -> bool {
        self.dirty.get_mut(index).map_or(false, std::mem::take)
    }

    pub fn is_dirty(&self, index: usize) -> bool {
        self.dirty.get(index).copied().unwrap_or(false)
    }

    pub fn swap_block(&self, index: usize) -> Option<usize> {
        self.swap_blocks.get(index).copied().flatten()
    }

    pub fn set_swap_block(&mut self, index: usize, block: Option<usize>) {
        if let Some(slot) = self.swap_blocks.get_mut(index) {
            *slot = block;
        }
    }

    /// A page is evictable when it is resident and neither shared copy-on-write nor
    /// pinned by the region flags.
    pub fn is_evictable(&self, index: usize) -> bool {
        !self.flags.intersects(RegionFlags::LOCKED | RegionFlags::NO_FREE)
            && self.page_state(index).is_empty()
    }

    pub fn evictable_pages(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.pages.len()).filter(|index| self.is_evictable(*index))
    }

    pub fn swapped_pages(&self) -> usize {
        self.pages.iter().filter(|state| state.contains(PageState::SWAPPED)).count()
    }

    /// File range backing page `index`: `(file offset, bytes to read)`. Bytes past
    /// `load_count` are zero fill.
    pub fn load_range(&self, index: usize) -> (u64, usize) {
        let offset = index * PAGE_SIZE;
        let bytes = self.load_count.saturating_sub(offset).min(PAGE_SIZE);
        (self.file_offset + offset as u64, bytes)
    }

    /// Resizes a private growable region by `delta` pages.
    ///
    /// Grows-down regions are anonymous and gain and lose pages at the front. New pages start as
    /// `fresh`. On shrink the swap blocks of dropped pages are returned for release;
    /// the caller has already unmapped any resident frame among them.
    pub fn grow(&mut self, delta: isize, fresh: PageState) -> VmResult<Vec<usize>> {
        if !self.flags.contains(RegionFlags::GROWABLE) || self.is_shareable() {
            return Err(VmError::NotGrowable);
        }
        let front = self.flags.contains(RegionFlags::GROWS_DOWN);
        let count = delta.unsigned_abs();
        if delta >= 0 {
            if self.pages.try_reserve(count).is_err()
                || self.swap_blocks.try_reserve(count).is_err()
                || self.dirty.try_reserve(count).is_err()
            {
                return Err(VmError::OutOfMemory);
            }
            if front {
                self.pages.splice(0..0, core::iter::repeat(fresh).take(count));
                self.swap_blocks.splice(0..0, core::iter::repeat(None).take(count));
                self.dirty.splice(0..0, core::iter::repeat(false).take(count));
            } else {
                self.pages.resize(self.pages.len() + count, fresh);
                self.swap_blocks.resize(self.swap_blocks.len() + count, None);
                self.dirty.resize(self.dirty.len() + count, false);
            }
            self.byte_count += count * PAGE_SIZE;
            return Ok(Vec::new());
        }

        if count >= self.pages.len() {
            return Err(VmError::InvalidArgs);
        }
        let range = if front { 0..count } else { self.pages.len() - count..self.pages.len() };
        self.pages.drain(range.clone());
        self.dirty.drain(range.clone());
        let released: Vec<usize> = self.swap_blocks.drain(range).flatten().collect();
        self.byte_count -= count * PAGE_SIZE;
        self.load_count = self.load_count.min(self.byte_count);
        Ok(released)
    }

    /// Deep copy for a private region duplicated into `owner` during fork.
    ///
    /// Swap blocks are not shared: swapped pages keep their state but carry no block
    /// until the caller assigns a duplicate.
    pub fn clone_for(&self, owner: SpaceId, base: usize) -> VmResult<Self> {
        if self.is_shareable() {
            return Err(VmError::InvalidArgs);
        }
        let mut pages = Vec::new();
        let mut swap_blocks = Vec::new();
        let mut dirty = Vec::new();
        if pages.try_reserve_exact(self.pages.len()).is_err()
            || swap_blocks.try_reserve_exact(self.pages.len()).is_err()
            || dirty.try_reserve_exact(self.pages.len()).is_err()
        {
            return Err(VmError::OutOfMemory);
        }
        pages.extend_from_slice(&self.pages);
        swap_blocks.resize(self.pages.len(), None);
        dirty.resize(self.pages.len(), false);
        let mut owners = OwnerSet::default();
        owners.add(Owner { space: owner, base });
        Ok(Self {
            byte_count: self.byte_count,
            load_count: self.load_count,
            file_offset: self.file_offset,
            file: self.file.clone(),
            flags: self.flags,
            pages,
            swap_blocks,
            dirty,
            phys_align: self.phys_align,
            owners,
            destroyed: false,
        })
    }
}

/// Backing region shared by every [`crate::vm::address_space::VmRegion`] that maps it.
pub struct Region {
    id: RegionId,
    last_access: AtomicU64,
    state: Arc<Mutex<RegionState>>,
}

impl Region {
    pub fn new(id: RegionId, state: RegionState, now: u64) -> Self {
        Self { id, last_access: AtomicU64::new(now), state: Arc::new(Mutex::new(state)) }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock()
    }

    /// Owned guard, used to hand a locked victim out of the swap scan.
    pub(crate) fn try_lock_arc(&self) -> Option<ArcMutexGuard<RawMutex, RegionState>> {
        self.state.try_lock_arc()
    }

    /// Unlocked read; staleness is acceptable for LRU ordering.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("last_access", &self.last_access())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(pages: usize, flags: RegionFlags) -> RegionState {
        RegionState::new(None, pages * PAGE_SIZE, 0, 0, PageState::DEMAND_LOAD, flags).unwrap()
    }

    #[test]
    fn create_rounds_to_pages() {
        let state =
            RegionState::new(None, PAGE_SIZE + 1, 0, 0, PageState::DEMAND_LOAD, RegionFlags::WRITABLE)
                .unwrap();
        assert_eq!(state.page_count(), 2);
        assert_eq!(state.byte_count(), 2 * PAGE_SIZE);
        assert!(state.page_state(1).contains(PageState::DEMAND_LOAD));
    }

    #[test]
    fn create_rejects_bad_load_count() {
        assert!(RegionState::new(None, PAGE_SIZE, 1, 0, PageState::empty(), RegionFlags::empty())
            .is_err());
        assert!(RegionState::new(None, 0, 0, 0, PageState::empty(), RegionFlags::empty()).is_err());
    }

    #[test]
    fn owners_destroy_exactly_once() {
        let mut state = anon(1, RegionFlags::SHAREABLE);
        assert_eq!(state.add_owner(SpaceId::from_raw(1), 0x1000).unwrap(), 1);
        assert_eq!(state.add_owner(SpaceId::from_raw(2), 0x2000).unwrap(), 2);
        assert!(matches!(
            state.add_owner(SpaceId::from_raw(2), 0x3000),
            Err(VmError::AddressConflict { .. })
        ));
        assert_eq!(state.remove_owner(SpaceId::from_raw(1)).unwrap(), Release::Remaining(1));
        assert_eq!(state.remove_owner(SpaceId::from_raw(2)).unwrap(), Release::Destroyed);
        assert!(state.is_destroyed());
        assert!(state.remove_owner(SpaceId::from_raw(2)).is_err());
        assert!(state.add_owner(SpaceId::from_raw(3), 0).is_err());
    }

    #[test]
    fn grow_rejects_shareable_and_fixed() {
        let mut shared = anon(1, RegionFlags::SHAREABLE | RegionFlags::GROWABLE);
        assert!(matches!(shared.grow(1, PageState::DEMAND_LOAD), Err(VmError::NotGrowable)));
        let mut fixed = anon(1, RegionFlags::WRITABLE);
        assert!(matches!(fixed.grow(1, PageState::DEMAND_LOAD), Err(VmError::NotGrowable)));
    }

    #[test]
    fn grow_down_prepends_and_shrink_returns_blocks() {
        let flags = RegionFlags::GROWABLE | RegionFlags::GROWS_DOWN | RegionFlags::STACK;
        let mut state = anon(2, flags);
        state.set_page_state(0, PageState::SWAPPED);
        state.set_swap_block(0, Some(7));
        state.grow(2, PageState::DEMAND_LOAD).unwrap();
        assert_eq!(state.page_count(), 4);
        assert_eq!(state.swap_block(2), Some(7));
        assert!(state.page_state(2).contains(PageState::SWAPPED));
        let released = state.grow(-3, PageState::empty()).unwrap();
        assert_eq!(released, vec![7]);
        assert_eq!(state.page_count(), 1);
        assert!(state.grow(-1, PageState::empty()).is_err());
    }

    #[test]
    fn grow_up_appends() {
        let mut state = anon(1, RegionFlags::GROWABLE | RegionFlags::WRITABLE);
        state.set_page_state(0, PageState::empty());
        state.grow(2, PageState::DEMAND_LOAD).unwrap();
        assert_eq!(state.page_state(0), PageState::empty());
        assert_eq!(state.page_state(2), PageState::DEMAND_LOAD);
        assert_eq!(state.byte_count(), 3 * PAGE_SIZE);
    }

    #[test]
    fn load_range_splits_file_and_zero_fill() {
        let file: Arc<dyn FileBackend> = Arc::new(crate::hal::host::MemFile::new());
        let state = RegionState::new(
            Some(file),
            3 * PAGE_SIZE,
            PAGE_SIZE + 100,
            0x200,
            PageState::DEMAND_LOAD,
            RegionFlags::empty(),
        )
        .unwrap();
        assert_eq!(state.load_range(0), (0x200, PAGE_SIZE));
        assert_eq!(state.load_range(1), (0x200 + PAGE_SIZE as u64, 100));
        assert_eq!(state.load_range(2).1, 0);
    }

    #[test]
    fn clone_for_drops_swap_blocks_and_owners() {
        let mut state = anon(2, RegionFlags::WRITABLE);
        state.add_owner(SpaceId::from_raw(1), 0x1000).unwrap();
        state.set_page_state(1, PageState::SWAPPED);
        state.set_swap_block(1, Some(3));
        let copy = state.clone_for(SpaceId::from_raw(2), 0x1000).unwrap();
        assert_eq!(copy.refcount(), 1);
        assert!(copy.owners().contains(SpaceId::from_raw(2)));
        assert!(copy.page_state(1).contains(PageState::SWAPPED));
        assert_eq!(copy.swap_block(1), None);
    }

    #[test]
    fn evictable_excludes_pending_and_locked_pages() {
        let mut state = anon(3, RegionFlags::WRITABLE);
        state.set_page_state(0, PageState::empty());
        state.set_page_state(1, PageState::COPY_ON_WRITE);
        assert_eq!(state.evictable_pages().collect::<Vec<_>>(), vec![0]);
        state.insert_flags(RegionFlags::LOCKED);
        assert_eq!(state.evictable_pages().count(), 0);
        state.remove_flags(RegionFlags::LOCKED);
        assert_eq!(state.flags(), RegionFlags::WRITABLE);
    }

    #[test]
    fn dirty_markers_are_taken_once() {
        let mut state = anon(2, RegionFlags::WRITABLE | RegionFlags::SHAREABLE);
        state.mark_dirty(1);
        state.mark_dirty(9);
        assert!(!state.is_dirty(0));
        assert!(state.is_dirty(1));
        assert!(state.take_dirty(1));
        assert!(!state.take_dirty(1));
        assert!(!state.take_dirty(9));
    }
}
