// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide virtual memory context
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vmm, VmmBuilder, AddressSpace, Region, CowTable, SwapManager
//! DEPENDS_ON: hal, mm::page_table, config
//! INVARIANTS: registry slots hold weak handles only; a space is reachable from the
//!             registry until it is released or dropped
//!
//! The registry never keeps an address space alive. Code that upgrades handles while
//! holding a region lock parks the strong references in a vector declared before the
//! guard so a final drop (and its teardown) never runs under that lock.

pub mod address_space;
pub mod cow;
pub mod fault;
pub mod fork;
pub mod region;
pub mod slots;
pub mod swap;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::{ConfigError, VmConfig};
use crate::error::{VmError, VmResult};
use crate::hal::host::ImmediateShootdown;
use crate::hal::{FileBackend, PhysicalMemory, TlbShootdown};
use crate::mm::page_table::{PageTable, Sv39Table};
use crate::types::{RegionId, SpaceId};

use self::address_space::{AddressSpace, MapRequest};
use self::cow::CowTable;
use self::fault::FaultStats;
use self::region::{PageState, Region, RegionFlags, RegionState};
use self::slots::SlotTable;
use self::swap::SwapManager;

/// Shareable file mapping that later mappings of the same range join.
struct SharedFile {
    /// Data address of the backing file; the region keeps the file alive.
    file: usize,
    offset: u64,
    len: usize,
    region: Weak<Region>,
}

fn file_key(file: &Arc<dyn FileBackend>) -> usize {
    Arc::as_ptr(file) as *const () as usize
}

pub struct Vmm {
    config: VmConfig,
    memory: Arc<dyn PhysicalMemory>,
    tlb: Arc<dyn TlbShootdown>,
    spaces: RwLock<SlotTable<Weak<AddressSpace>>>,
    shared_files: Mutex<Vec<SharedFile>>,
    cow: CowTable,
    swap: SwapManager,
    stats: FaultStats,
    clock: AtomicU64,
    next_region: AtomicU64,
}

pub struct VmmBuilder {
    config: VmConfig,
    memory: Arc<dyn PhysicalMemory>,
    swap_file: Option<Arc<dyn FileBackend>>,
    tlb: Option<Arc<dyn TlbShootdown>>,
    seed: Option<u64>,
}

impl VmmBuilder {
    /// Enables swapping to `file`.
    pub fn swap_file(mut self, file: Arc<dyn FileBackend>) -> Self {
        self.swap_file = Some(file);
        self
    }

    pub fn shootdown(mut self, tlb: Arc<dyn TlbShootdown>) -> Self {
        self.tlb = Some(tlb);
        self
    }

    /// Makes swap victim selection deterministic.
    pub fn swap_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Arc<Vmm>, ConfigError> {
        self.config.validate()?;
        let tlb = self.tlb.unwrap_or_else(|| Arc::new(ImmediateShootdown::new()));
        Ok(Arc::new(Vmm {
            cow: CowTable::new(self.config.cow_capacity),
            swap: SwapManager::new(self.swap_file, self.config.swap_blocks, self.seed),
            config: self.config,
            memory: self.memory,
            tlb,
            spaces: RwLock::new(SlotTable::new()),
            shared_files: Mutex::new(Vec::new()),
            stats: FaultStats::default(),
            clock: AtomicU64::new(0),
            next_region: AtomicU64::new(1),
        }))
    }
}

impl Vmm {
    pub fn builder(config: VmConfig, memory: Arc<dyn PhysicalMemory>) -> VmmBuilder {
        VmmBuilder { config, memory, swap_file: None, tlb: None, seed: None }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn memory(&self) -> &dyn PhysicalMemory {
        &*self.memory
    }

    pub(crate) fn tlb(&self) -> &dyn TlbShootdown {
        &*self.tlb
    }

    pub fn cow(&self) -> &CowTable {
        &self.cow
    }

    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }

    pub fn fault_stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Advances the logical clock used for LRU stamps.
    pub(crate) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_region_id(&self) -> RegionId {
        RegionId::from_raw(self.next_region.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates an address space backed by a software Sv39 table.
    pub fn create_space(self: &Arc<Self>) -> VmResult<Arc<AddressSpace>> {
        let table: Box<dyn PageTable> = match self.config.max_table_pages {
            Some(max) => Box::new(Sv39Table::with_budget(max)),
            None => Box::new(Sv39Table::new()),
        };
        self.create_space_with(table)
    }

    /// Creates an address space around a caller-provided page table.
    pub fn create_space_with(self: &Arc<Self>, table: Box<dyn PageTable>) -> VmResult<Arc<AddressSpace>> {
        let mut spaces = self.spaces.write();
        let slot = spaces.insert(Weak::new()).map_err(|_| VmError::OutOfMemory)?;
        let Ok(raw) = u32::try_from(slot) else {
            spaces.remove(slot);
            return Err(VmError::LimitExceeded);
        };
        let id = SpaceId::from_raw(raw);
        let space = Arc::new(AddressSpace::new(id, self.clone(), table));
        if let Some(entry) = spaces.get_mut(slot) {
            *entry = Arc::downgrade(&space);
        }
        log::debug!(target: "vmm", "created {:?}", id);
        Ok(space)
    }

    /// Live address space registered under `id`.
    pub fn space(&self, id: SpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.read().get(id.as_index()).and_then(Weak::upgrade)
    }

    pub(crate) fn live_spaces(&self) -> Vec<Arc<AddressSpace>> {
        self.spaces.read().iter().filter_map(|(_, space)| space.upgrade()).collect()
    }

    /// Tears down the address space and removes it from the registry.
    pub fn release_space(&self, id: SpaceId) -> VmResult<()> {
        let space = self.space(id).ok_or(VmError::InvalidHandle)?;
        space.destroy();
        let mut spaces = self.spaces.write();
        spaces.remove(id.as_index());
        drop(spaces);
        log::debug!(target: "vmm", "released {:?}", id);
        Ok(())
    }

    pub(crate) fn unregister_space(&self, id: SpaceId, space: &AddressSpace) {
        let mut spaces = self.spaces.write();
        let current = spaces.get(id.as_index()).is_some_and(|weak| std::ptr::eq(weak.as_ptr(), space));
        if current {
            spaces.remove(id.as_index());
        }
    }

    /// Resolves every owner of `region` into `out`; false if some owner is already
    /// being torn down.
    pub(crate) fn collect_owners(
        &self,
        region: &RegionState,
        out: &mut Vec<(Arc<AddressSpace>, usize)>,
    ) -> bool {
        let mut complete = true;
        for owner in region.owners().iter() {
            match self.space(owner.space) {
                Some(space) => out.push((space, owner.base)),
                None => complete = false,
            }
        }
        complete
    }

    /// Finds the shareable region already mapping `len` bytes of `file` at the request
    /// offset, or creates and registers a new one. The flag is true for a join.
    pub(crate) fn shared_region(
        &self,
        file: &Arc<dyn FileBackend>,
        req: &MapRequest,
        len: usize,
        flags: RegionFlags,
    ) -> VmResult<(Arc<Region>, bool)> {
        let key = file_key(file);
        let mut shared = self.shared_files.lock();
        shared.retain(|entry| entry.region.strong_count() > 0);
        let existing = shared
            .iter()
            .filter(|entry| entry.file == key && entry.offset == req.offset && entry.len == len)
            .find_map(|entry| entry.region.upgrade());
        if let Some(region) = existing {
            return Ok((region, true));
        }
        let state = RegionState::new(
            Some(file.clone()),
            len,
            req.load_count,
            req.offset,
            PageState::DEMAND_LOAD,
            flags,
        )?;
        let region = Arc::new(Region::new(self.next_region_id(), state, self.tick()));
        shared.try_reserve(1).map_err(|_| VmError::OutOfMemory)?;
        shared.push(SharedFile { file: key, offset: req.offset, len, region: Arc::downgrade(&region) });
        Ok((region, false))
    }

    pub(crate) fn unregister_shared(&self, region: &Arc<Region>) {
        self.shared_files
            .lock()
            .retain(|entry| entry.region.strong_count() > 0 && !std::ptr::eq(entry.region.as_ptr(), &**region));
    }

    /// Evicts up to `count` resident pages, least recently used regions first.
    pub fn swap_out(&self, count: usize) -> VmResult<usize> {
        let swapped = self.swap.swap_out(self, count)?;
        log::debug!(target: "vmm::swap", "swapped out {} of {} pages", swapped, count);
        Ok(swapped)
    }
}
