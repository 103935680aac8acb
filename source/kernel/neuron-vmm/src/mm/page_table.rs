// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39-shaped page-table seam with a software table allocating intermediate levels on demand.

use bitflags::bitflags;

use crate::types::{is_page_aligned, FrameNo, PAGE_SIZE};

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
/// Levels walked from the root to a 4 KiB leaf.
const LEVELS: usize = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PteFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit: the frame is not owned by this address space alone.
        const SHARED = 1 << 8;
    }
}

const LEAF_PERMS: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::EXECUTE);
const FLAG_BITS: usize = (1 << 10) - 1;

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No entry is installed at the address.
    NotMapped,
    /// The page-table page budget is exhausted.
    TableExhausted,
}

/// A leaf entry: frame number in the PPN field, flags in the low bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte(usize);

impl Pte {
    pub fn new(frame: FrameNo, flags: PteFlags) -> Self {
        Self((frame.raw() << 10) | flags.bits())
    }

    pub fn frame(self) -> FrameNo {
        FrameNo::new(self.0 >> 10)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_BITS)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITE)
    }

    pub fn is_shared(self) -> bool {
        self.flags().contains(PteFlags::SHARED)
    }
}

/// Architecture mapping primitive consumed by the VMM.
///
/// Entries never own frames: callers decide when a frame returned by
/// [`PageTable::unmap`] is freed.
pub trait PageTable: Send {
    /// Installs a leaf mapping; returns the number of page-table pages created.
    fn map(&mut self, va: usize, frame: FrameNo, flags: PteFlags) -> Result<usize, MapError>;

    /// Removes a leaf mapping; returns it with the number of page-table pages freed.
    fn unmap(&mut self, va: usize) -> Result<(Pte, usize), MapError>;

    fn lookup(&self, va: usize) -> Option<Pte>;

    /// Sets then clears flags on an existing leaf and returns the new entry.
    fn update(&mut self, va: usize, set: PteFlags, clear: PteFlags) -> Result<Pte, MapError>;

    /// Page-table pages currently allocated, root included.
    fn table_pages(&self) -> usize;

    fn frame_of(&self, va: usize) -> Option<FrameNo> {
        self.lookup(va).map(Pte::frame)
    }
}

/// Copies every present entry of `count` pages from `src` to `dst`.
///
/// With `shared` set the copies carry [`PteFlags::SHARED`]. On failure all entries
/// installed by this call are removed again. Returns the number of entries copied.
pub fn clone_pages(
    src: &dyn PageTable,
    dst: &mut dyn PageTable,
    va_src: usize,
    va_dst: usize,
    count: usize,
    shared: bool,
) -> Result<usize, MapError> {
    let mut copied: Vec<usize> = Vec::new();
    for page in 0..count {
        let offset = page * PAGE_SIZE;
        let Some(entry) = src.lookup(va_src + offset) else {
            continue;
        };
        let mut flags = entry.flags() - PteFlags::DIRTY - PteFlags::ACCESSED;
        if shared {
            flags |= PteFlags::SHARED;
        }
        if let Err(err) = dst.map(va_dst + offset, entry.frame(), flags) {
            for va in copied {
                let _ = dst.unmap(va);
            }
            return Err(err);
        }
        copied.push(va_dst + offset);
    }
    Ok(copied.len())
}

enum Slot {
    Empty,
    Table(Box<Node>),
    Leaf(Pte),
}

struct Node {
    slots: Vec<Slot>,
    live: usize,
}

impl Node {
    fn new() -> Box<Self> {
        let mut slots = Vec::with_capacity(PT_ENTRIES);
        slots.resize_with(PT_ENTRIES, || Slot::Empty);
        Box::new(Self { slots, live: 0 })
    }
}

/// Software three-level Sv39 table.
pub struct Sv39Table {
    root: Box<Node>,
    tables: usize,
    max_tables: Option<usize>,
}

impl Sv39Table {
    /// Creates an empty table with a fresh root page.
    pub fn new() -> Self {
        Self { root: Node::new(), tables: 1, max_tables: None }
    }

    /// Creates a table that may hold at most `max_tables` page-table pages.
    pub fn with_budget(max_tables: usize) -> Self {
        Self { root: Node::new(), tables: 1, max_tables: Some(max_tables.max(1)) }
    }

    fn missing_levels(&self, indices: &[usize; LEVELS]) -> Result<usize, MapError> {
        let mut node = &self.root;
        for (level, index) in indices.iter().enumerate().take(LEVELS - 1) {
            match &node.slots[*index] {
                Slot::Table(child) => node = child,
                Slot::Empty => return Ok(LEVELS - 1 - level),
                Slot::Leaf(_) => return Err(MapError::Overlap),
            }
        }
        Ok(0)
    }
}

impl Default for Sv39Table {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for Sv39Table {
    fn map(&mut self, va: usize, frame: FrameNo, flags: PteFlags) -> Result<usize, MapError> {
        if !is_page_aligned(va) {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PteFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PteFlags::WRITE) && flags.contains(PteFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }

        let indices = vpn_indices(va);
        let needed = self.missing_levels(&indices)?;
        if let Some(max) = self.max_tables {
            if self.tables + needed > max {
                return Err(MapError::TableExhausted);
            }
        }

        let mut node = &mut self.root;
        for index in &indices[..LEVELS - 1] {
            if matches!(node.slots[*index], Slot::Empty) {
                node.slots[*index] = Slot::Table(Node::new());
                node.live += 1;
            }
            node = match &mut node.slots[*index] {
                Slot::Table(child) => child,
                _ => return Err(MapError::Overlap),
            };
        }
        let leaf = &mut node.slots[indices[LEVELS - 1]];
        if !matches!(leaf, Slot::Empty) {
            return Err(MapError::Overlap);
        }
        *leaf = Slot::Leaf(Pte::new(frame, flags));
        node.live += 1;
        self.tables += needed;
        Ok(needed)
    }

    fn unmap(&mut self, va: usize) -> Result<(Pte, usize), MapError> {
        if !is_page_aligned(va) {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        let indices = vpn_indices(va);
        let (entry, freed) = unmap_in(&mut self.root, &indices)?;
        self.tables -= freed;
        Ok((entry, freed))
    }

    fn lookup(&self, va: usize) -> Option<Pte> {
        if !is_page_aligned(va) || !is_canonical_sv39(va) {
            return None;
        }
        let mut node = &self.root;
        for (level, index) in vpn_indices(va).iter().enumerate() {
            match &node.slots[*index] {
                Slot::Table(child) if level < LEVELS - 1 => node = child,
                Slot::Leaf(entry) if level == LEVELS - 1 => return Some(*entry),
                _ => return None,
            }
        }
        None
    }

    fn update(&mut self, va: usize, set: PteFlags, clear: PteFlags) -> Result<Pte, MapError> {
        if !is_page_aligned(va) {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        let mut node = &mut self.root;
        let indices = vpn_indices(va);
        for index in &indices[..LEVELS - 1] {
            node = match &mut node.slots[*index] {
                Slot::Table(child) => child,
                _ => return Err(MapError::NotMapped),
            };
        }
        match &mut node.slots[indices[LEVELS - 1]] {
            Slot::Leaf(entry) => {
                let flags = (entry.flags() | set) - clear;
                if flags.contains(PteFlags::WRITE) && flags.contains(PteFlags::EXECUTE) {
                    return Err(MapError::PermissionDenied);
                }
                *entry = Pte::new(entry.frame(), flags);
                Ok(*entry)
            }
            _ => Err(MapError::NotMapped),
        }
    }

    fn table_pages(&self) -> usize {
        self.tables
    }
}

fn unmap_in(node: &mut Node, indices: &[usize]) -> Result<(Pte, usize), MapError> {
    let index = indices[0];
    if indices.len() == 1 {
        return match core::mem::replace(&mut node.slots[index], Slot::Empty) {
            Slot::Leaf(entry) => {
                node.live -= 1;
                Ok((entry, 0))
            }
            other => {
                node.slots[index] = other;
                Err(MapError::NotMapped)
            }
        };
    }
    let (entry, mut freed, now_empty) = match &mut node.slots[index] {
        Slot::Table(child) => {
            let (entry, freed) = unmap_in(child, &indices[1..])?;
            (entry, freed, child.live == 0)
        }
        _ => return Err(MapError::NotMapped),
    };
    if now_empty {
        node.slots[index] = Slot::Empty;
        node.live -= 1;
        freed += 1;
    }
    Ok((entry, freed))
}

/// Root-first VPN indices of `va`.
fn vpn_indices(va: usize) -> [usize; LEVELS] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn2, vpn1, vpn0]
}

pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
