// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the virtual memory manager
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PAGE_SIZE, FrameNo, SpaceId, RegionId, ThreadId, Access, page helpers
//! DEPENDS_ON: core
//! INVARIANTS: Frame numbers and ids are opaque; page helpers never overflow silently

use core::fmt;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

static_assertions::const_assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);

/// Physical frame number (physical address >> [`PAGE_SHIFT`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameNo(usize);

impl FrameNo {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Physical byte address of the frame.
    #[inline]
    pub const fn phys_addr(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Display for FrameNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}

/// Stable identifier of an address space inside the [`crate::Vmm`] registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SpaceId(u32);

impl SpaceId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a backing region; unique for the lifetime of a [`crate::Vmm`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RegionId(u64);

impl RegionId {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Thread identifier used to associate stack/TLS regions with their thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Kind of memory access that raised a fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(self, Access::Write)
    }
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary, `None` on overflow.
#[inline]
pub fn page_align_up(addr: usize) -> Option<usize> {
    addr.checked_add(PAGE_SIZE - 1).map(page_align_down)
}

/// Number of pages needed to cover `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes / PAGE_SIZE + (bytes % PAGE_SIZE != 0) as usize
}
