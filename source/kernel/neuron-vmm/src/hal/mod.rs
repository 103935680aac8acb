// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Seams to the collaborators the VMM consumes but does not implement
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysicalMemory, FrameReservation, FileBackend, TlbShootdown
//! DEPENDS_ON: types::FrameNo
//! INVARIANTS: Frames drawn through a FrameReservation never exceed the reserved budget;
//!             unused budget is returned on drop
//!
//! The physical frame allocator, file-system drivers and the SMP TLB shootdown
//! protocol live outside this crate. `hal::host` provides in-memory versions used
//! by host builds and tests.

pub mod host;

use std::io;

use crate::error::{VmError, VmResult};
use crate::types::{FrameNo, SpaceId, PAGE_SIZE};

/// Physical frame allocator plus raw frame access.
pub trait PhysicalMemory: Send + Sync {
    /// Allocates one unreserved frame.
    fn allocate(&self) -> Option<FrameNo>;

    /// Allocates `count` physically contiguous frames whose first frame number is a
    /// multiple of `align` (in frames).
    fn allocate_contiguous(&self, count: usize, align: usize) -> Option<FrameNo>;

    /// Returns a frame to the allocator.
    fn free(&self, frame: FrameNo);

    /// Frames neither allocated nor reserved.
    fn available(&self) -> usize;

    /// Sets `count` frames aside for a later [`PhysicalMemory::allocate_reserved`].
    fn try_reserve(&self, count: usize) -> bool;

    /// Returns unused reserved frames.
    fn unreserve(&self, count: usize);

    /// Allocates a frame out of a previously made reservation.
    fn allocate_reserved(&self) -> Option<FrameNo>;

    fn read_frame(&self, frame: FrameNo, offset: usize, buf: &mut [u8]);

    fn write_frame(&self, frame: FrameNo, offset: usize, data: &[u8]);

    fn zero_frame(&self, frame: FrameNo) {
        self.write_frame(frame, 0, &[0u8; PAGE_SIZE]);
    }

    fn copy_frame(&self, src: FrameNo, dst: FrameNo) {
        let mut staging = vec![0u8; PAGE_SIZE];
        self.read_frame(src, 0, &mut staging);
        self.write_frame(dst, 0, &staging);
    }
}

/// Frame budget taken before an operation starts mutating state.
///
/// Out-of-memory is therefore detected up front; whatever the operation does not
/// consume is discarded when the reservation drops.
pub struct FrameReservation<'a> {
    memory: &'a dyn PhysicalMemory,
    remaining: usize,
}

impl<'a> FrameReservation<'a> {
    pub fn new(memory: &'a dyn PhysicalMemory, count: usize) -> VmResult<Self> {
        if count != 0 && !memory.try_reserve(count) {
            log::debug!(target: "vmm", "frame reservation of {} failed", count);
            return Err(VmError::OutOfMemory);
        }
        Ok(Self { memory, remaining: count })
    }

    /// Draws one frame from the budget.
    pub fn take(&mut self) -> VmResult<FrameNo> {
        if self.remaining == 0 {
            return Err(VmError::OutOfMemory);
        }
        let frame = self.memory.allocate_reserved().ok_or(VmError::OutOfMemory)?;
        self.remaining -= 1;
        Ok(frame)
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Drop for FrameReservation<'_> {
    fn drop(&mut self) {
        if self.remaining != 0 {
            self.memory.unreserve(self.remaining);
        }
    }
}

/// Byte-addressed backing file used for demand loading, write-back and swap.
pub trait FileBackend: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<usize>;

    /// Reads until `buf` is full or end of file; returns the bytes read.
    fn read_full_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.read_at(offset + done as u64, &mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    fn write_all_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut done = 0;
        while done < data.len() {
            match self.write_at(offset + done as u64, &data[done..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "short write")),
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Cross-CPU TLB invalidation.
pub trait TlbShootdown: Send + Sync {
    /// Invalidates `vaddr` in `space` on every CPU and returns once all CPUs have
    /// acknowledged the flush.
    fn shootdown(&self, space: SpaceId, vaddr: usize);
}
