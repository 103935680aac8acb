// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Global frame -> sharer-count registry for copy-on-write frames
//! OWNERS: @kernel-mm-team
//! PUBLIC API: CowTable, CowFault
//! DEPENDS_ON: hal::PhysicalMemory, hal::FrameReservation
//! INVARIANTS: a registered frame has a count >= 1; registration never exceeds capacity;
//!             a failed add leaves the table unchanged

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{VmError, VmResult};
use crate::hal::{FrameReservation, PhysicalMemory};
use crate::types::FrameNo;

/// Result of resolving a write fault on a copy-on-write frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CowFault {
    /// Frame the faulting page must map writable from now on.
    pub frame: FrameNo,
    /// Frames moved from shared to owned for the faulting space.
    pub converted: usize,
    /// Whether the content was copied into a fresh frame.
    pub copied: bool,
}

pub struct CowTable {
    entries: Mutex<HashMap<FrameNo, usize>>,
    capacity: usize,
}

impl CowTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity }
    }

    /// Registers one more sharer of `frame`.
    pub fn add(&self, frame: FrameNo) -> VmResult<()> {
        self.add_many(frame, 1)
    }

    /// Registers `count` sharers at once; all or nothing.
    pub fn add_many(&self, frame: FrameNo, count: usize) -> VmResult<()> {
        let mut entries = self.entries.lock();
        if let Some(sharers) = entries.get_mut(&frame) {
            *sharers += count;
            return Ok(());
        }
        if entries.len() >= self.capacity || entries.try_reserve(1).is_err() {
            log::warn!(target: "vmm::cow", "cow table full ({} frames)", self.capacity);
            return Err(VmError::OutOfMemory);
        }
        entries.insert(frame, count);
        Ok(())
    }

    /// Drops one sharer. Returns `(freed, others_remain)`: `freed` is 1 when the caller
    /// held the last reference and must release the frame.
    pub fn remove(&self, frame: FrameNo) -> (usize, bool) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&frame) {
            Some(sharers) if *sharers > 1 => {
                *sharers -= 1;
                (0, true)
            }
            Some(_) => {
                entries.remove(&frame);
                (1, false)
            }
            None => (1, false),
        }
    }

    /// Resolves a write fault on `frame`.
    ///
    /// With other sharers left the content is copied into a frame drawn from
    /// `reservation` and one registration is dropped. The last sharer takes the frame
    /// over without copying. Remapping the faulting address is the caller's job.
    pub fn pagefault(
        &self,
        frame: FrameNo,
        memory: &dyn PhysicalMemory,
        reservation: &mut FrameReservation<'_>,
    ) -> VmResult<CowFault> {
        let mut entries = self.entries.lock();
        let sharers = entries.get(&frame).copied().unwrap_or(0);
        if sharers <= 1 {
            entries.remove(&frame);
            log::trace!(target: "vmm::cow", "frame {} taken over by last sharer", frame);
            return Ok(CowFault { frame, converted: 1, copied: false });
        }
        let fresh = reservation.take()?;
        memory.copy_frame(frame, fresh);
        if let Some(count) = entries.get_mut(&frame) {
            *count -= 1;
        }
        log::trace!(target: "vmm::cow", "frame {} copied to {}", frame, fresh);
        Ok(CowFault { frame: fresh, converted: 1, copied: true })
    }

    pub fn sharers(&self, frame: FrameNo) -> usize {
        self.entries.lock().get(&frame).copied().unwrap_or(0)
    }

    /// Number of frames currently registered.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
