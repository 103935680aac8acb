// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory collaborators for host builds and tests
//! OWNERS: @kernel-mm-team
//! PUBLIC API: HostMemory, MemFile, ImmediateShootdown
//! DEPENDS_ON: parking_lot::Mutex
//! INVARIANTS: Double free panics; frames are zeroed on allocation; reserved frames are
//!             invisible to unreserved allocations
//!
//! TEST_SCENARIOS:
//!   - reservation_hides_frames(): reserved frames are not handed out by allocate()
//!   - contiguous_respects_alignment(): contiguous runs honour the requested alignment
//!   - mem_file_counts_io(): MemFile tracks reads and writes

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{FileBackend, PhysicalMemory, TlbShootdown};
use crate::types::{FrameNo, SpaceId, PAGE_SIZE};

/// First frame number handed out (physical 0x8000_0000 on QEMU virt).
const FRAME_BASE: usize = 0x8_0000;

struct FrameBitmap {
    /// One bit per frame, set when allocated.
    words: Vec<u64>,
    total: usize,
    allocated: usize,
    reserved: usize,
    next: usize,
}

impl FrameBitmap {
    fn new(total: usize) -> Self {
        Self { words: vec![0; (total + 63) / 64], total, allocated: 0, reserved: 0, next: 0 }
    }

    #[inline]
    fn is_set(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    fn set(&mut self, index: usize, allocated: bool) {
        if allocated {
            self.words[index / 64] |= 1 << (index % 64);
        } else {
            self.words[index / 64] &= !(1 << (index % 64));
        }
    }

    fn available(&self) -> usize {
        self.total - self.allocated - self.reserved
    }

    fn take_one(&mut self) -> Option<usize> {
        for step in 0..self.total {
            let index = (self.next + step) % self.total;
            if !self.is_set(index) {
                self.set(index, true);
                self.allocated += 1;
                self.next = (index + 1) % self.total;
                return Some(index);
            }
        }
        None
    }

    fn take_run(&mut self, count: usize, align: usize) -> Option<usize> {
        let align = align.max(1);
        let mut start = 0;
        while start + count <= self.total {
            if (FRAME_BASE + start) % align != 0 {
                start += 1;
                continue;
            }
            match (start..start + count).find(|&i| self.is_set(i)) {
                Some(busy) => start = busy + 1,
                None => {
                    for index in start..start + count {
                        self.set(index, true);
                    }
                    self.allocated += count;
                    return Some(start);
                }
            }
        }
        None
    }
}

/// Physical memory simulated with heap-backed frames.
pub struct HostMemory {
    bitmap: Mutex<FrameBitmap>,
    frames: Vec<Mutex<Box<[u8]>>>,
}

impl HostMemory {
    pub fn new(frame_count: usize) -> Self {
        let frames = (0..frame_count).map(|_| Mutex::new(Box::<[u8]>::default())).collect();
        Self { bitmap: Mutex::new(FrameBitmap::new(frame_count)), frames }
    }

    /// Frames currently allocated.
    pub fn allocated(&self) -> usize {
        self.bitmap.lock().allocated
    }

    /// Frames currently held in reservations.
    pub fn reserved(&self) -> usize {
        self.bitmap.lock().reserved
    }

    pub fn is_allocated(&self, frame: FrameNo) -> bool {
        match self.index_of(frame) {
            Some(index) => self.bitmap.lock().is_set(index),
            None => false,
        }
    }

    fn index_of(&self, frame: FrameNo) -> Option<usize> {
        frame
            .raw()
            .checked_sub(FRAME_BASE)
            .filter(|index| *index < self.frames.len())
    }

    fn frame_slot(&self, frame: FrameNo) -> &Mutex<Box<[u8]>> {
        match self.index_of(frame) {
            Some(index) => &self.frames[index],
            None => panic!("frame {} outside host memory", frame),
        }
    }

    fn prepare(&self, index: usize) -> FrameNo {
        let mut data = self.frames[index].lock();
        if data.len() != PAGE_SIZE {
            *data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        } else {
            data.fill(0);
        }
        FrameNo::new(FRAME_BASE + index)
    }
}

impl PhysicalMemory for HostMemory {
    fn allocate(&self) -> Option<FrameNo> {
        let index = {
            let mut bitmap = self.bitmap.lock();
            if bitmap.available() == 0 {
                return None;
            }
            bitmap.take_one()?
        };
        Some(self.prepare(index))
    }

    fn allocate_contiguous(&self, count: usize, align: usize) -> Option<FrameNo> {
        if count == 0 {
            return None;
        }
        let start = {
            let mut bitmap = self.bitmap.lock();
            if bitmap.available() < count {
                return None;
            }
            bitmap.take_run(count, align)?
        };
        for index in start..start + count {
            self.prepare(index);
        }
        Some(FrameNo::new(FRAME_BASE + start))
    }

    fn free(&self, frame: FrameNo) {
        let index = match self.index_of(frame) {
            Some(index) => index,
            None => panic!("free of frame {} outside host memory", frame),
        };
        let mut bitmap = self.bitmap.lock();
        if !bitmap.is_set(index) {
            panic!("double free of frame {}", frame);
        }
        bitmap.set(index, false);
        bitmap.allocated -= 1;
    }

    fn available(&self) -> usize {
        self.bitmap.lock().available()
    }

    fn try_reserve(&self, count: usize) -> bool {
        let mut bitmap = self.bitmap.lock();
        if bitmap.available() < count {
            return false;
        }
        bitmap.reserved += count;
        true
    }

    fn unreserve(&self, count: usize) {
        let mut bitmap = self.bitmap.lock();
        bitmap.reserved = bitmap.reserved.saturating_sub(count);
    }

    fn allocate_reserved(&self) -> Option<FrameNo> {
        let index = {
            let mut bitmap = self.bitmap.lock();
            if bitmap.reserved == 0 {
                return None;
            }
            let index = bitmap.take_one()?;
            bitmap.reserved -= 1;
            index
        };
        Some(self.prepare(index))
    }

    fn read_frame(&self, frame: FrameNo, offset: usize, buf: &mut [u8]) {
        let data = self.frame_slot(frame).lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    fn write_frame(&self, frame: FrameNo, offset: usize, src: &[u8]) {
        let mut data = self.frame_slot(frame).lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    fn zero_frame(&self, frame: FrameNo) {
        self.frame_slot(frame).lock().fill(0);
    }
}

/// Growable in-memory file with I/O accounting and failure injection.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: Vec<u8>) -> Self {
        Self { data: Mutex::new(contents), ..Self::default() }
    }

    /// Number of `read_at` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write_at` calls served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl FileBackend for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock();
        let start = offset as usize;
        if data.len() < start + src.len() {
            data.resize(start + src.len(), 0);
        }
        data[start..start + src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

#[cfg(unix)]
impl FileBackend for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, data, offset)
    }
}

/// Single-CPU shootdown: the local flush is the only acknowledgement needed.
#[derive(Default)]
pub struct ImmediateShootdown {
    flushes: AtomicUsize,
}

impl ImmediateShootdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl TlbShootdown for ImmediateShootdown {
    fn shootdown(&self, _space: SpaceId, _vaddr: usize) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}
